//! Reference and identity indexes
//!
//! [`ReferenceIndex`] is filled per target collection by the scanner and
//! records who references which lookup key. [`IdIndex`] is the run-wide map
//! from `(collection, lookup attributes, key)` to storage id that the saver
//! resolves references against.

use crate::collection::{Collection, Strategy};
use crate::record::IdentityKey;
use crate::storage::StoredRecord;
use crate::value::{json_fragment, LazyRef, RecordId, Reference, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A record holding a reference into the indexed collection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Referrer {
    pub collection: String,
    pub attribute: String,
    pub identity: IdentityKey,
}

/// Lookup sets and keys referenced inside one collection.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    entries: BTreeMap<Vec<String>, BTreeMap<IdentityKey, Vec<Referrer>>>,
}

impl ReferenceIndex {
    pub fn register(&mut self, reference: &LazyRef, referrer: Referrer) {
        let attrs = reference.lookup_attributes();
        let key = IdentityKey::from_values(&attrs, &reference.key).unwrap_or_else(|| IdentityKey(Vec::new()));
        self.entries
            .entry(attrs)
            .or_default()
            .entry(key)
            .or_default()
            .push(referrer);
    }

    /// Distinct attribute sets other collections look records up by
    pub fn lookup_sets(&self) -> impl Iterator<Item = &Vec<String>> {
        self.entries.keys()
    }

    pub fn referrers(&self, attributes: &[String], key: &IdentityKey) -> &[Referrer] {
        self.entries
            .get(attributes)
            .and_then(|keys| keys.get(key))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of distinct referenced keys
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
struct IndexedCollection {
    strategy: Strategy,
    lookup_sets: BTreeSet<Vec<String>>,
}

/// Run-wide map of saved records to their storage ids.
#[derive(Debug, Default)]
pub struct IdIndex {
    ids: HashMap<(String, Vec<String>, IdentityKey), RecordId>,
    collections: HashMap<String, IndexedCollection>,
}

impl IdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember how a collection is looked up; must run after scanning
    pub fn register(&mut self, collection: &Collection) {
        let mut primary = collection.manager_ref().to_vec();
        primary.sort();
        let mut lookup_sets: BTreeSet<Vec<String>> = collection.reference_index().lookup_sets().cloned().collect();
        lookup_sets.insert(primary);
        self.collections.insert(
            collection.name().to_string(),
            IndexedCollection {
                strategy: collection.definition().strategy,
                lookup_sets,
            },
        );
    }

    pub fn strategy_of(&self, collection: &str) -> Option<Strategy> {
        self.collections.get(collection).map(|c| c.strategy)
    }

    /// Index every saved record of a collection under each lookup set
    pub fn index_collection(&mut self, collection: &Collection) -> usize {
        let Some(indexed) = self.collections.get(collection.name()).cloned() else {
            return 0;
        };
        let mut added = 0;
        for (_, record, _) in collection.entries() {
            let Some(id) = record.id else { continue };
            for attrs in &indexed.lookup_sets {
                if let Some(key) = IdentityKey::from_values(attrs, &record.attributes) {
                    self.ids.insert((collection.name().to_string(), attrs.clone(), key), id);
                    added += 1;
                }
            }
        }
        added
    }

    /// Index rows loaded from storage (local_db_cache_all collections)
    pub fn preload(&mut self, collection: &str, rows: &[StoredRecord]) -> usize {
        let Some(indexed) = self.collections.get(collection).cloned() else {
            return 0;
        };
        let mut added = 0;
        for row in rows {
            for attrs in &indexed.lookup_sets {
                if let Some(key) = IdentityKey::from_json(attrs, &row.attributes) {
                    self.ids.insert((collection.to_string(), attrs.clone(), key), row.id);
                    added += 1;
                }
            }
        }
        added
    }

    pub fn insert(&mut self, collection: &str, attributes: Vec<String>, key: IdentityKey, id: RecordId) {
        self.ids.insert((collection.to_string(), attributes, key), id);
    }

    /// Canonical lookup key of a reference, resolving nested references.
    ///
    /// `None` when a nested reference cannot be resolved yet.
    pub fn canonical_key(&self, reference: &LazyRef) -> Option<IdentityKey> {
        reference
            .key
            .values()
            .map(|value| self.resolve_value(value).map(|v| v.identity_fragment()))
            .collect::<Option<Vec<_>>>()
            .map(IdentityKey)
    }

    /// Resolve a reference against the in-memory index only
    pub fn lookup(&self, reference: &LazyRef) -> Option<RecordId> {
        let key = self.canonical_key(reference)?;
        self.ids
            .get(&(reference.collection.clone(), reference.lookup_attributes(), key))
            .copied()
    }

    /// Copy of a value with every resolvable nested reference resolved
    pub fn resolve_value(&self, value: &Value) -> Option<Value> {
        Some(match value {
            Value::Ref(Reference::Unresolved(lazy)) => Value::resolved(self.lookup(lazy)?),
            Value::List(items) => Value::List(items.iter().map(|v| self.resolve_value(v)).collect::<Option<_>>()?),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| self.resolve_value(v).map(|v| (k.clone(), v)))
                    .collect::<Option<_>>()?,
            ),
            other => other.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Fragment form of a JSON lookup value, for diagnostics
pub fn describe_lookup(pairs: &[(String, serde_json::Value)]) -> String {
    pairs
        .iter()
        .map(|(attr, value)| format!("{}={}", attr, json_fragment(value)))
        .collect::<Vec<_>>()
        .join(",")
}
