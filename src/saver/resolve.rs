//! Reference resolution for one collection save

use super::{SaveOptions, UnconnectedEdge};
use crate::collection::{Collection, Slot};
use crate::index::{describe_lookup, IdIndex};
use crate::record::IdentityKey;
use crate::storage::{parse_timestamp, RecordStore};
use crate::value::{LazyRef, RecordId, Reference, Value};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::debug;

/// Attribute carrying the provider-side modification time
pub const RESOURCE_TIMESTAMP: &str = "resource_timestamp";

/// Resolves lazy references through the id index, querying storage for
/// targets whose strategy allows it.
pub struct Resolver<'a> {
    pub index: &'a IdIndex,
    pub store: &'a dyn RecordStore,
}

impl Resolver<'_> {
    pub fn lookup(&self, reference: &LazyRef) -> Result<Option<RecordId>> {
        if let Some(id) = self.index.lookup(reference) {
            return Ok(Some(id));
        }
        let queries_storage = self
            .index
            .strategy_of(&reference.collection)
            .is_some_and(|strategy| strategy.queries_storage());
        if !queries_storage {
            return Ok(None);
        }

        let mut lookup = Vec::with_capacity(reference.key.len());
        for (attr, value) in &reference.key {
            match self.resolve(value)?.and_then(|v| v.to_json()) {
                Some(json) => lookup.push((attr.clone(), json)),
                None => return Ok(None),
            }
        }
        let found = self.store.find_id_by_attributes(&reference.collection, &lookup)?;
        debug!(
            collection = %reference.collection,
            lookup = %describe_lookup(&lookup),
            found = found.is_some(),
            "Storage lookup"
        );
        Ok(found)
    }

    /// Copy of `value` with every reference resolved, `None` if any is dangling
    pub fn resolve(&self, value: &Value) -> Result<Option<Value>> {
        Ok(match value {
            Value::Ref(Reference::Unresolved(lazy)) => self.lookup(lazy)?.map(Value::resolved),
            Value::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    match self.resolve(item)? {
                        Some(v) => resolved.push(v),
                        None => return Ok(None),
                    }
                }
                Some(Value::List(resolved))
            }
            Value::Map(map) => {
                let mut resolved = std::collections::BTreeMap::new();
                for (k, v) in map {
                    match self.resolve(v)? {
                        Some(v) => {
                            resolved.insert(k.clone(), v);
                        }
                        None => return Ok(None),
                    }
                }
                Some(Value::Map(resolved))
            }
            other => Some(other.clone()),
        })
    }
}

/// A record ready for partitioning.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub slot: Slot,
    pub identity: IdentityKey,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub resource_timestamp: DateTime<Utc>,
    /// Attributes left for the deferred pass
    pub pending: BTreeSet<String>,
}

/// Outcome of resolving one collection.
#[derive(Debug, Default)]
pub struct Resolution {
    pub prepared: Vec<Prepared>,
    pub skipped: usize,
    pub deferred: usize,
    pub unconnected: Vec<UnconnectedEdge>,
}

/// Resolve every record of `collection` in place.
///
/// Deferred attributes and unresolved transitive attributes are left on the
/// record as pending; identity and required attributes must resolve or the
/// record is skipped.
pub fn resolve_collection(
    collection: &mut Collection,
    resolver: &Resolver<'_>,
    deferred: &BTreeSet<String>,
    options: &SaveOptions,
) -> Result<Resolution> {
    let mut resolution = Resolution::default();
    let name = collection.name().to_string();
    let manager_ref = collection.manager_ref().to_vec();
    let required = collection.definition().required_references.clone();
    let transitive = collection.transitive_attributes().clone();
    let slots: Vec<Slot> = collection.entries().into_iter().map(|(slot, _, _)| slot).collect();

    for slot in slots {
        let Some(record) = collection.record_mut(&slot) else {
            continue;
        };
        record.pending.clear();
        record.pending_baseline.clear();
        let mut attributes = serde_json::Map::new();
        let mut dangling: Vec<(String, String)> = Vec::new();
        let mut skip = false;

        let names: Vec<String> = record.attributes.keys().cloned().collect();
        for attr in names {
            let Some(value) = record.attributes.get(&attr) else { continue };
            if !value.has_references() {
                if let Some(json) = value.to_json() {
                    attributes.insert(attr, json);
                }
                continue;
            }

            let identity_attr = manager_ref.contains(&attr);
            if deferred.contains(&attr) && !identity_attr {
                record.pending.insert(attr);
                continue;
            }

            match resolver.resolve(value)? {
                Some(resolved) => {
                    if let Some(json) = resolved.to_json() {
                        attributes.insert(attr.clone(), json);
                    }
                    record.attributes.insert(attr, resolved);
                }
                None if transitive.contains(&attr) && !identity_attr && !required.contains(&attr) => {
                    record.pending.insert(attr);
                }
                None => {
                    let reference = value
                        .references()
                        .first()
                        .map(|r| r.describe())
                        .unwrap_or_default();
                    if identity_attr || required.contains(&attr) {
                        skip = true;
                    } else {
                        attributes.insert(attr.clone(), serde_json::Value::Null);
                    }
                    dangling.push((attr, reference));
                }
            }
        }

        let identity = record.identity(&manager_ref)?;
        for (attribute, reference) in dangling {
            if options.assert_referential_integrity {
                return Err(Error::Unresolved(format!(
                    "{}.{} of {} -> {}",
                    name, attribute, identity, reference
                )));
            }
            resolution.unconnected.push(UnconnectedEdge {
                collection: name.clone(),
                attribute,
                identity: identity.to_string(),
                reference,
            });
        }

        if skip {
            record.pending.clear();
            resolution.skipped += 1;
            continue;
        }
        if !record.pending.is_empty() {
            resolution.deferred += 1;
        }

        let resource_timestamp = record
            .get(RESOURCE_TIMESTAMP)
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .unwrap_or(options.saved_at);

        resolution.prepared.push(Prepared {
            slot,
            identity,
            attributes,
            resource_timestamp,
            pending: record.pending.clone(),
        });
    }

    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionDefinition;
    use crate::record::Record;
    use crate::storage::SqliteStore;

    fn indexed_hosts() -> IdIndex {
        let mut hosts = Collection::new(CollectionDefinition::new("hosts", ["ems_ref"])).unwrap();
        hosts.push(Record::new().with("ems_ref", "h1")).unwrap();
        for record in hosts.records_mut() {
            record.id = Some(5);
        }
        let mut index = IdIndex::new();
        index.register(&hosts);
        index.index_collection(&hosts);
        index
    }

    fn vms(records: Vec<Record>, definition: CollectionDefinition) -> Collection {
        let mut vms = Collection::new(definition).unwrap();
        for record in records {
            vms.push(record).unwrap();
        }
        vms
    }

    #[test]
    fn test_references_resolve_in_place() {
        let store = SqliteStore::open_in_memory().unwrap();
        let index = indexed_hosts();
        let resolver = Resolver { index: &index, store: &store };
        let mut vms = vms(
            vec![Record::new().with("ems_ref", "vm-1").with("host", LazyRef::by("hosts", "ems_ref", "h1"))],
            CollectionDefinition::new("vms", ["ems_ref"]),
        );

        let resolution = resolve_collection(&mut vms, &resolver, &BTreeSet::new(), &SaveOptions::default()).unwrap();
        assert_eq!(resolution.prepared.len(), 1);
        assert_eq!(resolution.prepared[0].attributes["host"], serde_json::json!(5));
        assert_eq!(vms.records()[0].get("host"), Some(&Value::resolved(5)));
    }

    #[test]
    fn test_deferred_attribute_stays_pending() {
        let store = SqliteStore::open_in_memory().unwrap();
        let index = indexed_hosts();
        let resolver = Resolver { index: &index, store: &store };
        let mut vms = vms(
            vec![Record::new().with("ems_ref", "vm-1").with("host", LazyRef::by("hosts", "ems_ref", "h1"))],
            CollectionDefinition::new("vms", ["ems_ref"]),
        );
        let deferred = BTreeSet::from(["host".to_string()]);

        let resolution = resolve_collection(&mut vms, &resolver, &deferred, &SaveOptions::default()).unwrap();
        assert_eq!(resolution.deferred, 1);
        assert!(!resolution.prepared[0].attributes.contains_key("host"));
        assert!(vms.records()[0].pending_attributes().contains("host"));
    }

    #[test]
    fn test_dangling_references() {
        let store = SqliteStore::open_in_memory().unwrap();
        let index = indexed_hosts();
        let resolver = Resolver { index: &index, store: &store };
        let definition = CollectionDefinition::new("vms", ["ems_ref"]).require("flavor");
        let mut vms = vms(
            vec![
                Record::new().with("ems_ref", "vm-1").with("host", LazyRef::by("hosts", "ems_ref", "h9")),
                Record::new().with("ems_ref", "vm-2").with("flavor", LazyRef::by("hosts", "ems_ref", "h9")),
            ],
            definition.clone(),
        );

        let resolution = resolve_collection(&mut vms, &resolver, &BTreeSet::new(), &SaveOptions::default()).unwrap();
        assert_eq!(resolution.prepared.len(), 1);
        assert_eq!(resolution.prepared[0].attributes["host"], serde_json::Value::Null);
        assert_eq!(resolution.skipped, 1);
        assert_eq!(resolution.unconnected.len(), 2);

        let strict = SaveOptions {
            assert_referential_integrity: true,
            ..SaveOptions::default()
        };
        let mut vms = vms_clone(definition);
        assert!(matches!(
            resolve_collection(&mut vms, &resolver, &BTreeSet::new(), &strict),
            Err(Error::Unresolved(_))
        ));
    }

    fn vms_clone(definition: CollectionDefinition) -> Collection {
        vms(
            vec![Record::new().with("ems_ref", "vm-1").with("host", LazyRef::by("hosts", "ems_ref", "h9"))],
            definition,
        )
    }

    #[test]
    fn test_resource_timestamp_attribute() {
        let store = SqliteStore::open_in_memory().unwrap();
        let index = IdIndex::new();
        let resolver = Resolver { index: &index, store: &store };
        let mut vms = vms(
            vec![Record::new().with("ems_ref", "vm-1").with(RESOURCE_TIMESTAMP, "2024-05-01T10:00:00Z")],
            CollectionDefinition::new("vms", ["ems_ref"]),
        );
        let resolution = resolve_collection(&mut vms, &resolver, &BTreeSet::new(), &SaveOptions::default()).unwrap();
        assert_eq!(
            resolution.prepared[0].resource_timestamp,
            parse_timestamp("2024-05-01T10:00:00Z").unwrap()
        );
    }
}
