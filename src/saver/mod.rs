//! Collection saver
//!
//! Persists one collection: resolves its references, partitions the
//! incoming records against stored rows into creates, updates and deletes,
//! writes them according to the collection's saver strategy and copies the
//! resulting ids back onto the records.

pub mod resolve;

use crate::collection::{Collection, DeletionScope, RetentionStrategy, SaverStrategy};
use crate::index::IdIndex;
use crate::record::IdentityKey;
use crate::storage::{RecordStore, RowWrite, StoredRecord};
use crate::value::RecordId;
use crate::Result;
use chrono::{DateTime, Utc};
use resolve::{resolve_collection, Prepared, Resolver};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::AddAssign;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct SaveOptions {
    pub batch_size: usize,
    pub assert_referential_integrity: bool,
    /// Written as `last_seen_at`; also the fallback `resource_timestamp`
    pub saved_at: DateTime<Utc>,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            assert_referential_integrity: false,
            saved_at: Utc::now(),
        }
    }
}

/// Row counts of one or more saves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaveStats {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub archived: usize,
    pub skipped: usize,
    pub deferred: usize,
    /// Rows rewritten by the deferred pass
    pub patched: usize,
    pub unconnected: usize,
}

impl SaveStats {
    /// Rows written or removed
    pub fn changes(&self) -> usize {
        self.created + self.updated + self.deleted + self.archived + self.patched
    }
}

impl AddAssign for SaveStats {
    fn add_assign(&mut self, other: Self) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
        self.archived += other.archived;
        self.skipped += other.skipped;
        self.deferred += other.deferred;
        self.patched += other.patched;
        self.unconnected += other.unconnected;
    }
}

impl std::fmt::Display for SaveStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created {}, updated {}, unchanged {}, deleted {}, archived {}, patched {}, skipped {}",
            self.created,
            self.updated,
            self.unchanged,
            self.deleted,
            self.archived,
            self.patched,
            self.skipped
        )
    }
}

/// A reference that could not be resolved at save time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnconnectedEdge {
    pub collection: String,
    pub attribute: String,
    pub identity: String,
    pub reference: String,
}

/// Result of saving one collection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SaveOutcome {
    pub stats: SaveStats,
    pub unconnected: Vec<UnconnectedEdge>,
}

impl AddAssign for SaveOutcome {
    fn add_assign(&mut self, other: Self) {
        self.stats += other.stats;
        self.unconnected.extend(other.unconnected);
    }
}

/// Everything a custom saver may use.
pub struct SaveContext<'a> {
    pub collection: &'a mut Collection,
    pub store: &'a dyn RecordStore,
    pub index: &'a IdIndex,
    pub options: &'a SaveOptions,
}

/// Replaces the standard save of one collection.
///
/// Implementations must set `id` on every record they persist.
pub trait CustomSaver: Send + Sync {
    fn save(&self, ctx: &mut SaveContext<'_>) -> Result<SaveStats>;
}

/// Maps create candidates onto existing stored rows.
pub trait CustomReconciler: Send + Sync {
    /// Pairs of incoming identity and the stored id it should update instead
    fn reconnect(
        &self,
        collection: &Collection,
        store: &dyn RecordStore,
        candidates: &[IdentityKey],
    ) -> Result<Vec<(IdentityKey, RecordId)>>;
}

/// Rows to write for one collection.
#[derive(Default)]
struct Partition {
    creates: Vec<(usize, RowWrite)>,
    updates: Vec<(usize, RecordId, RowWrite)>,
    unchanged: Vec<(usize, RecordId)>,
    removals: Vec<RecordId>,
    /// Stored values of pending attributes per prepared record
    baselines: Vec<(usize, serde_json::Map<String, serde_json::Value>)>,
}

pub struct CollectionSaver<'a> {
    store: &'a dyn RecordStore,
    options: &'a SaveOptions,
}

impl<'a> CollectionSaver<'a> {
    pub fn new(store: &'a dyn RecordStore, options: &'a SaveOptions) -> Self {
        Self { store, options }
    }

    /// Save one collection; a collection already marked saved is left alone
    pub fn save(
        &self,
        collection: &mut Collection,
        index: &IdIndex,
        deferred: &BTreeSet<String>,
    ) -> Result<SaveOutcome> {
        if collection.is_saved() {
            debug!(collection = collection.name(), "Already saved");
            return Ok(SaveOutcome::default());
        }
        if collection.definition().strategy.is_read_only() {
            collection.mark_saved();
            return Ok(SaveOutcome::default());
        }
        if let Some(custom) = collection.custom_saver() {
            let mut ctx = SaveContext {
                collection: &mut *collection,
                store: self.store,
                index,
                options: self.options,
            };
            let stats = custom.save(&mut ctx)?;
            collection.mark_saved();
            return Ok(SaveOutcome {
                stats,
                unconnected: Vec::new(),
            });
        }

        let resolver = Resolver { index, store: self.store };
        let resolution = resolve_collection(collection, &resolver, deferred, self.options)?;
        let partition = self.partition(collection, &resolution.prepared)?;

        let mut stats = SaveStats {
            skipped: resolution.skipped,
            deferred: resolution.deferred,
            unconnected: resolution.unconnected.len(),
            unchanged: partition.unchanged.len(),
            ..SaveStats::default()
        };

        let created_ids = self.write(collection, &partition, &mut stats)?;

        let mut ids: Vec<(usize, RecordId)> = partition.creates.iter().map(|(i, _)| *i).zip(created_ids).collect();
        ids.extend(partition.updates.iter().map(|(i, id, _)| (*i, *id)));
        ids.extend(partition.unchanged.iter().copied());
        for (i, id) in ids {
            if let Some(record) = collection.record_mut(&resolution.prepared[i].slot) {
                record.id = Some(id);
            }
        }
        for (i, baseline) in partition.baselines {
            if let Some(record) = collection.record_mut(&resolution.prepared[i].slot) {
                record.pending_baseline = baseline;
            }
        }
        collection.mark_saved();

        debug!(collection = collection.name(), stats = %stats, "Saved collection");
        Ok(SaveOutcome {
            stats,
            unconnected: resolution.unconnected,
        })
    }

    fn partition(&self, collection: &Collection, prepared: &[Prepared]) -> Result<Partition> {
        let name = collection.name();
        let scope = collection.deletion_scope();
        let incoming: Vec<IdentityKey> = prepared.iter().map(|p| p.identity.clone()).collect();

        let stored_rows = match scope {
            DeletionScope::AllAbsent | DeletionScope::Authoritative(_) => self.store.all_records(name)?,
            DeletionScope::Targeted(targeted) => {
                let mut keys: BTreeSet<IdentityKey> = incoming.iter().cloned().collect();
                keys.extend(targeted.iter().cloned());
                self.store.find_by_identities(name, &keys.into_iter().collect::<Vec<_>>())?
            }
            DeletionScope::None => self.store.find_by_identities(name, &incoming)?,
        };
        let stored: HashMap<&IdentityKey, &StoredRecord> = stored_rows.iter().map(|r| (&r.identity, r)).collect();

        let mut partition = Partition::default();
        let mut matched: HashSet<RecordId> = HashSet::new();
        let mut candidates = Vec::new();

        for (i, record) in prepared.iter().enumerate() {
            let row = RowWrite {
                identity: record.identity.clone(),
                attributes: record.attributes.clone(),
                resource_timestamp: record.resource_timestamp,
                seen_at: self.options.saved_at,
            };
            match stored.get(&record.identity) {
                Some(existing) => {
                    matched.insert(existing.id);
                    partition.baselines.push((i, baseline(record, existing)));
                    self.classify(collection, &mut partition, i, existing, row);
                }
                None => candidates.push((i, row)),
            }
        }

        if let (Some(reconciler), false) = (collection.custom_reconciler(), candidates.is_empty()) {
            let keys: Vec<IdentityKey> = candidates.iter().map(|(_, row)| row.identity.clone()).collect();
            let reconnected: HashMap<IdentityKey, RecordId> =
                reconciler.reconnect(collection, self.store, &keys)?.into_iter().collect();
            let by_id: HashMap<RecordId, &StoredRecord> = stored_rows.iter().map(|r| (r.id, r)).collect();

            for (i, row) in std::mem::take(&mut candidates) {
                match reconnected.get(&row.identity) {
                    Some(&id) if !matched.contains(&id) => {
                        debug!(collection = name, identity = %row.identity, id, "Reconnected record");
                        matched.insert(id);
                        if let Some(existing) = by_id.get(&id) {
                            partition.baselines.push((i, baseline(&prepared[i], existing)));
                        }
                        let mut attributes = by_id.get(&id).map(|r| r.attributes.clone()).unwrap_or_default();
                        attributes.extend(row.attributes);
                        partition.updates.push((i, id, RowWrite { attributes, ..row }));
                    }
                    _ => candidates.push((i, row)),
                }
            }
        }
        partition.creates = candidates;

        partition.removals = stored_rows
            .iter()
            .filter(|r| !r.archived && !matched.contains(&r.id) && scope.allows(&r.identity))
            .map(|r| r.id)
            .collect();

        Ok(partition)
    }

    fn classify(
        &self,
        collection: &Collection,
        partition: &mut Partition,
        i: usize,
        existing: &StoredRecord,
        mut row: RowWrite,
    ) {
        let mut merged = existing.attributes.clone();
        merged.extend(std::mem::take(&mut row.attributes));
        let changed = merged != existing.attributes || existing.archived;
        row.attributes = merged;

        if collection.definition().check_changed && !changed {
            partition.unchanged.push((i, existing.id));
        } else {
            partition.updates.push((i, existing.id, row));
        }
    }

    /// Write a partition; returns created ids in `creates` order
    fn write(&self, collection: &Collection, partition: &Partition, stats: &mut SaveStats) -> Result<Vec<RecordId>> {
        let name = collection.name();
        let definition = collection.definition();
        let batch_size = self.options.batch_size.max(1);
        let creates: Vec<RowWrite> = partition.creates.iter().map(|(_, row)| row.clone()).collect();
        let updates: Vec<(RecordId, RowWrite)> =
            partition.updates.iter().map(|(_, id, row)| (*id, row.clone())).collect();
        let unchanged: Vec<RecordId> = partition.unchanged.iter().map(|(_, id)| *id).collect();

        let mut created_ids = Vec::with_capacity(creates.len());
        match definition.saver_strategy {
            SaverStrategy::Default => {
                self.in_transaction(|| {
                    created_ids = self.store.insert_batch(name, &creates)?;
                    self.store.update_batch(name, &updates)?;
                    self.store.touch(name, &unchanged, self.options.saved_at)?;
                    self.remove(collection, &partition.removals, stats)
                })?;
            }
            SaverStrategy::Batch => {
                for chunk in creates.chunks(batch_size) {
                    created_ids.extend(self.in_transaction(|| self.store.insert_batch(name, chunk))?);
                }
                for chunk in updates.chunks(batch_size) {
                    self.in_transaction(|| self.store.update_batch(name, chunk))?;
                }
                self.store.touch(name, &unchanged, self.options.saved_at)?;
                for chunk in partition.removals.chunks(batch_size) {
                    self.in_transaction(|| self.remove(collection, chunk, stats))?;
                }
            }
            SaverStrategy::ConcurrentSafeBatch => {
                for chunk in creates.chunks(batch_size) {
                    created_ids.extend(self.in_transaction(|| self.store.upsert_batch(name, chunk))?);
                }
                let rows: Vec<RowWrite> = updates.iter().map(|(_, row)| row.clone()).collect();
                for chunk in rows.chunks(batch_size) {
                    self.in_transaction(|| self.store.upsert_batch(name, chunk))?;
                }
                self.store.touch(name, &unchanged, self.options.saved_at)?;
                for chunk in partition.removals.chunks(batch_size) {
                    self.in_transaction(|| self.remove(collection, chunk, stats))?;
                }
            }
        }

        stats.created += creates.len();
        stats.updated += updates.len();
        Ok(created_ids)
    }

    fn remove(&self, collection: &Collection, ids: &[RecordId], stats: &mut SaveStats) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        match collection.definition().retention_strategy {
            RetentionStrategy::Destroy => stats.deleted += self.store.delete_batch(collection.name(), ids)?,
            RetentionStrategy::Archive => {
                stats.archived += self.store.archive_batch(collection.name(), ids, self.options.saved_at)?
            }
        }
        Ok(())
    }

    fn in_transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.store.begin()?;
        match f() {
            Ok(value) => {
                self.store.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.store.rollback() {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(err)
            }
        }
    }

    /// Resolve and patch every pending attribute of a saved collection.
    ///
    /// Attributes whose resolved value is already stored are not rewritten.
    pub fn save_deferred(&self, collection: &mut Collection, index: &IdIndex) -> Result<SaveOutcome> {
        let name = collection.name().to_string();
        let resolver = Resolver { index, store: self.store };
        let mut patches: Vec<(RecordId, serde_json::Map<String, serde_json::Value>)> = Vec::new();
        let mut outcome = SaveOutcome::default();

        for record in collection.records_mut() {
            let Some(id) = record.id else {
                record.pending.clear();
                continue;
            };
            if record.pending.is_empty() {
                continue;
            }
            let baseline = std::mem::take(&mut record.pending_baseline);
            let mut patch = serde_json::Map::new();
            for attr in std::mem::take(&mut record.pending) {
                let Some(value) = record.attributes.get(&attr) else { continue };
                match resolver.resolve(value)? {
                    Some(resolved) => {
                        if let Some(json) = resolved.to_json() {
                            if baseline.get(&attr) != Some(&json) {
                                patch.insert(attr.clone(), json);
                            }
                        }
                        record.attributes.insert(attr, resolved);
                    }
                    None => {
                        let reference = value.references().first().map(|r| r.describe()).unwrap_or_default();
                        if self.options.assert_referential_integrity {
                            return Err(crate::Error::Unresolved(format!("{}.{} -> {}", name, attr, reference)));
                        }
                        outcome.unconnected.push(UnconnectedEdge {
                            collection: name.clone(),
                            attribute: attr,
                            identity: id.to_string(),
                            reference,
                        });
                    }
                }
            }
            if !patch.is_empty() {
                patches.push((id, patch));
            }
        }

        if !patches.is_empty() {
            self.in_transaction(|| {
                for (id, patch) in &patches {
                    self.store.patch_attributes(&name, *id, patch)?;
                }
                Ok(())
            })?;
        }
        outcome.stats.patched = patches.len();
        outcome.stats.unconnected = outcome.unconnected.len();
        Ok(outcome)
    }
}

/// Stored values of the attributes `record` leaves for the deferred pass
fn baseline(record: &Prepared, stored: &StoredRecord) -> serde_json::Map<String, serde_json::Value> {
    record
        .pending
        .iter()
        .filter_map(|attr| stored.attributes.get(attr).map(|value| (attr.clone(), value.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::CollectionDefinition;
    use crate::record::Record;
    use crate::storage::SqliteStore;
    use crate::value::{LazyRef, Value};
    use std::sync::Arc;

    fn vms(names: &[&str], definition: CollectionDefinition) -> Collection {
        let mut vms = Collection::new(definition).unwrap();
        for name in names {
            vms.push(Record::new().with("ems_ref", *name).with("name", format!("vm {}", name)))
                .unwrap();
        }
        vms
    }

    fn save(store: &SqliteStore, collection: &mut Collection) -> SaveStats {
        let options = SaveOptions::default();
        let index = IdIndex::new();
        CollectionSaver::new(store, &options)
            .save(collection, &index, &BTreeSet::new())
            .unwrap()
            .stats
    }

    fn stored_keys(store: &SqliteStore) -> Vec<String> {
        store
            .all_records("vms")
            .unwrap()
            .iter()
            .filter(|r| !r.archived)
            .map(|r| r.identity.to_string())
            .collect()
    }

    #[test]
    fn test_complete_refresh_reconciles() {
        let store = SqliteStore::open_in_memory().unwrap();
        save(&store, &mut vms(&["A", "B", "C"], CollectionDefinition::new("vms", ["ems_ref"])));

        let stats = save(&store, &mut vms(&["A", "C", "D"], CollectionDefinition::new("vms", ["ems_ref"])));
        assert_eq!(stats.created, 1);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.unchanged, 2);
        assert_eq!(stored_keys(&store), vec!["A", "C", "D"]);
    }

    #[test]
    fn test_targeted_refresh_never_deletes_outside_scope() {
        let store = SqliteStore::open_in_memory().unwrap();
        save(&store, &mut vms(&["A", "B", "C"], CollectionDefinition::new("vms", ["ems_ref"])));

        let mut targeted = vms(&["A", "C", "D"], CollectionDefinition::new("vms", ["ems_ref"]));
        targeted
            .target(["A", "C", "D"].iter().map(|k| IdentityKey::new([*k])))
            .unwrap();
        let stats = save(&store, &mut targeted);
        assert_eq!(stats.deleted, 0);
        assert_eq!(stored_keys(&store), vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_targeted_refresh_deletes_absent_scope_members() {
        let store = SqliteStore::open_in_memory().unwrap();
        save(&store, &mut vms(&["A", "B", "C"], CollectionDefinition::new("vms", ["ems_ref"])));

        let mut targeted = vms(&["A"], CollectionDefinition::new("vms", ["ems_ref"]));
        targeted.target(["A", "B"].iter().map(|k| IdentityKey::new([*k]))).unwrap();
        let stats = save(&store, &mut targeted);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stored_keys(&store), vec!["A", "C"]);
    }

    #[test]
    fn test_all_known_identities_are_authoritative() {
        let store = SqliteStore::open_in_memory().unwrap();
        save(&store, &mut vms(&["A", "B", "C"], CollectionDefinition::new("vms", ["ems_ref"])));

        let mut partial = vms(&["A"], CollectionDefinition::new("vms", ["ems_ref"]));
        partial.target([IdentityKey::new(["A"])]).unwrap();
        partial
            .set_all_known_identities(["A", "B"].iter().map(|k| IdentityKey::new([*k])))
            .unwrap();
        let stats = save(&store, &mut partial);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stored_keys(&store), vec!["A", "B"]);
    }

    #[test]
    fn test_incomplete_collection_deletes_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        save(&store, &mut vms(&["A", "B"], CollectionDefinition::new("vms", ["ems_ref"])));
        let stats = save(&store, &mut vms(&["A"], CollectionDefinition::new("vms", ["ems_ref"]).complete(false)));
        assert_eq!(stats.deleted, 0);
        assert_eq!(stored_keys(&store).len(), 2);
    }

    #[test]
    fn test_second_save_is_idempotent() {
        for strategy in SaverStrategy::all() {
            let store = SqliteStore::open_in_memory().unwrap();
            let definition = CollectionDefinition::new("vms", ["ems_ref"]).saver_strategy(*strategy);
            let first = save(&store, &mut vms(&["A", "B"], definition.clone()));
            assert_eq!(first.created, 2, "{}", strategy);

            let second = save(&store, &mut vms(&["A", "B"], definition));
            assert_eq!(second.changes(), 0, "{}", strategy);
            assert_eq!(second.unchanged, 2, "{}", strategy);
        }
    }

    #[test]
    fn test_null_attribute_is_stored_and_stays_unchanged() {
        for strategy in SaverStrategy::all() {
            let store = SqliteStore::open_in_memory().unwrap();
            let definition = CollectionDefinition::new("vms", ["ems_ref"]).saver_strategy(*strategy);
            let described = |description: Value| {
                let mut vms = Collection::new(definition.clone()).unwrap();
                vms.push(Record::new().with("ems_ref", "A").with("description", description))
                    .unwrap();
                vms
            };

            save(&store, &mut described(Value::from("x")));
            let cleared = save(&store, &mut described(Value::Null));
            assert_eq!(cleared.updated, 1, "{}", strategy);
            let again = save(&store, &mut described(Value::Null));
            assert_eq!(again.updated, 0, "{}", strategy);
            assert_eq!(again.unchanged, 1, "{}", strategy);

            let stored = &store.all_records("vms").unwrap()[0];
            assert_eq!(stored.attributes.get("description"), Some(&serde_json::Value::Null), "{}", strategy);
        }
    }

    #[test]
    fn test_update_merges_attributes_and_backfills_ids() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut first = Collection::new(CollectionDefinition::new("vms", ["ems_ref"])).unwrap();
        first.push(Record::new().with("ems_ref", "A").with("name", "a").with("cpus", 2i64)).unwrap();
        save(&store, &mut first);

        let mut second = Collection::new(CollectionDefinition::new("vms", ["ems_ref"])).unwrap();
        second.push(Record::new().with("ems_ref", "A").with("name", "renamed")).unwrap();
        let stats = save(&store, &mut second);
        assert_eq!(stats.updated, 1);
        assert_eq!(second.records()[0].id, first.records()[0].id);

        let stored = &store.all_records("vms").unwrap()[0];
        assert_eq!(stored.attributes["name"], serde_json::json!("renamed"));
        assert_eq!(stored.attributes["cpus"], serde_json::json!(2));
    }

    #[test]
    fn test_archive_retention_and_revival() {
        let store = SqliteStore::open_in_memory().unwrap();
        let definition = CollectionDefinition::new("vms", ["ems_ref"]).retention(RetentionStrategy::Archive);
        save(&store, &mut vms(&["A", "B"], definition.clone()));

        let stats = save(&store, &mut vms(&["A"], definition.clone()));
        assert_eq!(stats.archived, 1);
        assert_eq!(stored_keys(&store), vec!["A"]);

        let stats = save(&store, &mut vms(&["A", "B"], definition));
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.created, 0);
        assert_eq!(stored_keys(&store), vec!["A", "B"]);
    }

    #[test]
    fn test_saved_collection_is_skipped() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut collection = vms(&["A"], CollectionDefinition::new("vms", ["ems_ref"]));
        assert_eq!(save(&store, &mut collection).created, 1);
        assert_eq!(save(&store, &mut collection), SaveStats::default());
    }

    struct CountingSaver;

    impl CustomSaver for CountingSaver {
        fn save(&self, ctx: &mut SaveContext<'_>) -> Result<SaveStats> {
            for record in ctx.collection.records_mut() {
                record.id = Some(1);
            }
            Ok(SaveStats {
                created: ctx.collection.len(),
                ..SaveStats::default()
            })
        }
    }

    #[test]
    fn test_custom_saver_replaces_save() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut collection =
            vms(&["A", "B"], CollectionDefinition::new("vms", ["ems_ref"])).with_custom_saver(Arc::new(CountingSaver));
        let stats = save(&store, &mut collection);
        assert_eq!(stats.created, 2);
        assert!(collection.is_saved());
        assert!(store.all_records("vms").unwrap().is_empty());
    }

    struct RenameReconciler;

    impl CustomReconciler for RenameReconciler {
        fn reconnect(
            &self,
            collection: &Collection,
            store: &dyn RecordStore,
            candidates: &[IdentityKey],
        ) -> Result<Vec<(IdentityKey, RecordId)>> {
            let stored = store.all_records(collection.name())?;
            Ok(candidates
                .iter()
                .filter_map(|key| {
                    let old = IdentityKey::new([key.fragments()[0].trim_end_matches("-new")]);
                    stored.iter().find(|r| r.identity == old).map(|r| (key.clone(), r.id))
                })
                .collect())
        }
    }

    #[test]
    fn test_reconciler_turns_creates_into_updates() {
        let store = SqliteStore::open_in_memory().unwrap();
        save(&store, &mut vms(&["A"], CollectionDefinition::new("vms", ["ems_ref"])));

        let mut renamed = vms(&["A-new"], CollectionDefinition::new("vms", ["ems_ref"]))
            .with_custom_reconciler(Arc::new(RenameReconciler));
        let stats = save(&store, &mut renamed);
        assert_eq!(stats.created, 0);
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.deleted, 0);
        assert_eq!(stored_keys(&store), vec!["A-new"]);
    }

    #[test]
    fn test_deferred_pass_patches_self_reference() {
        let store = SqliteStore::open_in_memory().unwrap();
        let options = SaveOptions::default();
        let saver = CollectionSaver::new(&store, &options);

        let mut vms = Collection::new(CollectionDefinition::new("vms", ["ems_ref"])).unwrap();
        vms.push(Record::new().with("ems_ref", "tpl")).unwrap();
        vms.push(Record::new().with("ems_ref", "vm-1").with("parent", LazyRef::by("vms", "ems_ref", "tpl")))
            .unwrap();

        let mut index = IdIndex::new();
        index.register(&vms);
        let deferred = BTreeSet::from(["parent".to_string()]);
        let outcome = saver.save(&mut vms, &index, &deferred).unwrap();
        assert_eq!(outcome.stats.created, 2);
        assert_eq!(outcome.stats.deferred, 1);

        index.index_collection(&vms);
        let deferred = saver.save_deferred(&mut vms, &index).unwrap();
        assert_eq!(deferred.stats.patched, 1);

        let template_id = vms.records()[0].id.unwrap();
        let stored = store.find_by_identities("vms", &[IdentityKey::new(["vm-1"])]).unwrap();
        assert_eq!(stored[0].attributes["parent"], serde_json::json!(template_id));
        assert_eq!(vms.records()[1].get("parent"), Some(&Value::resolved(template_id)));
    }
}
