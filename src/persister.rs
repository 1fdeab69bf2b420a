//! Persister - the full save pipeline of one refresh part
//!
//! scan -> graph -> cycle resolution -> schedule -> layered save -> deferred pass.
//!
//! Layers run strictly one after another. Within a layer, `persist_parallel`
//! splits the collections across scoped worker threads, each with its own
//! store connection; the id index built from earlier layers is shared
//! read-only and extended between layers.

use crate::collection::{Collection, CollectionSet, Strategy};
use crate::config::RefreshConfig;
use crate::graph::{DependencyGraph, FeedbackEdge, ResolvedGraph};
use crate::index::IdIndex;
use crate::saver::{CollectionSaver, SaveOptions, SaveOutcome, SaveStats, UnconnectedEdge};
use crate::scanner::{DependencyScanner, ScanReport, UnconnectedReference};
use crate::scheduler::Schedule;
use crate::storage::RecordStore;
use crate::ui::{ProgressMessage, ProgressPhase};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use crossbeam::channel::Sender;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Opens one store connection per worker thread
pub type StoreConnector = dyn Fn() -> Result<Box<dyn RecordStore>> + Send + Sync;

#[derive(Debug, Clone)]
pub struct PersistOptions {
    pub batch_size: usize,
    pub workers: usize,
    pub assert_graph_integrity: bool,
    pub assert_referential_integrity: bool,
    /// Fixed save time; defaults to the start of `persist`
    pub saved_at: Option<DateTime<Utc>>,
}

impl Default for PersistOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            workers: 1,
            assert_graph_integrity: false,
            assert_referential_integrity: false,
            saved_at: None,
        }
    }
}

impl PersistOptions {
    pub fn from_config(config: &RefreshConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            workers: config.workers,
            assert_graph_integrity: config.assert_graph_integrity,
            assert_referential_integrity: config.assert_referential_integrity,
            saved_at: None,
        }
    }

    fn save_options(&self) -> SaveOptions {
        SaveOptions {
            batch_size: self.batch_size,
            assert_referential_integrity: self.assert_referential_integrity,
            saved_at: self.saved_at.unwrap_or_else(Utc::now),
        }
    }
}

/// Scan, graph and schedule of one refresh.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub scan: ScanReport,
    pub graph: ResolvedGraph,
    pub schedule: Schedule,
}

/// Summary of one persist run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RefreshReport {
    pub layers: usize,
    pub collections: BTreeMap<String, SaveStats>,
    pub totals: SaveStats,
    pub feedback_edges: Vec<FeedbackEdge>,
    pub unconnected: Vec<UnconnectedEdge>,
    pub unknown_targets: Vec<UnconnectedReference>,
    pub elapsed_ms: u64,
}

impl RefreshReport {
    fn record(&mut self, collection: &str, outcome: SaveOutcome) {
        *self.collections.entry(collection.to_string()).or_default() += outcome.stats;
        self.totals += outcome.stats;
        self.unconnected.extend(outcome.unconnected);
    }
}

impl std::fmt::Display for RefreshReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Refresh Report:")?;
        writeln!(f, "  Layers: {}", self.layers)?;
        writeln!(f, "  Collections: {}", self.collections.len())?;
        writeln!(f, "  Rows: {}", self.totals)?;
        writeln!(f, "  Deferred records: {}", self.totals.deferred)?;
        writeln!(f, "  Feedback edges: {}", self.feedback_edges.len())?;
        writeln!(f, "  Unconnected references: {}", self.unconnected.len() + self.unknown_targets.len())?;
        writeln!(f, "  Elapsed: {}ms", self.elapsed_ms)
    }
}

pub struct Persister {
    collections: CollectionSet,
    options: PersistOptions,
    progress: Option<Sender<ProgressMessage>>,
}

impl Persister {
    pub fn new(options: PersistOptions) -> Self {
        Self {
            collections: CollectionSet::new(),
            options,
            progress: None,
        }
    }

    /// Report progress through a channel (drives the CLI progress bars)
    pub fn with_progress(mut self, progress: Sender<ProgressMessage>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn add(&mut self, collection: Collection) -> Result<()> {
        self.collections.insert(collection)
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    pub fn collection_mut(&mut self, name: &str) -> Result<&mut Collection> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    pub fn collections(&self) -> &CollectionSet {
        &self.collections
    }

    pub fn options(&self) -> &PersistOptions {
        &self.options
    }

    fn send(&self, message: ProgressMessage) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(message);
        }
    }

    /// Scan the collections and derive the save order
    pub fn plan(&mut self) -> Result<Plan> {
        self.send(ProgressMessage::Started {
            phase: ProgressPhase::Scanning,
            total: self.collections.len(),
        });
        let scan = DependencyScanner::scan(&mut self.collections)?;
        let graph = DependencyGraph::from_collections(&self.collections, self.options.assert_graph_integrity)?
            .resolve_cycles()?;
        let schedule = Schedule::build(&graph)?;
        self.send(ProgressMessage::Finished {
            phase: ProgressPhase::Scanning,
        });

        for feedback in &graph.feedback {
            info!(
                from = %feedback.from,
                to = %feedback.to,
                attributes = ?feedback.attributes,
                "Cycle broken, attributes deferred"
            );
        }
        debug!(layers = schedule.len(), stats = %graph.stats(), "Planned refresh");
        Ok(Plan { scan, graph, schedule })
    }

    fn build_index(&self, store: &dyn RecordStore) -> Result<IdIndex> {
        let mut index = IdIndex::new();
        for collection in self.collections.iter() {
            index.register(collection);
        }
        for collection in self.collections.iter() {
            if collection.definition().strategy == Strategy::LocalDbCacheAll {
                let rows = store.all_records(collection.name())?;
                let indexed = index.preload(collection.name(), &rows);
                debug!(collection = collection.name(), rows = rows.len(), indexed, "Preloaded collection");
            } else if collection.is_saved() {
                index.index_collection(collection);
            }
        }
        Ok(index)
    }

    fn start_report(&self, plan: &Plan) -> RefreshReport {
        RefreshReport {
            layers: plan.schedule.len(),
            feedback_edges: plan.graph.feedback.clone(),
            unknown_targets: plan.scan.unconnected.clone(),
            ..RefreshReport::default()
        }
    }

    /// Save every collection on the calling thread
    pub fn persist(&mut self, store: &dyn RecordStore) -> Result<RefreshReport> {
        let started = Instant::now();
        let plan = self.plan()?;
        let mut index = self.build_index(store)?;
        let save_options = self.options.save_options();
        let saver = CollectionSaver::new(store, &save_options);
        let mut report = self.start_report(&plan);

        self.send(ProgressMessage::Started {
            phase: ProgressPhase::Saving,
            total: self.collections.len(),
        });
        let mut current = 0;
        for (i, layer) in plan.schedule.layers.iter().enumerate() {
            info!(layer = i, collections = ?layer, "Saving layer");
            self.send(ProgressMessage::Layer {
                index: i,
                collections: layer.clone(),
            });
            for name in layer {
                let deferred = plan.graph.deferred_attributes(name);
                let collection = self.collection_mut(name)?;
                let outcome = saver.save(collection, &index, &deferred)?;
                index.index_collection(collection);
                report.record(name, outcome);
                current += 1;
                self.send(ProgressMessage::Progress {
                    phase: ProgressPhase::Saving,
                    current,
                    collection: Some(name.clone()),
                });
            }
        }
        self.send(ProgressMessage::Finished {
            phase: ProgressPhase::Saving,
        });

        self.deferred_pass(&plan, &saver, &index, &mut report)?;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.log_report(&report);
        Ok(report)
    }

    /// Save each layer across up to `workers` threads
    pub fn persist_parallel(&mut self, connect: &StoreConnector) -> Result<RefreshReport> {
        let started = Instant::now();
        let plan = self.plan()?;
        let main_store = connect()?;
        let mut index = self.build_index(main_store.as_ref())?;
        let save_options = self.options.save_options();
        let workers = self.options.workers.max(1);
        let mut report = self.start_report(&plan);

        self.send(ProgressMessage::Started {
            phase: ProgressPhase::Saving,
            total: self.collections.len(),
        });
        let mut current = 0;
        for (i, layer) in plan.schedule.layers.iter().enumerate() {
            info!(layer = i, collections = ?layer, workers, "Saving layer");
            self.send(ProgressMessage::Layer {
                index: i,
                collections: layer.clone(),
            });

            let mut taken: Vec<Collection> = layer.iter().filter_map(|name| self.collections.take(name)).collect();
            let per_worker = taken.len().div_ceil(workers).max(1);
            let graph = &plan.graph;
            let shared_index = &index;
            let options = &save_options;

            let joined = crossbeam::thread::scope(|s| {
                let handles: Vec<_> = taken
                    .chunks_mut(per_worker)
                    .map(|chunk| {
                        s.spawn(move |_| -> Result<Vec<(String, SaveOutcome)>> {
                            let store = connect()?;
                            let saver = CollectionSaver::new(store.as_ref(), options);
                            let mut outcomes = Vec::with_capacity(chunk.len());
                            for collection in chunk.iter_mut() {
                                let deferred = graph.deferred_attributes(collection.name());
                                let outcome = saver.save(collection, shared_index, &deferred)?;
                                outcomes.push((collection.name().to_string(), outcome));
                            }
                            Ok(outcomes)
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|h| h.join().unwrap_or_else(|_| Err(Error::Worker("Save worker panicked".to_string()))))
                    .collect::<Vec<_>>()
            });

            for collection in taken {
                index.index_collection(&collection);
                self.collections.restore(collection);
            }

            let results = joined.map_err(|_| Error::Worker("Worker scope panicked".to_string()))?;
            for result in results {
                for (name, outcome) in result? {
                    report.record(&name, outcome);
                    current += 1;
                    self.send(ProgressMessage::Progress {
                        phase: ProgressPhase::Saving,
                        current,
                        collection: Some(name),
                    });
                }
            }
        }
        self.send(ProgressMessage::Finished {
            phase: ProgressPhase::Saving,
        });

        let saver = CollectionSaver::new(main_store.as_ref(), &save_options);
        self.deferred_pass(&plan, &saver, &index, &mut report)?;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        self.log_report(&report);
        Ok(report)
    }

    fn deferred_pass(
        &mut self,
        plan: &Plan,
        saver: &CollectionSaver<'_>,
        index: &IdIndex,
        report: &mut RefreshReport,
    ) -> Result<()> {
        let pending: Vec<String> = plan
            .schedule
            .collections()
            .filter(|name| self.collections.get(name).is_some_and(has_pending))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        self.send(ProgressMessage::Started {
            phase: ProgressPhase::Deferred,
            total: pending.len(),
        });
        for (current, name) in pending.iter().enumerate() {
            let collection = self.collection_mut(name)?;
            let outcome = saver.save_deferred(collection, index)?;
            debug!(collection = %name, patched = outcome.stats.patched, "Deferred pass");
            report.record(name, outcome);
            self.send(ProgressMessage::Progress {
                phase: ProgressPhase::Deferred,
                current: current + 1,
                collection: Some(name.clone()),
            });
        }
        self.send(ProgressMessage::Finished {
            phase: ProgressPhase::Deferred,
        });
        Ok(())
    }

    fn log_report(&self, report: &RefreshReport) {
        for edge in &report.unconnected {
            warn!(
                collection = %edge.collection,
                attribute = %edge.attribute,
                identity = %edge.identity,
                reference = %edge.reference,
                "Unconnected reference"
            );
        }
        info!(
            collections = report.collections.len(),
            created = report.totals.created,
            updated = report.totals.updated,
            deleted = report.totals.deleted,
            archived = report.totals.archived,
            patched = report.totals.patched,
            elapsed_ms = report.elapsed_ms,
            "Persisted refresh"
        );
    }
}

fn has_pending(collection: &Collection) -> bool {
    collection
        .records()
        .iter()
        .chain(collection.skeletal_records().map(|(_, r)| r))
        .any(|r| !r.pending_attributes().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{CollectionDefinition, SaverStrategy};
    use crate::record::{IdentityKey, Record};
    use crate::storage::SqliteStore;
    use crate::value::{LazyRef, Value};

    fn inventory(vm_names: &[&str]) -> Persister {
        let mut persister = Persister::new(PersistOptions::default());

        let mut hosts = Collection::new(CollectionDefinition::new("hosts", ["ems_ref"])).unwrap();
        hosts.push(Record::new().with("ems_ref", "h1").with("name", "esx-1")).unwrap();

        let mut vms = Collection::new(CollectionDefinition::new("vms", ["ems_ref"])).unwrap();
        for name in vm_names {
            vms.push(
                Record::new()
                    .with("ems_ref", *name)
                    .with("host", LazyRef::by("hosts", "ems_ref", "h1"))
                    .with("genealogy_parent", LazyRef::by("vms", "ems_ref", vm_names[0])),
            )
            .unwrap();
        }

        let mut disks = Collection::new(CollectionDefinition::new("disks", ["vm", "device"])).unwrap();
        for name in vm_names {
            disks
                .push(
                    Record::new()
                        .with("vm", LazyRef::by("vms", "ems_ref", *name))
                        .with("device", "sda"),
                )
                .unwrap();
        }

        persister.add(hosts).unwrap();
        persister.add(vms).unwrap();
        persister.add(disks).unwrap();
        persister
    }

    #[test]
    fn test_plan_orders_layers_and_breaks_self_reference() {
        let mut persister = inventory(&["vm-1", "vm-2"]);
        let plan = persister.plan().unwrap();

        assert_eq!(plan.schedule.layers, vec![vec!["hosts"], vec!["vms"], vec!["disks"]]);
        assert_eq!(plan.graph.deferred_attributes("vms").len(), 1);
        assert!(plan.graph.deferred_attributes("vms").contains("genealogy_parent"));
        assert_eq!(plan.scan.inferred_parents.get("disks"), Some(&"vms".to_string()));
    }

    #[test]
    fn test_persist_resolves_references_across_layers() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut persister = inventory(&["vm-1", "vm-2"]);
        let report = persister.persist(&store).unwrap();

        assert_eq!(report.totals.created, 5);
        assert!(report.unconnected.is_empty());

        let host_id = persister.collection("hosts").unwrap().records()[0].id.unwrap();
        let vms = persister.collection("vms").unwrap();
        let first_vm = vms.records()[0].id.unwrap();
        for record in vms.records() {
            assert_eq!(record.get("host"), Some(&Value::resolved(host_id)));
            assert_eq!(record.get("genealogy_parent"), Some(&Value::resolved(first_vm)));
        }

        let stored = store.find_by_identities("vms", &[IdentityKey::new(["vm-2"])]).unwrap();
        assert_eq!(stored[0].attributes["genealogy_parent"], serde_json::json!(first_vm));

        let disk_key = IdentityKey::new([first_vm.to_string(), "sda".to_string()]);
        assert_eq!(store.find_by_identities("disks", &[disk_key]).unwrap().len(), 1);
    }

    #[test]
    fn test_second_persist_changes_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        inventory(&["vm-1", "vm-2"]).persist(&store).unwrap();

        let report = inventory(&["vm-1", "vm-2"]).persist(&store).unwrap();
        assert_eq!(report.totals.changes(), 0);
        assert_eq!(report.totals.patched, 0);
        assert_eq!(report.totals.unchanged, 5);
    }

    #[test]
    fn test_deferred_pass_writes_only_changed_references() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = inventory(&["vm-1", "vm-2"]).persist(&store).unwrap();
        assert_eq!(first.collections["vms"].patched, 2);

        let second = inventory(&["vm-1", "vm-2"]).persist(&store).unwrap();
        assert_eq!(second.collections["vms"].patched, 0);
        assert_eq!(second.totals.changes(), 0);

        // vm-2 becomes the genealogy root: both rows point at a new parent
        let third = inventory(&["vm-2", "vm-1"]).persist(&store).unwrap();
        assert_eq!(third.collections["vms"].patched, 2);
    }

    #[test]
    fn test_cycle_through_identity_attribute_is_fatal() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut persister = Persister::new(PersistOptions::default());
        let mut vms = Collection::new(CollectionDefinition::new("vms", ["name", "parent"])).unwrap();
        vms.push(Record::new().with("name", "root").with("parent", "")).unwrap();
        vms.push(Record::new().with("name", "child").with("parent", LazyRef::by("vms", "name", "root")))
            .unwrap();
        persister.add(vms).unwrap();

        assert!(matches!(persister.persist(&store), Err(Error::UnresolvableCycle(_))));
        assert!(store.all_records("vms").unwrap().is_empty());
    }

    #[test]
    fn test_removed_vm_takes_its_disk_along() {
        let store = SqliteStore::open_in_memory().unwrap();
        inventory(&["vm-1", "vm-2"]).persist(&store).unwrap();

        let report = inventory(&["vm-1"]).persist(&store).unwrap();
        assert_eq!(report.collections["vms"].deleted, 1);
        assert_eq!(report.collections["disks"].deleted, 1);
    }

    #[test]
    fn test_cache_all_collection_resolves_from_storage() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut seed = Persister::new(PersistOptions::default());
        let mut flavors = Collection::new(CollectionDefinition::new("flavors", ["ems_ref"])).unwrap();
        flavors.push(Record::new().with("ems_ref", "m1.small").with("cpus", 1i64)).unwrap();
        seed.add(flavors).unwrap();
        seed.persist(&store).unwrap();
        let flavor_id = store.all_records("flavors").unwrap()[0].id;

        for strategy in [Strategy::LocalDbCacheAll, Strategy::LocalDbFindReferences] {
            let mut persister = Persister::new(PersistOptions::default());
            persister
                .add(Collection::new(CollectionDefinition::new("flavors", ["ems_ref"]).strategy(strategy)).unwrap())
                .unwrap();
            let mut vms = Collection::new(CollectionDefinition::new("vms", ["ems_ref"])).unwrap();
            vms.push(Record::new().with("ems_ref", "vm-1").with("flavor", LazyRef::by("flavors", "ems_ref", "m1.small")))
                .unwrap();
            persister.add(vms).unwrap();

            let report = persister.persist(&store).unwrap();
            assert!(report.unconnected.is_empty(), "{}", strategy);
            assert_eq!(
                persister.collection("vms").unwrap().records()[0].get("flavor"),
                Some(&Value::resolved(flavor_id))
            );
            assert_eq!(store.all_records("flavors").unwrap().len(), 1, "{}", strategy);
        }
    }

    #[test]
    fn test_persist_parallel_with_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.db");
        SqliteStore::open(&path).unwrap();

        let mut persister = Persister::new(PersistOptions {
            workers: 2,
            ..PersistOptions::default()
        });
        for name in ["clusters", "flavors", "networks"] {
            let mut collection = Collection::new(
                CollectionDefinition::new(name, ["ems_ref"]).saver_strategy(SaverStrategy::ConcurrentSafeBatch),
            )
            .unwrap();
            for i in 0..3 {
                collection.push(Record::new().with("ems_ref", format!("{}-{}", name, i))).unwrap();
            }
            persister.add(collection).unwrap();
        }
        let mut vms = Collection::new(CollectionDefinition::new("vms", ["ems_ref"])).unwrap();
        vms.push(
            Record::new()
                .with("ems_ref", "vm-1")
                .with("cluster", LazyRef::by("clusters", "ems_ref", "clusters-0"))
                .with("flavor", LazyRef::by("flavors", "ems_ref", "flavors-1"))
                .with("network", LazyRef::by("networks", "ems_ref", "networks-2")),
        )
        .unwrap();
        persister.add(vms).unwrap();

        let connect_path = path.clone();
        let connect = move || -> Result<Box<dyn RecordStore>> { Ok(Box::new(SqliteStore::open(&connect_path)?)) };
        let report = persister.persist_parallel(&connect).unwrap();

        assert_eq!(report.layers, 2);
        assert_eq!(report.totals.created, 10);
        assert!(report.unconnected.is_empty());
        let vm = &persister.collection("vms").unwrap().records()[0];
        assert!(matches!(vm.get("network"), Some(Value::Ref(crate::value::Reference::Resolved { .. }))));

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.stats().unwrap().records, 10);
    }
}
