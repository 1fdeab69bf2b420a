//! Stale-row sweeper

use super::state::SweepScope;
use crate::collection::{CollectionDefinition, RetentionStrategy, Strategy};
use crate::storage::RecordStore;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Column a collection must carry to take part in sweeping
pub const LAST_SEEN_COLUMN: &str = "last_seen_at";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepStats {
    pub deleted: usize,
    pub archived: usize,
    /// Rows removed per collection
    pub collections: BTreeMap<String, usize>,
}

impl std::fmt::Display for SweepStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "deleted {}, archived {} across {} collections",
            self.deleted,
            self.archived,
            self.collections.len()
        )
    }
}

pub struct Sweeper<'a> {
    store: &'a dyn RecordStore,
    batch_size: usize,
}

impl<'a> Sweeper<'a> {
    pub fn new(store: &'a dyn RecordStore, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Check if a collection's stale rows may be swept under `scope`
    pub fn participates(&self, definition: &CollectionDefinition, scope: &SweepScope) -> Result<bool> {
        if !scope.contains(&definition.name)
            || definition.strategy != Strategy::Default
            || !definition.saver_strategy.is_parallel_safe()
        {
            return Ok(false);
        }
        self.store.has_column(&definition.name, LAST_SEEN_COLUMN)
    }

    /// Delete or archive every live row not seen since `started_at`
    pub fn sweep(
        &self,
        definitions: &[CollectionDefinition],
        scope: &SweepScope,
        started_at: DateTime<Utc>,
    ) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        for definition in definitions {
            if !self.participates(definition, scope)? {
                debug!(collection = %definition.name, "Not swept");
                continue;
            }

            let mut removed = 0;
            loop {
                let ids = self.store.stale_ids(&definition.name, started_at, self.batch_size)?;
                if ids.is_empty() {
                    break;
                }
                match definition.retention_strategy {
                    RetentionStrategy::Destroy => {
                        let n = self.store.delete_batch(&definition.name, &ids)?;
                        stats.deleted += n;
                        removed += n;
                    }
                    RetentionStrategy::Archive => {
                        let n = self.store.archive_batch(&definition.name, &ids, Utc::now())?;
                        stats.archived += n;
                        removed += n;
                    }
                }
                if ids.len() < self.batch_size {
                    break;
                }
            }

            if removed > 0 {
                stats.collections.insert(definition.name.clone(), removed);
            }
            debug!(collection = %definition.name, removed, "Swept collection");
        }
        info!(deleted = stats.deleted, archived = stats.archived, "Sweep finished");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::SaverStrategy;
    use crate::record::IdentityKey;
    use crate::storage::{RowWrite, SqliteStore};
    use chrono::TimeZone;

    fn row(key: &str, seen_at: DateTime<Utc>) -> RowWrite {
        RowWrite {
            identity: IdentityKey::new([key]),
            attributes: serde_json::Map::new(),
            resource_timestamp: seen_at,
            seen_at,
        }
    }

    fn swept(name: &str) -> CollectionDefinition {
        CollectionDefinition::new(name, ["ems_ref"]).saver_strategy(SaverStrategy::ConcurrentSafeBatch)
    }

    #[test]
    fn test_participation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let sweeper = Sweeper::new(&store, 10);
        let only_vms: SweepScope = ["vms"].into_iter().collect();

        assert!(sweeper.participates(&swept("vms"), &SweepScope::All).unwrap());
        assert!(sweeper.participates(&swept("vms"), &only_vms).unwrap());
        assert!(!sweeper.participates(&swept("hosts"), &only_vms).unwrap());
        assert!(!sweeper
            .participates(&CollectionDefinition::new("vms", ["ems_ref"]), &SweepScope::All)
            .unwrap());
        assert!(!sweeper
            .participates(&swept("vms").strategy(Strategy::LocalDbFindMissingReferences), &SweepScope::All)
            .unwrap());
    }

    #[test]
    fn test_sweep_removes_only_stale_rows_in_batches() {
        let store = SqliteStore::open_in_memory().unwrap();
        let before = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let started = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();

        let stale: Vec<RowWrite> = (0..5).map(|i| row(&format!("old-{}", i), before)).collect();
        store.insert_batch("vms", &stale).unwrap();
        store.insert_batch("vms", &[row("fresh", after)]).unwrap();
        store.insert_batch("disks", &[row("d-old", before)]).unwrap();

        let definitions = vec![swept("vms"), swept("disks").retention(RetentionStrategy::Archive)];
        let stats = Sweeper::new(&store, 2).sweep(&definitions, &SweepScope::All, started).unwrap();

        assert_eq!(stats.deleted, 5);
        assert_eq!(stats.archived, 1);
        assert_eq!(stats.collections["vms"], 5);

        let vms = store.all_records("vms").unwrap();
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].identity, IdentityKey::new(["fresh"]));
        let disks = store.all_records("disks").unwrap();
        assert!(disks[0].archived);
    }
}
