//! Storage Layer - SQLite-backed persistence
//!
//! System of record is SQLite with tables:
//! - records(collection, identity, attributes, resource_timestamp, last_seen_at, archived_at)
//! - refresh_states(uuid, ems_id, status, total_parts, sweep_scope, sweep_retry_count, error_message)
//! - refresh_state_parts(refresh_state_id, uuid, status, error_message)
//!
//! The saver and sweeper talk to storage through the [`RecordStore`] trait.

pub mod schema;
pub mod sqlite;
mod refresh_state;

pub use sqlite::{DbStats, SqliteStore};

use crate::record::IdentityKey;
use crate::value::RecordId;
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};

/// A row as read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: RecordId,
    pub identity: IdentityKey,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub resource_timestamp: Option<String>,
    pub last_seen_at: Option<String>,
    pub archived: bool,
}

/// A row about to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct RowWrite {
    pub identity: IdentityKey,
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub resource_timestamp: DateTime<Utc>,
    pub seen_at: DateTime<Utc>,
}

/// Operations the saver and sweeper need from a backend.
///
/// Every method addresses one collection. Batch methods preserve input
/// order in their returned ids.
pub trait RecordStore {
    /// Stored rows, archived ones included, matching any of the identities
    fn find_by_identities(&self, collection: &str, identities: &[IdentityKey]) -> Result<Vec<StoredRecord>>;

    /// Every stored row of a collection, archived ones included
    fn all_records(&self, collection: &str) -> Result<Vec<StoredRecord>>;

    /// Id of the first live row whose attributes match all lookup pairs
    fn find_id_by_attributes(
        &self,
        collection: &str,
        lookup: &[(String, serde_json::Value)],
    ) -> Result<Option<RecordId>>;

    fn insert_batch(&self, collection: &str, rows: &[RowWrite]) -> Result<Vec<RecordId>>;

    /// Replace identity and attributes of existing rows and revive archived ones
    fn update_batch(&self, collection: &str, rows: &[(RecordId, RowWrite)]) -> Result<()>;

    /// Atomic insert-or-update guarded by `resource_timestamp` (newer or equal wins).
    ///
    /// The winning row's attributes replace the stored map; callers send the
    /// merged map on updates.
    fn upsert_batch(&self, collection: &str, rows: &[RowWrite]) -> Result<Vec<RecordId>>;

    /// Set the given attributes on one row, keeping the others; nulls are stored
    fn patch_attributes(
        &self,
        collection: &str,
        id: RecordId,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()>;

    /// Advance `last_seen_at` without touching attributes
    fn touch(&self, collection: &str, ids: &[RecordId], seen_at: DateTime<Utc>) -> Result<()>;

    fn delete_batch(&self, collection: &str, ids: &[RecordId]) -> Result<usize>;

    fn archive_batch(&self, collection: &str, ids: &[RecordId], archived_at: DateTime<Utc>) -> Result<usize>;

    /// Check if rows of the collection carry the given column
    fn has_column(&self, collection: &str, column: &str) -> Result<bool>;

    /// Live rows not seen since `before`, lowest ids first
    fn stale_ids(&self, collection: &str, before: DateTime<Utc>, limit: usize) -> Result<Vec<RecordId>>;

    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
}

/// Canonical text form of stored timestamps; sorts chronologically
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored or ingested RFC 3339 timestamp
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::milliseconds(1);
        assert!(format_timestamp(early) < format_timestamp(late));
        assert_eq!(parse_timestamp(&format_timestamp(late)), Some(late));
    }

    #[test]
    fn test_parse_timestamp_normalizes_offsets() {
        let parsed = parse_timestamp("2024-01-02T05:04:05+02:00").unwrap();
        assert_eq!(format_timestamp(parsed), "2024-01-02T03:04:05.000000Z");
        assert!(parse_timestamp("yesterday").is_none());
    }
}
