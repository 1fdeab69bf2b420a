//! SQLite storage implementation
//!
//! Transaction semantics: `begin` opens an IMMEDIATE transaction so the
//! write lock is taken up front; concurrent writers on other connections
//! wait up to the busy timeout. Without `begin`, every statement commits on
//! its own.

use super::{format_timestamp, schema, RecordStore, RowWrite, StoredRecord};
use crate::record::IdentityKey;
use crate::value::RecordId;
use crate::Result;
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Bound parameters per IN-list chunk; below SQLite's variable limit
const MAX_IN_PARAMS: usize = 500;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const RECORD_COLUMNS: &str = "id, identity, attributes, resource_timestamp, last_seen_at, archived_at";

type RawRecord = (i64, String, String, Option<String>, Option<String>, Option<String>);

/// SQLite-backed record and refresh-state storage
pub struct SqliteStore {
    pub(super) conn: Connection,
}

impl SqliteStore {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let _mode: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        for stmt in schema::all_schema_statements() {
            self.conn.execute(stmt, [])?;
        }
        Ok(())
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok(DbStats {
            records: count("SELECT COUNT(*) FROM records WHERE archived_at IS NULL")?,
            archived: count("SELECT COUNT(*) FROM records WHERE archived_at IS NOT NULL")?,
            collections: count("SELECT COUNT(DISTINCT collection) FROM records")?,
            refresh_states: count("SELECT COUNT(*) FROM refresh_states")?,
            refresh_state_parts: count("SELECT COUNT(*) FROM refresh_state_parts")?,
        })
    }

    /// Live and archived row counts per collection
    pub fn collection_counts(&self) -> Result<Vec<CollectionCount>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT collection,
                   SUM(CASE WHEN archived_at IS NULL THEN 1 ELSE 0 END),
                   SUM(CASE WHEN archived_at IS NOT NULL THEN 1 ELSE 0 END)
            FROM records
            GROUP BY collection
            ORDER BY collection
            "#,
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok(CollectionCount {
                    collection: row.get(0)?,
                    live: row.get::<_, i64>(1)? as usize,
                    archived: row.get::<_, i64>(2)? as usize,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    fn query_records(&self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<StoredRecord>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let raw = stmt
            .query_map(params_from_iter(params), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
            })?
            .collect::<rusqlite::Result<Vec<RawRecord>>>()?;
        raw.into_iter().map(Self::raw_to_stored).collect()
    }

    fn raw_to_stored(raw: RawRecord) -> Result<StoredRecord> {
        let (id, identity, attributes, resource_timestamp, last_seen_at, archived_at) = raw;
        Ok(StoredRecord {
            id,
            identity: IdentityKey::parse_storage(&identity)?,
            attributes: serde_json::from_str(&attributes)?,
            resource_timestamp,
            last_seen_at,
            archived: archived_at.is_some(),
        })
    }

    /// Run `sql` once per chunk of ids; `{ids}` is replaced by the placeholder list
    fn execute_for_ids(&self, sql: &str, leading: &[SqlValue], ids: &[RecordId]) -> Result<usize> {
        let mut affected = 0;
        for chunk in ids.chunks(MAX_IN_PARAMS) {
            let statement = sql.replace("{ids}", &placeholders(chunk.len()));
            let params = leading
                .iter()
                .cloned()
                .chain(chunk.iter().map(|id| SqlValue::Integer(*id)));
            affected += self.conn.prepare_cached(&statement)?.execute(params_from_iter(params))?;
        }
        Ok(affected)
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn json_path(attribute: &str) -> String {
    format!("$.\"{}\"", attribute.replace('"', "\\\""))
}

/// SQL value `json_extract` yields for a JSON value
fn extracted_value(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn attributes_json(row: &RowWrite) -> Result<String> {
    Ok(serde_json::to_string(&row.attributes)?)
}

impl RecordStore for SqliteStore {
    fn find_by_identities(&self, collection: &str, identities: &[IdentityKey]) -> Result<Vec<StoredRecord>> {
        let mut found = Vec::new();
        for chunk in identities.chunks(MAX_IN_PARAMS) {
            let sql = format!(
                "SELECT {} FROM records WHERE collection = ? AND identity IN ({}) ORDER BY id",
                RECORD_COLUMNS,
                placeholders(chunk.len())
            );
            let params = std::iter::once(SqlValue::Text(collection.to_string()))
                .chain(chunk.iter().map(|key| SqlValue::Text(key.to_storage_string())))
                .collect();
            found.extend(self.query_records(&sql, params)?);
        }
        Ok(found)
    }

    fn all_records(&self, collection: &str) -> Result<Vec<StoredRecord>> {
        let sql = format!("SELECT {} FROM records WHERE collection = ? ORDER BY id", RECORD_COLUMNS);
        self.query_records(&sql, vec![SqlValue::Text(collection.to_string())])
    }

    fn find_id_by_attributes(
        &self,
        collection: &str,
        lookup: &[(String, serde_json::Value)],
    ) -> Result<Option<RecordId>> {
        let mut sql = String::from("SELECT id FROM records WHERE collection = ? AND archived_at IS NULL");
        let mut params = vec![SqlValue::Text(collection.to_string())];
        for (attr, value) in lookup {
            sql.push_str(" AND json_extract(attributes, ?) IS ?");
            params.push(SqlValue::Text(json_path(attr)));
            params.push(extracted_value(value));
        }
        sql.push_str(" ORDER BY id LIMIT 1");

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let mut rows = stmt.query(params_from_iter(params))?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn insert_batch(&self, collection: &str, rows: &[RowWrite]) -> Result<Vec<RecordId>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT INTO records (collection, identity, attributes, resource_timestamp, last_seen_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            RETURNING id
            "#,
        )?;
        let now = format_timestamp(Utc::now());
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id = stmt.query_row(
                params![
                    collection,
                    row.identity.to_storage_string(),
                    attributes_json(row)?,
                    format_timestamp(row.resource_timestamp),
                    format_timestamp(row.seen_at),
                    now,
                ],
                |r| r.get(0),
            )?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn update_batch(&self, collection: &str, rows: &[(RecordId, RowWrite)]) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            UPDATE records
            SET identity = ?1,
                attributes = ?2,
                resource_timestamp = ?3,
                last_seen_at = MAX(COALESCE(last_seen_at, ''), ?4),
                archived_at = NULL,
                updated_at = ?5
            WHERE id = ?6 AND collection = ?7
            "#,
        )?;
        let now = format_timestamp(Utc::now());
        for (id, row) in rows {
            stmt.execute(params![
                row.identity.to_storage_string(),
                attributes_json(row)?,
                format_timestamp(row.resource_timestamp),
                format_timestamp(row.seen_at),
                now,
                id,
                collection,
            ])?;
        }
        Ok(())
    }

    fn upsert_batch(&self, collection: &str, rows: &[RowWrite]) -> Result<Vec<RecordId>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            INSERT INTO records (collection, identity, attributes, resource_timestamp, last_seen_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(collection, identity) DO UPDATE SET
                attributes = CASE
                    WHEN records.resource_timestamp IS NULL
                      OR excluded.resource_timestamp >= records.resource_timestamp
                    THEN excluded.attributes
                    ELSE records.attributes
                END,
                resource_timestamp = CASE
                    WHEN records.resource_timestamp IS NULL
                      OR excluded.resource_timestamp >= records.resource_timestamp
                    THEN excluded.resource_timestamp
                    ELSE records.resource_timestamp
                END,
                last_seen_at = MAX(COALESCE(records.last_seen_at, ''), excluded.last_seen_at),
                archived_at = NULL,
                updated_at = excluded.updated_at
            RETURNING id
            "#,
        )?;
        let now = format_timestamp(Utc::now());
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let id = stmt.query_row(
                params![
                    collection,
                    row.identity.to_storage_string(),
                    attributes_json(row)?,
                    format_timestamp(row.resource_timestamp),
                    format_timestamp(row.seen_at),
                    now,
                ],
                |r| r.get(0),
            )?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn patch_attributes(
        &self,
        collection: &str,
        id: RecordId,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare_cached(
            "UPDATE records SET attributes = json_set(attributes, ?1, json(?2)), updated_at = ?3 \
             WHERE id = ?4 AND collection = ?5",
        )?;
        let now = format_timestamp(Utc::now());
        for (attribute, value) in patch {
            stmt.execute(params![json_path(attribute), serde_json::to_string(value)?, now, id, collection])?;
        }
        Ok(())
    }

    fn touch(&self, collection: &str, ids: &[RecordId], seen_at: DateTime<Utc>) -> Result<()> {
        self.execute_for_ids(
            "UPDATE records SET last_seen_at = MAX(COALESCE(last_seen_at, ''), ?), archived_at = NULL \
             WHERE collection = ? AND id IN ({ids})",
            &[SqlValue::Text(format_timestamp(seen_at)), SqlValue::Text(collection.to_string())],
            ids,
        )?;
        Ok(())
    }

    fn delete_batch(&self, collection: &str, ids: &[RecordId]) -> Result<usize> {
        self.execute_for_ids(
            "DELETE FROM records WHERE collection = ? AND id IN ({ids})",
            &[SqlValue::Text(collection.to_string())],
            ids,
        )
    }

    fn archive_batch(&self, collection: &str, ids: &[RecordId], archived_at: DateTime<Utc>) -> Result<usize> {
        self.execute_for_ids(
            "UPDATE records SET archived_at = ?, updated_at = ? \
             WHERE collection = ? AND archived_at IS NULL AND id IN ({ids})",
            &[
                SqlValue::Text(format_timestamp(archived_at)),
                SqlValue::Text(format_timestamp(Utc::now())),
                SqlValue::Text(collection.to_string()),
            ],
            ids,
        )
    }

    fn has_column(&self, _collection: &str, column: &str) -> Result<bool> {
        let mut stmt = self.conn.prepare_cached("SELECT name FROM pragma_table_info('records')")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names.iter().any(|name| name == column))
    }

    fn stale_ids(&self, collection: &str, before: DateTime<Utc>, limit: usize) -> Result<Vec<RecordId>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT id FROM records
            WHERE collection = ?1
              AND archived_at IS NULL
              AND (last_seen_at IS NULL OR last_seen_at < ?2)
            ORDER BY id
            LIMIT ?3
            "#,
        )?;
        let ids = stmt
            .query_map(params![collection, format_timestamp(before), limit as i64], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub records: usize,
    pub archived: usize,
    pub collections: usize,
    pub refresh_states: usize,
    pub refresh_state_parts: usize,
}

impl std::fmt::Display for DbStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Database Statistics:")?;
        writeln!(f, "  Collections: {}", self.collections)?;
        writeln!(f, "  Records: {} (archived: {})", self.records, self.archived)?;
        writeln!(f, "  Refresh states: {}", self.refresh_states)?;
        writeln!(f, "  Refresh state parts: {}", self.refresh_state_parts)
    }
}

/// Row counts of one collection
#[derive(Debug, Clone, Serialize)]
pub struct CollectionCount {
    pub collection: String,
    pub live: usize,
    pub archived: usize,
}
