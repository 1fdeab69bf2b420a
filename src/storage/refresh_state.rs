//! Refresh-state persistence

use super::{format_timestamp, parse_timestamp, SqliteStore};
use crate::refresh::state::{PartStatus, RefreshState, RefreshStatePart, SweepScope};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

type RawState = (
    i64,
    String,
    i64,
    String,
    Option<i64>,
    Option<String>,
    i64,
    Option<String>,
    String,
    String,
);

type RawPart = (i64, String, String, Option<String>, String, String);

const STATE_COLUMNS: &str = "id, uuid, ems_id, status, total_parts, sweep_scope, sweep_retry_count, \
                             error_message, created_at, updated_at";

fn timestamp(s: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(s).ok_or_else(|| Error::Invariant(format!("Malformed stored timestamp: {}", s)))
}

fn uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Invariant(format!("Malformed stored uuid {}: {}", s, e)))
}

impl SqliteStore {
    /// Get a refresh state by UUID
    pub fn find_refresh_state(&self, uuid: &Uuid) -> Result<Option<RefreshState>> {
        let raw: Option<RawState> = self
            .conn
            .query_row(
                &format!("SELECT {} FROM refresh_states WHERE uuid = ?1", STATE_COLUMNS),
                [uuid.to_string()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                        row.get(7)?,
                        row.get(8)?,
                        row.get(9)?,
                    ))
                },
            )
            .optional()?;
        raw.map(Self::raw_to_state).transpose()
    }

    /// Get the refresh state for `uuid`, creating it in `started` if absent
    pub fn find_or_create_refresh_state(&self, uuid: &Uuid, ems_id: i64, now: DateTime<Utc>) -> Result<RefreshState> {
        self.conn.execute(
            r#"
            INSERT INTO refresh_states (uuid, ems_id, status, created_at, updated_at)
            VALUES (?1, ?2, 'started', ?3, ?3)
            ON CONFLICT(uuid) DO NOTHING
            "#,
            params![uuid.to_string(), ems_id, format_timestamp(now)],
        )?;
        self.find_refresh_state(uuid)?
            .ok_or_else(|| Error::RefreshStateNotFound(uuid.to_string()))
    }

    /// Write back the mutable fields of a refresh state
    pub fn update_refresh_state(&self, state: &RefreshState) -> Result<()> {
        let scope = state.sweep_scope.as_ref().map(serde_json::to_string).transpose()?;
        self.conn.execute(
            r#"
            UPDATE refresh_states
            SET status = ?1, total_parts = ?2, sweep_scope = ?3, sweep_retry_count = ?4,
                error_message = ?5, updated_at = ?6
            WHERE id = ?7
            "#,
            params![
                state.status.as_str(),
                state.total_parts.map(i64::from),
                scope,
                i64::from(state.sweep_retry_count),
                state.error_message,
                format_timestamp(Utc::now()),
                state.id,
            ],
        )?;
        Ok(())
    }

    /// Create or update one part of a refresh
    pub fn upsert_refresh_state_part(
        &self,
        state_id: i64,
        part: &Uuid,
        status: PartStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let now = format_timestamp(Utc::now());
        self.conn.execute(
            r#"
            INSERT INTO refresh_state_parts (refresh_state_id, uuid, status, error_message, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            ON CONFLICT(refresh_state_id, uuid) DO UPDATE SET
                status = excluded.status,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at
            "#,
            params![state_id, part.to_string(), status.as_str(), error_message, now],
        )?;
        Ok(())
    }

    /// Get all parts of a refresh, oldest first
    pub fn refresh_state_parts(&self, state_id: i64) -> Result<Vec<RefreshStatePart>> {
        let mut stmt = self.conn.prepare_cached(
            r#"
            SELECT id, uuid, status, error_message, created_at, updated_at
            FROM refresh_state_parts
            WHERE refresh_state_id = ?1
            ORDER BY id
            "#,
        )?;
        let raw = stmt
            .query_map([state_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
            })?
            .collect::<rusqlite::Result<Vec<RawPart>>>()?;
        raw.into_iter()
            .map(|(id, part_uuid, status, error_message, created_at, updated_at)| {
                Ok(RefreshStatePart {
                    id,
                    uuid: uuid(&part_uuid)?,
                    status: status.parse()?,
                    error_message,
                    created_at: timestamp(&created_at)?,
                    updated_at: timestamp(&updated_at)?,
                })
            })
            .collect()
    }

    fn raw_to_state(raw: RawState) -> Result<RefreshState> {
        let (id, state_uuid, ems_id, status, total_parts, scope, retries, error_message, created_at, updated_at) = raw;
        let sweep_scope: Option<SweepScope> = scope.as_deref().map(serde_json::from_str).transpose()?;
        Ok(RefreshState {
            id,
            uuid: uuid(&state_uuid)?,
            ems_id,
            status: status.parse()?,
            total_parts: total_parts.map(|n| n as u32),
            sweep_scope,
            sweep_retry_count: retries as u32,
            error_message,
            created_at: timestamp(&created_at)?,
            updated_at: timestamp(&updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refresh::state::RefreshStatus;

    #[test]
    fn test_find_or_create_is_idempotent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        let first = store.find_or_create_refresh_state(&id, 1, Utc::now()).unwrap();
        let second = store.find_or_create_refresh_state(&id, 1, Utc::now()).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.status, RefreshStatus::Started);
    }

    #[test]
    fn test_state_update_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = Uuid::new_v4();
        let mut state = store.find_or_create_refresh_state(&id, 1, Utc::now()).unwrap();
        state.status = RefreshStatus::WaitingForRefreshStateParts;
        state.total_parts = Some(3);
        state.sweep_scope = Some(["vms"].into_iter().collect());
        state.sweep_retry_count = 2;
        store.update_refresh_state(&state).unwrap();

        let reloaded = store.find_refresh_state(&id).unwrap().unwrap();
        assert_eq!(reloaded.status, RefreshStatus::WaitingForRefreshStateParts);
        assert_eq!(reloaded.total_parts, Some(3));
        assert_eq!(reloaded.sweep_scope, state.sweep_scope);
        assert_eq!(reloaded.sweep_retry_count, 2);
    }

    #[test]
    fn test_parts_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let state = store.find_or_create_refresh_state(&Uuid::new_v4(), 1, Utc::now()).unwrap();
        let part = Uuid::new_v4();
        store.upsert_refresh_state_part(state.id, &part, PartStatus::Started, None).unwrap();
        store
            .upsert_refresh_state_part(state.id, &part, PartStatus::Error, Some("boom"))
            .unwrap();

        let parts = store.refresh_state_parts(state.id).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].status, PartStatus::Error);
        assert_eq!(parts[0].error_message.as_deref(), Some("boom"));
    }
}
