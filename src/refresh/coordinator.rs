//! Refresh-state machine
//!
//! `started -> waiting_for_refresh_state_parts -> sweeping -> finished`, with
//! `error` reachable from every state. Sweep attempts never block: while
//! parts are outstanding the caller gets [`SweepOutcome::Requeue`] and is
//! expected to schedule another attempt.

use super::state::{truncate_message, PartCounts, PartStatus, RefreshState, RefreshStatus, SweepScope};
use super::sweeper::{SweepStats, Sweeper};
use crate::collection::CollectionDefinition;
use crate::storage::SqliteStore;
use crate::{Error, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_RETRY_CEILING: u32 = 100;

/// Result of one sweep attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SweepOutcome {
    /// Parts still outstanding; try again later
    Requeue { completed: u32, total: u32, attempt: u32 },
    Swept(SweepStats),
    /// A part failed; the refresh is in `error`
    Failed { message: String },
    AlreadyFinished,
}

pub struct RefreshCoordinator<'a> {
    store: &'a SqliteStore,
    retry_ceiling: u32,
    batch_size: usize,
}

impl<'a> RefreshCoordinator<'a> {
    pub fn new(store: &'a SqliteStore) -> Self {
        Self {
            store,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            batch_size: 1000,
        }
    }

    pub fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Find or create the state of refresh `uuid`
    pub fn start(&self, uuid: &Uuid, ems_id: i64) -> Result<RefreshState> {
        let state = self.store.find_or_create_refresh_state(uuid, ems_id, Utc::now())?;
        info!(refresh = %uuid, ems_id, status = %state.status, "Refresh started");
        Ok(state)
    }

    pub fn state(&self, uuid: &Uuid) -> Result<RefreshState> {
        self.store
            .find_refresh_state(uuid)?
            .ok_or_else(|| Error::RefreshStateNotFound(uuid.to_string()))
    }

    /// Run `save` as part `part` of refresh `uuid`.
    ///
    /// A failure marks both the part and the refresh as `error` before it is
    /// returned.
    pub fn save_part<T, F>(&self, uuid: &Uuid, part: &Uuid, save: F) -> Result<T>
    where
        F: FnOnce(&SqliteStore) -> Result<T>,
    {
        let mut state = self.state(uuid)?;
        self.store
            .upsert_refresh_state_part(state.id, part, PartStatus::Started, None)?;

        match save(self.store) {
            Ok(value) => {
                self.store
                    .upsert_refresh_state_part(state.id, part, PartStatus::Finished, None)?;
                info!(refresh = %uuid, part = %part, "Refresh part finished");
                Ok(value)
            }
            Err(err) => {
                let message = truncate_message(&err.to_string());
                error!(refresh = %uuid, part = %part, class = %err.class(), error = %message, "Refresh part failed");
                self.store
                    .upsert_refresh_state_part(state.id, part, PartStatus::Error, Some(&message))?;
                state.fail(&message);
                self.store.update_refresh_state(&state)?;
                Err(err)
            }
        }
    }

    /// Declare how many parts the refresh has and what the sweep may touch
    pub fn request_sweep(&self, uuid: &Uuid, total_parts: u32, scope: SweepScope) -> Result<RefreshState> {
        let mut state = self.state(uuid)?;
        if state.status.is_terminal() {
            return Err(Error::Invariant(format!(
                "Refresh {} is already {}",
                uuid, state.status
            )));
        }
        state.total_parts = Some(total_parts);
        state.sweep_scope = Some(scope);
        state.status = RefreshStatus::WaitingForRefreshStateParts;
        self.store.update_refresh_state(&state)?;
        info!(refresh = %uuid, total_parts, "Sweep requested");
        Ok(state)
    }

    /// Sweep if every part finished, requeue otherwise
    pub fn attempt_sweep(&self, uuid: &Uuid, definitions: &[CollectionDefinition]) -> Result<SweepOutcome> {
        let mut state = self.state(uuid)?;
        match state.status {
            RefreshStatus::Finished => return Ok(SweepOutcome::AlreadyFinished),
            RefreshStatus::Error => {
                return Ok(SweepOutcome::Failed {
                    message: state.error_message.unwrap_or_default(),
                })
            }
            RefreshStatus::Started => {
                return Err(Error::Invariant(format!("Sweep of refresh {} was never requested", uuid)))
            }
            RefreshStatus::WaitingForRefreshStateParts | RefreshStatus::Sweeping => {}
        }
        let total = state
            .total_parts
            .ok_or_else(|| Error::Invariant(format!("Refresh {} has no part count", uuid)))?;

        let parts = self.store.refresh_state_parts(state.id)?;
        let counts = PartCounts::from_parts(&parts);
        if counts.error > 0 {
            let cause = parts
                .iter()
                .find(|p| p.status == PartStatus::Error)
                .and_then(|p| p.error_message.clone())
                .unwrap_or_default();
            state.fail(&format!("{} refresh part(s) failed: {}", counts.error, cause));
            self.store.update_refresh_state(&state)?;
            return Ok(SweepOutcome::Failed {
                message: state.error_message.unwrap_or_default(),
            });
        }

        if counts.finished < total {
            state.sweep_retry_count += 1;
            if state.sweep_retry_count > self.retry_ceiling {
                state.fail(&format!(
                    "Sweep timed out waiting for refresh parts: {}/{} finished after {} attempts",
                    counts.finished, total, self.retry_ceiling
                ));
                self.store.update_refresh_state(&state)?;
                return Err(Error::SweepTimeout {
                    uuid: uuid.to_string(),
                    attempts: self.retry_ceiling,
                });
            }
            self.store.update_refresh_state(&state)?;
            warn!(
                refresh = %uuid,
                completed = counts.finished,
                total,
                attempt = state.sweep_retry_count,
                "Refresh parts outstanding, requeueing sweep"
            );
            return Ok(SweepOutcome::Requeue {
                completed: counts.finished,
                total,
                attempt: state.sweep_retry_count,
            });
        }

        state.status = RefreshStatus::Sweeping;
        self.store.update_refresh_state(&state)?;
        let scope = state.sweep_scope.clone().unwrap_or(SweepScope::All);
        let sweeper = Sweeper::new(self.store, self.batch_size);

        match sweeper.sweep(definitions, &scope, state.created_at) {
            Ok(stats) => {
                state.status = RefreshStatus::Finished;
                self.store.update_refresh_state(&state)?;
                info!(refresh = %uuid, %stats, "Refresh finished");
                Ok(SweepOutcome::Swept(stats))
            }
            Err(err) => {
                state.fail(&err.to_string());
                self.store.update_refresh_state(&state)?;
                Err(err)
            }
        }
    }
}
