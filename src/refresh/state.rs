//! Refresh-state model
//!
//! A refresh is identified by a UUID and split into parts, each saved by
//! its own worker. The state row tracks how far the refresh got; the sweep
//! runs once every expected part has finished.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

/// Stored error messages are cut to this many characters
pub const ERROR_MESSAGE_LIMIT: usize = 150;

/// Lifecycle of a whole refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshStatus {
    Started,
    WaitingForRefreshStateParts,
    Sweeping,
    Finished,
    Error,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::Started => "started",
            RefreshStatus::WaitingForRefreshStateParts => "waiting_for_refresh_state_parts",
            RefreshStatus::Sweeping => "sweeping",
            RefreshStatus::Finished => "finished",
            RefreshStatus::Error => "error",
        }
    }

    pub fn all() -> &'static [RefreshStatus] {
        &[
            RefreshStatus::Started,
            RefreshStatus::WaitingForRefreshStateParts,
            RefreshStatus::Sweeping,
            RefreshStatus::Finished,
            RefreshStatus::Error,
        ]
    }

    /// Check if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefreshStatus::Finished | RefreshStatus::Error)
    }
}

impl FromStr for RefreshStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RefreshStatus::all()
            .iter()
            .find(|status| status.as_str() == s)
            .copied()
            .ok_or_else(|| Error::Invariant(format!("Unknown refresh status: {}", s)))
    }
}

impl std::fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of one part of a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartStatus {
    Started,
    Finished,
    Error,
}

impl PartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartStatus::Started => "started",
            PartStatus::Finished => "finished",
            PartStatus::Error => "error",
        }
    }
}

impl FromStr for PartStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "started" => Ok(PartStatus::Started),
            "finished" => Ok(PartStatus::Finished),
            "error" => Ok(PartStatus::Error),
            _ => Err(Error::Invariant(format!("Unknown refresh part status: {}", s))),
        }
    }
}

impl std::fmt::Display for PartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Collections a sweep may delete from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepScope {
    All,
    Collections(BTreeSet<String>),
}

impl SweepScope {
    pub fn contains(&self, collection: &str) -> bool {
        match self {
            SweepScope::All => true,
            SweepScope::Collections(names) => names.contains(collection),
        }
    }
}

impl<S: Into<String>> FromIterator<S> for SweepScope {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        SweepScope::Collections(iter.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshState {
    pub id: i64,
    pub uuid: Uuid,
    pub ems_id: i64,
    pub status: RefreshStatus,
    pub total_parts: Option<u32>,
    pub sweep_scope: Option<SweepScope>,
    pub sweep_retry_count: u32,
    pub error_message: Option<String>,
    /// Refresh start; rows not seen since are stale
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefreshState {
    /// Record a failure, truncating the message
    pub fn fail(&mut self, message: &str) {
        self.status = RefreshStatus::Error;
        self.error_message = Some(truncate_message(message));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshStatePart {
    pub id: i64,
    pub uuid: Uuid,
    pub status: PartStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Part counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartCounts {
    pub started: u32,
    pub finished: u32,
    pub error: u32,
}

impl PartCounts {
    pub fn from_parts(parts: &[RefreshStatePart]) -> Self {
        parts.iter().fold(Self::default(), |mut counts, part| {
            match part.status {
                PartStatus::Started => counts.started += 1,
                PartStatus::Finished => counts.finished += 1,
                PartStatus::Error => counts.error += 1,
            }
            counts
        })
    }
}

/// Cut a message to [`ERROR_MESSAGE_LIMIT`] characters
pub fn truncate_message(message: &str) -> String {
    message.chars().take(ERROR_MESSAGE_LIMIT).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in RefreshStatus::all() {
            assert_eq!(status.as_str().parse::<RefreshStatus>().unwrap(), *status);
        }
        assert!("paused".parse::<RefreshStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&RefreshStatus::WaitingForRefreshStateParts).unwrap(),
            "\"waiting_for_refresh_state_parts\""
        );
    }

    #[test]
    fn test_truncate_counts_characters() {
        let long = "é".repeat(400);
        assert_eq!(truncate_message(&long).chars().count(), ERROR_MESSAGE_LIMIT);
        assert_eq!(truncate_message("short"), "short");
    }

    #[test]
    fn test_sweep_scope() {
        let scope: SweepScope = ["vms", "hosts"].into_iter().collect();
        assert!(scope.contains("vms"));
        assert!(!scope.contains("disks"));
        assert!(SweepScope::All.contains("disks"));

        let json = serde_json::to_string(&scope).unwrap();
        assert_eq!(serde_json::from_str::<SweepScope>(&json).unwrap(), scope);
    }
}
