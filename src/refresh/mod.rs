//! Refresh coordination
//!
//! Multi-part refreshes write their parts independently; once every part
//! reports `finished`, the sweep removes rows no part has seen since the
//! refresh started.

pub mod coordinator;
pub mod state;
pub mod sweeper;

pub use coordinator::{RefreshCoordinator, SweepOutcome, DEFAULT_RETRY_CEILING};
pub use state::{PartCounts, PartStatus, RefreshState, RefreshStatePart, RefreshStatus, SweepScope};
pub use sweeper::{SweepStats, Sweeper};
