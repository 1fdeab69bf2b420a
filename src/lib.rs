//! # invrefresh - Inventory Refresh Persister
//!
//! Dependency-ordered persistence of provider inventory.
//!
//! invrefresh provides:
//! - Collections of loosely-typed records with lazy cross-collection references
//! - A dependency scanner and cycle-resolving graph builder
//! - A topological scheduler producing layers safe for parallel saving
//! - A collection saver reconciling incoming data against stored rows
//! - A mark-and-sweep refresh-state machine for multi-part refreshes
//! - SQLite-backed storage

pub mod value;
pub mod record;
pub mod collection;
pub mod index;
pub mod scanner;
pub mod graph;
pub mod scheduler;
pub mod saver;
pub mod storage;
pub mod persister;
pub mod transfer;
pub mod refresh;
pub mod config;
pub mod ui;

// Re-exports for convenient access
pub use value::{LazyRef, RecordId, Reference, ResolutionMode, Value};
pub use record::{IdentityKey, Record};
pub use collection::{
    Collection, CollectionDefinition, CollectionSet, DefaultValue, RefreshContext, RetentionStrategy,
    SaverStrategy, Strategy,
};
pub use graph::{DependencyGraph, ResolvedGraph};
pub use scheduler::Schedule;
pub use saver::{CollectionSaver, CustomReconciler, CustomSaver, SaveStats};
pub use storage::{RecordStore, SqliteStore};
pub use persister::{PersistOptions, Persister, RefreshReport};
pub use refresh::{RefreshCoordinator, RefreshStatus, SweepOutcome};

/// Result type alias for invrefresh operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for invrefresh operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection {collection} references unknown collection {target} via {attribute}")]
    MissingDependency {
        collection: String,
        target: String,
        attribute: String,
    },

    #[error("Duplicate identity {identity} in collection {collection}")]
    DuplicateIdentity { collection: String, identity: String },

    #[error("Collection {0} is finalized")]
    Finalized(String),

    #[error("Unresolvable cycle: {}", .0.join(" -> "))]
    UnresolvableCycle(Vec<String>),

    #[error("Unresolved reference: {0}")]
    Unresolved(String),

    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Refresh state not found: {0}")]
    RefreshStateNotFound(String),

    #[error("Sweep of refresh {uuid} timed out after {attempts} attempts")]
    SweepTimeout { uuid: String, attempts: u32 },

    #[error("Worker error: {0}")]
    Worker(String),
}

/// Broad error class of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Resolution,
    Storage,
    Coordination,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Config(_)
            | Error::UnknownStrategy(_)
            | Error::CollectionNotFound(_)
            | Error::MissingDependency { .. }
            | Error::DuplicateIdentity { .. }
            | Error::Finalized(_) => ErrorClass::Configuration,
            Error::UnresolvableCycle(_) | Error::Unresolved(_) | Error::Invariant(_) => ErrorClass::Resolution,
            Error::Storage(_) | Error::Serialization(_) | Error::Io(_) => ErrorClass::Storage,
            Error::RefreshStateNotFound(_) | Error::SweepTimeout { .. } | Error::Worker(_) => {
                ErrorClass::Coordination
            }
        }
    }
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Configuration => "configuration",
            ErrorClass::Resolution => "resolution",
            ErrorClass::Storage => "storage",
            ErrorClass::Coordination => "coordination",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
