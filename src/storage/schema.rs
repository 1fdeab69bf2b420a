//! Database schema definitions

/// SQL to create the records table.
///
/// One row per saved record; `identity` is the JSON-encoded identity key
/// and `attributes` the JSON object of resolved attribute values.
pub const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    collection TEXT NOT NULL,
    identity TEXT NOT NULL,
    attributes TEXT NOT NULL DEFAULT '{}',
    resource_timestamp TEXT,
    last_seen_at TEXT,
    archived_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(collection, identity)
)
"#;

/// SQL to create the refresh_states table
pub const CREATE_REFRESH_STATES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS refresh_states (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT NOT NULL UNIQUE,
    ems_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    total_parts INTEGER,
    sweep_scope TEXT,
    sweep_retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create the refresh_state_parts table
pub const CREATE_REFRESH_STATE_PARTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS refresh_state_parts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    refresh_state_id INTEGER NOT NULL REFERENCES refresh_states(id) ON DELETE CASCADE,
    uuid TEXT NOT NULL,
    status TEXT NOT NULL,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(refresh_state_id, uuid)
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_records_collection ON records(collection)",
    "CREATE INDEX IF NOT EXISTS idx_records_last_seen ON records(collection, last_seen_at)",
    "CREATE INDEX IF NOT EXISTS idx_refresh_states_ems ON refresh_states(ems_id)",
    "CREATE INDEX IF NOT EXISTS idx_refresh_state_parts_state ON refresh_state_parts(refresh_state_id)",
];

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![
        CREATE_RECORDS_TABLE,
        CREATE_REFRESH_STATES_TABLE,
        CREATE_REFRESH_STATE_PARTS_TABLE,
    ];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}
