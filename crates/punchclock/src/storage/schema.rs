//! `SQLite` schema definitions for punchclock.
//!
//! This module contains the SQL statements for creating and managing
//! the database schema.

/// SQL statement to create the workers table.
pub const CREATE_WORKERS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS workers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
)
";

/// SQL statement to create the sites table.
pub const CREATE_SITES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS sites (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    emergency INTEGER NOT NULL DEFAULT 0
)
";

/// SQL statement to create the append-only event ledger.
pub const CREATE_EVENTS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS check_in_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_id INTEGER NOT NULL REFERENCES workers(id),
    site_id INTEGER NOT NULL REFERENCES sites(id),
    event_type TEXT NOT NULL CHECK (event_type IN ('check_in', 'check_out')),
    timestamp TEXT NOT NULL
)
";

/// Index used when replaying one worker's history in ledger order.
pub const CREATE_EVENTS_WORKER_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_worker ON check_in_events(worker_id, timestamp, id)
";

/// Index used by per-site history queries.
pub const CREATE_EVENTS_SITE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_events_site ON check_in_events(site_id, timestamp DESC)
";

/// Rejects updates to ledger rows.
pub const CREATE_EVENTS_NO_UPDATE_TRIGGER: &str = r"
CREATE TRIGGER IF NOT EXISTS check_in_events_no_update
BEFORE UPDATE ON check_in_events
BEGIN
    SELECT RAISE(ABORT, 'check_in_events is append-only');
END
";

/// Rejects deletion of ledger rows.
pub const CREATE_EVENTS_NO_DELETE_TRIGGER: &str = r"
CREATE TRIGGER IF NOT EXISTS check_in_events_no_delete
BEFORE DELETE ON check_in_events
BEGIN
    SELECT RAISE(ABORT, 'check_in_events is append-only');
END
";

/// SQL statement to create the worker state projection.
///
/// The `CHECK` keeps a checked-in row pointing at a site.
pub const CREATE_WORKER_STATES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS worker_states (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_id INTEGER NOT NULL UNIQUE REFERENCES workers(id),
    site_id INTEGER REFERENCES sites(id),
    is_checked_in INTEGER NOT NULL DEFAULT 0,
    last_check_in TEXT,
    last_check_out TEXT,
    updated_at TEXT NOT NULL,
    CHECK (is_checked_in = 0 OR site_id IS NOT NULL)
)
";

/// Index used to list who is on a given site.
pub const CREATE_WORKER_STATES_SITE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_worker_states_site ON worker_states(site_id, is_checked_in)
";

/// SQL statement to create the metadata table for storing key-value pairs.
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// All schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_WORKERS_TABLE,
    CREATE_SITES_TABLE,
    CREATE_EVENTS_TABLE,
    CREATE_EVENTS_WORKER_INDEX,
    CREATE_EVENTS_SITE_INDEX,
    CREATE_EVENTS_NO_UPDATE_TRIGGER,
    CREATE_EVENTS_NO_DELETE_TRIGGER,
    CREATE_WORKER_STATES_TABLE,
    CREATE_WORKER_STATES_SITE_INDEX,
    CREATE_METADATA_TABLE,
];
