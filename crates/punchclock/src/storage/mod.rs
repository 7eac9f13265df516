//! Storage layer for punchclock.
//!
//! This module provides `SQLite`-based persistent storage for the attendance
//! ledger, the worker state projection, and the site reference data.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{
    params, params_from_iter, Connection, OpenFlags, OptionalExtension, TransactionBehavior,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{
    CheckEvent, EventFilter, EventId, EventKind, Site, SiteId, Worker, WorkerId, WorkerState,
    WorkerStatus,
};

const WORKER_COLUMNS: &str = "id, name";
const SITE_COLUMNS: &str = "id, name, emergency";
const EVENT_COLUMNS: &str = "id, worker_id, site_id, event_type, timestamp";
const STATE_COLUMNS: &str =
    "worker_id, site_id, is_checked_in, last_check_in, last_check_out, updated_at";
const STATUS_QUERY: &str = r"
    SELECT s.worker_id, s.site_id, s.is_checked_in, s.last_check_in, s.last_check_out,
           s.updated_at, w.name, st.name
    FROM worker_states s
    JOIN workers w ON w.id = s.worker_id
    LEFT JOIN sites st ON st.id = s.site_id
";

/// Connections shared between the ledger, projector, gate and readers.
///
/// [`SharedStorage::lock`] hands out the write connection, which every
/// transaction and read-check-write sequence goes through. Plain reads use
/// [`SharedStorage::read`]. A file-backed database gets a second, read-only
/// connection for them, so under WAL a read never waits behind an append.
#[derive(Debug, Clone)]
pub struct SharedStorage {
    writer: Arc<Mutex<Storage>>,
    reader: Arc<Mutex<Storage>>,
}

impl SharedStorage {
    /// Share one connection for writes and reads.
    #[must_use]
    pub fn new(storage: Storage) -> Self {
        let writer = Arc::new(Mutex::new(storage));
        Self {
            reader: Arc::clone(&writer),
            writer,
        }
    }

    /// Share a write connection and a separate read connection.
    #[must_use]
    pub fn with_reader(writer: Storage, reader: Storage) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        }
    }

    /// Whether reads have a connection of their own.
    #[must_use]
    pub fn has_reader(&self) -> bool {
        !Arc::ptr_eq(&self.writer, &self.reader)
    }

    /// Exclusive use of the write connection.
    pub async fn lock(&self) -> MutexGuard<'_, Storage> {
        self.writer.lock().await
    }

    /// A connection for plain reads.
    pub async fn read(&self) -> MutexGuard<'_, Storage> {
        self.reader.lock().await
    }
}

/// Storage engine for the attendance ledger.
///
/// Provides persistent storage using `SQLite` with support for:
/// - Reference data (workers and sites)
/// - Append-only check-in/check-out events
/// - The per-worker state projection
/// - The idempotent `update_site_emergency` procedure
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Connection,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    /// Initializes the schema if this is a new database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // WAL lets readers proceed while a check-in transaction is open
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Open a read-only connection to the same database file.
    ///
    /// # Errors
    ///
    /// Returns an error for in-memory databases, or if the file cannot be
    /// opened.
    pub fn open_reader(&self) -> Result<Self> {
        if self.path == Path::new(":memory:") {
            return Err(Error::internal(
                "in-memory databases have no second connection",
            ));
        }
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| Error::DatabaseOpen {
            path: self.path.clone(),
            source,
        })?;
        debug!("Opened read connection to {}", self.path.display());

        Ok(Self {
            path: self.path.clone(),
            conn,
        })
    }

    /// Wrap this storage for sharing between services.
    #[must_use]
    pub fn into_shared(self) -> SharedStorage {
        SharedStorage::new(self)
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set how long a statement waits on a locked database before failing.
    ///
    /// # Errors
    ///
    /// Returns an error if the pragma cannot be applied.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<()> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }

    /// Register a worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn add_worker(&self, name: &str) -> Result<Worker> {
        self.conn
            .execute("INSERT INTO workers (name) VALUES (?1)", [name])?;
        let id = WorkerId::new(self.conn.last_insert_rowid());
        debug!("Registered worker {} ({})", id, name);
        Ok(Worker {
            id,
            name: name.to_string(),
        })
    }

    /// Register a site. New sites start without an emergency.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn add_site(&self, name: &str) -> Result<Site> {
        self.conn
            .execute("INSERT INTO sites (name) VALUES (?1)", [name])?;
        let id = SiteId::new(self.conn.last_insert_rowid());
        debug!("Registered site {} ({})", id, name);
        Ok(Site {
            id,
            name: name.to_string(),
            emergency: false,
        })
    }

    /// Get a worker by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn worker(&self, id: WorkerId) -> Result<Option<Worker>> {
        fetch_worker(&self.conn, id)
    }

    /// Get a site by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn site(&self, id: SiteId) -> Result<Option<Site>> {
        fetch_site(&self.conn, id)
    }

    /// List all workers ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn workers(&self) -> Result<Vec<Worker>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {WORKER_COLUMNS} FROM workers ORDER BY name, id"
        ))?;
        let workers = stmt
            .query_map([], row_to_worker)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(workers)
    }

    /// List all sites ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn sites(&self) -> Result<Vec<Site>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {SITE_COLUMNS} FROM sites ORDER BY name, id"))?;
        let sites = stmt
            .query_map([], row_to_site)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sites)
    }

    /// Get the projected state of one worker.
    ///
    /// Returns `None` for a worker that has never checked in.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn worker_state(&self, id: WorkerId) -> Result<Option<WorkerState>> {
        fetch_worker_state(&self.conn, id)
    }

    /// Get every projected state row ordered by worker id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn worker_states(&self) -> Result<Vec<WorkerState>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM worker_states ORDER BY worker_id"
        ))?;
        let states = stmt
            .query_map([], row_to_state)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(states)
    }

    /// Get one worker's state joined with worker and site names.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn worker_status(&self, id: WorkerId) -> Result<Option<WorkerStatus>> {
        let status = self
            .conn
            .query_row(
                &format!("{STATUS_QUERY} WHERE s.worker_id = ?1"),
                [id],
                row_to_status,
            )
            .optional()?;
        Ok(status)
    }

    /// Get every worker state joined with names, most recently changed first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn worker_statuses(&self) -> Result<Vec<WorkerStatus>> {
        let mut stmt = self.conn.prepare(&format!(
            "{STATUS_QUERY} ORDER BY s.updated_at DESC, s.worker_id"
        ))?;
        let statuses = stmt
            .query_map([], row_to_status)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(statuses)
    }

    /// Get the workers currently checked in at a site.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn checked_in_at(&self, site: SiteId) -> Result<Vec<WorkerStatus>> {
        let mut stmt = self.conn.prepare(&format!(
            "{STATUS_QUERY} WHERE s.site_id = ?1 AND s.is_checked_in = 1 ORDER BY w.name, s.worker_id"
        ))?;
        let statuses = stmt
            .query_map([site], row_to_status)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(statuses)
    }

    /// Get a worker's full history in ledger order (oldest first).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn worker_history(&self, id: WorkerId) -> Result<Vec<CheckEvent>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM check_in_events WHERE worker_id = ?1 ORDER BY timestamp, id"
        ))?;
        let events = stmt
            .query_map([id], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Query the ledger, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn events(&self, filter: &EventFilter) -> Result<Vec<CheckEvent>> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM check_in_events WHERE 1 = 1");
        let mut values: Vec<Value> = Vec::new();

        if let Some(site) = filter.site_id {
            values.push(Value::Integer(site.get()));
            sql.push_str(&format!(" AND site_id = ?{}", values.len()));
        }
        if let Some(worker) = filter.worker_id {
            values.push(Value::Integer(worker.get()));
            sql.push_str(&format!(" AND worker_id = ?{}", values.len()));
        }
        if let Some(since) = filter.since {
            values.push(Value::Text(format_timestamp(&since)));
            sql.push_str(&format!(" AND timestamp >= ?{}", values.len()));
        }
        if let Some(until) = filter.until {
            values.push(Value::Text(format_timestamp(&until)));
            sql.push_str(&format!(" AND timestamp <= ?{}", values.len()));
        }

        let limit = filter
            .limit
            .map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));
        values.push(Value::Integer(limit));
        sql.push_str(&format!(
            " ORDER BY timestamp DESC, id DESC LIMIT ?{}",
            values.len()
        ));

        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params_from_iter(values), row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// The `update_site_emergency` procedure.
    ///
    /// Writes the flag only when it differs from the stored value. Returns
    /// whether a change was applied. Callers confirm the effect with a
    /// follow-up [`Storage::site`] read.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn update_site_emergency(&self, site: SiteId, active: bool) -> Result<bool> {
        let affected = self.conn.execute(
            "UPDATE sites SET emergency = ?2 WHERE id = ?1 AND emergency <> ?2",
            params![site, active],
        )?;
        Ok(affected > 0)
    }

    /// Overwrite (or remove) a worker's projected state unconditionally.
    ///
    /// Only used when repairing the projection from the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn replace_worker_state(&self, worker: WorkerId, state: Option<&WorkerState>) -> Result<()> {
        match state {
            Some(state) => {
                upsert_state(&self.conn, state, None)?;
            }
            None => {
                self.conn
                    .execute("DELETE FROM worker_states WHERE worker_id = ?1", [worker])?;
            }
        }
        Ok(())
    }

    /// Begin a ledger transaction.
    ///
    /// The transaction takes the database write lock immediately, so the
    /// state read inside it cannot be invalidated by another writer before
    /// commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the write lock cannot be acquired.
    pub fn begin(&mut self) -> Result<LedgerTx<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(LedgerTx { tx })
    }

    /// Get database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let count = |sql: &str| -> Result<i64> {
            Ok(self.conn.query_row(sql, [], |row| row.get(0))?)
        };

        let workers = count("SELECT COUNT(*) FROM workers")?;
        let sites = count("SELECT COUNT(*) FROM sites")?;
        let events = count("SELECT COUNT(*) FROM check_in_events")?;
        let checked_in = count("SELECT COUNT(*) FROM worker_states WHERE is_checked_in = 1")?;

        let bound = |order: &str| -> Result<Option<DateTime<Utc>>> {
            let raw: Option<String> = self
                .conn
                .query_row(
                    &format!("SELECT timestamp FROM check_in_events ORDER BY timestamp {order} LIMIT 1"),
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(raw
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)))
        };

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            workers,
            sites,
            events,
            checked_in,
            oldest_event: bound("ASC")?,
            newest_event: bound("DESC")?,
            db_size_bytes,
        })
    }
}

/// An open ledger transaction.
///
/// Dropping it without [`LedgerTx::commit`] rolls back every write.
#[derive(Debug)]
pub struct LedgerTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl LedgerTx<'_> {
    /// Get a worker by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn worker(&self, id: WorkerId) -> Result<Option<Worker>> {
        fetch_worker(&self.tx, id)
    }

    /// Get a site by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn site(&self, id: SiteId) -> Result<Option<Site>> {
        fetch_site(&self.tx, id)
    }

    /// Get the projected state of one worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn worker_state(&self, id: WorkerId) -> Result<Option<WorkerState>> {
        fetch_worker_state(&self.tx, id)
    }

    /// Append an event to the ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn insert_event(
        &self,
        worker_id: WorkerId,
        site_id: SiteId,
        kind: EventKind,
        timestamp: DateTime<Utc>,
    ) -> Result<CheckEvent> {
        self.tx.execute(
            r"
            INSERT INTO check_in_events (worker_id, site_id, event_type, timestamp)
            VALUES (?1, ?2, ?3, ?4)
            ",
            params![
                worker_id,
                site_id,
                kind.as_db_str(),
                format_timestamp(&timestamp)
            ],
        )?;

        let id = EventId::new(self.tx.last_insert_rowid());
        debug!("Appended {} event {} for worker {}", kind, id, worker_id);
        Ok(CheckEvent {
            id,
            worker_id,
            site_id,
            kind,
            timestamp,
        })
    }

    /// Write a worker's state if its stored check-in flag still equals
    /// `expected_checked_in`.
    ///
    /// Returns `false` when the stored row no longer matches, in which case
    /// nothing is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn store_state(&self, state: &WorkerState, expected_checked_in: bool) -> Result<bool> {
        upsert_state(&self.tx, state, Some(expected_checked_in))
    }

    /// Commit every write made through this transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails; nothing is persisted in that case.
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

/// Statistics about the storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of registered workers.
    pub workers: i64,
    /// Number of registered sites.
    pub sites: i64,
    /// Number of ledger events.
    pub events: i64,
    /// Number of workers currently checked in anywhere.
    pub checked_in: i64,
    /// Timestamp of the oldest ledger event.
    pub oldest_event: Option<DateTime<Utc>>,
    /// Timestamp of the newest ledger event.
    pub newest_event: Option<DateTime<Utc>>,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

/// Format a timestamp the way the ledger stores it.
///
/// Fixed microsecond precision keeps lexical and chronological order equal.
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_optional_timestamp(
    idx: usize,
    raw: Option<String>,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_timestamp(idx, &s)).transpose()
}

fn fetch_worker(conn: &Connection, id: WorkerId) -> Result<Option<Worker>> {
    let worker = conn
        .query_row(
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
            [id],
            row_to_worker,
        )
        .optional()?;
    Ok(worker)
}

fn fetch_site(conn: &Connection, id: SiteId) -> Result<Option<Site>> {
    let site = conn
        .query_row(
            &format!("SELECT {SITE_COLUMNS} FROM sites WHERE id = ?1"),
            [id],
            row_to_site,
        )
        .optional()?;
    Ok(site)
}

fn fetch_worker_state(conn: &Connection, id: WorkerId) -> Result<Option<WorkerState>> {
    let state = conn
        .query_row(
            &format!("SELECT {STATE_COLUMNS} FROM worker_states WHERE worker_id = ?1"),
            [id],
            row_to_state,
        )
        .optional()?;
    Ok(state)
}

fn upsert_state(
    conn: &Connection,
    state: &WorkerState,
    expected_checked_in: Option<bool>,
) -> Result<bool> {
    let affected = conn.execute(
        r"
        INSERT INTO worker_states
            (worker_id, site_id, is_checked_in, last_check_in, last_check_out, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(worker_id) DO UPDATE SET
            site_id = excluded.site_id,
            is_checked_in = excluded.is_checked_in,
            last_check_in = excluded.last_check_in,
            last_check_out = excluded.last_check_out,
            updated_at = excluded.updated_at
        WHERE ?7 IS NULL OR worker_states.is_checked_in = ?7
        ",
        params![
            state.worker_id,
            state.site_id,
            state.is_checked_in,
            state.last_check_in.as_ref().map(format_timestamp),
            state.last_check_out.as_ref().map(format_timestamp),
            format_timestamp(&state.updated_at),
            expected_checked_in,
        ],
    )?;
    Ok(affected == 1)
}

fn row_to_worker(row: &rusqlite::Row) -> rusqlite::Result<Worker> {
    Ok(Worker {
        id: row.get(0)?,
        name: row.get(1)?,
    })
}

fn row_to_site(row: &rusqlite::Row) -> rusqlite::Result<Site> {
    Ok(Site {
        id: row.get(0)?,
        name: row.get(1)?,
        emergency: row.get(2)?,
    })
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<CheckEvent> {
    let kind_str: String = row.get(3)?;
    let kind = EventKind::from_db_str(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            format!("unknown event type: {kind_str}").into(),
        )
    })?;
    let timestamp_str: String = row.get(4)?;

    Ok(CheckEvent {
        id: row.get(0)?,
        worker_id: row.get(1)?,
        site_id: row.get(2)?,
        kind,
        timestamp: parse_timestamp(4, &timestamp_str)?,
    })
}

fn row_to_state(row: &rusqlite::Row) -> rusqlite::Result<WorkerState> {
    let updated_at: String = row.get(5)?;
    Ok(WorkerState {
        worker_id: row.get(0)?,
        site_id: row.get(1)?,
        is_checked_in: row.get(2)?,
        last_check_in: parse_optional_timestamp(3, row.get(3)?)?,
        last_check_out: parse_optional_timestamp(4, row.get(4)?)?,
        updated_at: parse_timestamp(5, &updated_at)?,
    })
}

fn row_to_status(row: &rusqlite::Row) -> rusqlite::Result<WorkerStatus> {
    Ok(WorkerStatus {
        state: row_to_state(row)?,
        worker_name: row.get(6)?,
        site_name: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn create_test_storage() -> Storage {
        Storage::open_in_memory().expect("failed to create test storage")
    }

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, minute, 0).unwrap()
    }

    fn checked_in(worker: WorkerId, site: SiteId, ts: DateTime<Utc>) -> WorkerState {
        WorkerState {
            worker_id: worker,
            site_id: Some(site),
            is_checked_in: true,
            last_check_in: Some(ts),
            last_check_out: None,
            updated_at: ts,
        }
    }

    #[test]
    fn test_open_in_memory() {
        let storage = Storage::open_in_memory();
        assert!(storage.is_ok());
    }

    #[test]
    fn test_add_and_get_reference_data() {
        let storage = create_test_storage();
        let worker = storage.add_worker("Ada").unwrap();
        let site = storage.add_site("North Yard").unwrap();

        assert_eq!(storage.worker(worker.id).unwrap(), Some(worker));
        assert_eq!(storage.site(site.id).unwrap(), Some(site.clone()));
        assert!(!site.emergency);
        assert!(storage.worker(WorkerId::new(999)).unwrap().is_none());
    }

    #[test]
    fn test_lists_are_ordered_by_name() {
        let storage = create_test_storage();
        storage.add_worker("Zed").unwrap();
        storage.add_worker("Ada").unwrap();
        storage.add_site("South").unwrap();
        storage.add_site("East").unwrap();

        let names: Vec<_> = storage.workers().unwrap().into_iter().map(|w| w.name).collect();
        assert_eq!(names, ["Ada", "Zed"]);

        let names: Vec<_> = storage.sites().unwrap().into_iter().map(|s| s.name).collect();
        assert_eq!(names, ["East", "South"]);
    }

    #[test]
    fn test_transaction_appends_event_and_state() {
        let mut storage = create_test_storage();
        let worker = storage.add_worker("Ada").unwrap();
        let site = storage.add_site("Yard").unwrap();

        let tx = storage.begin().unwrap();
        let event = tx
            .insert_event(worker.id, site.id, EventKind::Enter, at(9, 0))
            .unwrap();
        assert!(tx
            .store_state(&checked_in(worker.id, site.id, at(9, 0)), false)
            .unwrap());
        tx.commit().unwrap();

        assert_eq!(storage.worker_history(worker.id).unwrap(), vec![event]);
        let state = storage.worker_state(worker.id).unwrap().unwrap();
        assert!(state.is_checked_in);
        assert_eq!(state.site_id, Some(site.id));
    }

    #[test]
    fn test_transaction_rolls_back_on_drop() {
        let mut storage = create_test_storage();
        let worker = storage.add_worker("Ada").unwrap();
        let site = storage.add_site("Yard").unwrap();

        {
            let tx = storage.begin().unwrap();
            tx.insert_event(worker.id, site.id, EventKind::Enter, at(9, 0))
                .unwrap();
        }

        assert!(storage.worker_history(worker.id).unwrap().is_empty());
        assert_eq!(storage.stats().unwrap().events, 0);
    }

    #[test]
    fn test_store_state_compare_and_swap() {
        let mut storage = create_test_storage();
        let worker = storage.add_worker("Ada").unwrap();
        let site = storage.add_site("Yard").unwrap();
        let state = checked_in(worker.id, site.id, at(9, 0));

        let tx = storage.begin().unwrap();
        assert!(tx.store_state(&state, false).unwrap());
        // The row now says checked-in, so a second "expected not checked in" write loses.
        assert!(!tx.store_state(&state, false).unwrap());
        tx.commit().unwrap();
    }

    #[test]
    fn test_state_check_constraint() {
        let storage = create_test_storage();
        let worker = storage.add_worker("Ada").unwrap();
        let mut state = checked_in(worker.id, SiteId::new(1), at(9, 0));
        state.site_id = None;

        assert!(storage.replace_worker_state(worker.id, Some(&state)).is_err());
    }

    #[test]
    fn test_events_filters() {
        let mut storage = create_test_storage();
        let ada = storage.add_worker("Ada").unwrap();
        let bob = storage.add_worker("Bob").unwrap();
        let yard = storage.add_site("Yard").unwrap();
        let dock = storage.add_site("Dock").unwrap();

        let tx = storage.begin().unwrap();
        tx.insert_event(ada.id, yard.id, EventKind::Enter, at(8, 0))
            .unwrap();
        tx.insert_event(bob.id, dock.id, EventKind::Enter, at(9, 0))
            .unwrap();
        tx.insert_event(ada.id, yard.id, EventKind::Leave, at(12, 0))
            .unwrap();
        tx.commit().unwrap();

        let all = storage.events(&EventFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].timestamp, at(12, 0), "newest first");

        let yard_only = storage
            .events(&EventFilter {
                site_id: Some(yard.id),
                ..EventFilter::default()
            })
            .unwrap();
        assert_eq!(yard_only.len(), 2);

        let bob_only = storage
            .events(&EventFilter {
                worker_id: Some(bob.id),
                ..EventFilter::default()
            })
            .unwrap();
        assert_eq!(bob_only.len(), 1);
        assert_eq!(bob_only[0].site_id, dock.id);

        let morning = storage
            .events(&EventFilter {
                since: Some(at(8, 30)),
                until: Some(at(12, 0)),
                ..EventFilter::default()
            })
            .unwrap();
        assert_eq!(morning.len(), 2);

        let limited = storage
            .events(&EventFilter {
                limit: Some(1),
                ..EventFilter::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_worker_history_is_ledger_ordered() {
        let mut storage = create_test_storage();
        let ada = storage.add_worker("Ada").unwrap();
        let yard = storage.add_site("Yard").unwrap();

        let tx = storage.begin().unwrap();
        let first = tx
            .insert_event(ada.id, yard.id, EventKind::Enter, at(9, 0))
            .unwrap();
        let second = tx
            .insert_event(ada.id, yard.id, EventKind::Leave, at(9, 0))
            .unwrap();
        tx.commit().unwrap();

        let history = storage.worker_history(ada.id).unwrap();
        assert_eq!(history, vec![first, second], "ties break on insertion order");
    }

    #[test]
    fn test_update_site_emergency_is_idempotent() {
        let storage = create_test_storage();
        let site = storage.add_site("Yard").unwrap();

        assert!(storage.update_site_emergency(site.id, true).unwrap());
        assert!(!storage.update_site_emergency(site.id, true).unwrap());
        assert!(storage.site(site.id).unwrap().unwrap().emergency);

        assert!(storage.update_site_emergency(site.id, false).unwrap());
        assert!(!storage.site(site.id).unwrap().unwrap().emergency);
    }

    #[test]
    fn test_statuses_join_names() {
        let storage = create_test_storage();
        let ada = storage.add_worker("Ada").unwrap();
        let yard = storage.add_site("Yard").unwrap();
        storage
            .replace_worker_state(ada.id, Some(&checked_in(ada.id, yard.id, at(9, 0))))
            .unwrap();

        let status = storage.worker_status(ada.id).unwrap().unwrap();
        assert_eq!(status.worker_name, "Ada");
        assert_eq!(status.site_name.as_deref(), Some("Yard"));

        assert_eq!(storage.worker_statuses().unwrap().len(), 1);
        assert_eq!(storage.checked_in_at(yard.id).unwrap().len(), 1);
        assert!(storage.checked_in_at(SiteId::new(42)).unwrap().is_empty());

        storage.replace_worker_state(ada.id, None).unwrap();
        assert!(storage.worker_status(ada.id).unwrap().is_none());
    }

    #[test]
    fn test_stats() {
        let mut storage = create_test_storage();
        let empty = storage.stats().unwrap();
        assert_eq!(empty.events, 0);
        assert!(empty.oldest_event.is_none());

        let ada = storage.add_worker("Ada").unwrap();
        let yard = storage.add_site("Yard").unwrap();
        let tx = storage.begin().unwrap();
        tx.insert_event(ada.id, yard.id, EventKind::Enter, at(9, 0))
            .unwrap();
        tx.insert_event(ada.id, yard.id, EventKind::Leave, at(17, 0))
            .unwrap();
        tx.commit().unwrap();

        let stats = storage.stats().unwrap();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.sites, 1);
        assert_eq!(stats.events, 2);
        assert_eq!(stats.oldest_event, Some(at(9, 0)));
        assert_eq!(stats.newest_event, Some(at(17, 0)));
        assert_eq!(stats.db_size_bytes, 0);
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let a = format_timestamp(&at(9, 0));
        assert_eq!(a, "2025-03-01T09:00:00.000000Z");
        assert!(format_timestamp(&at(9, 0)) < format_timestamp(&at(10, 0)));
    }

    #[test]
    fn test_open_file_based() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("attendance.db");

        let storage = Storage::open(&db_path).unwrap();
        storage.add_worker("Ada").unwrap();
        assert_eq!(storage.path(), db_path);
        drop(storage);

        let reopened = Storage::open(&db_path).unwrap();
        assert_eq!(reopened.workers().unwrap().len(), 1);
        assert!(reopened.stats().unwrap().db_size_bytes > 0);
    }

    #[tokio::test]
    async fn test_reader_does_not_wait_for_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("attendance.db");
        let storage = Storage::open(&db_path).unwrap();
        let worker = storage.add_worker("Ada").unwrap().id;
        let site = storage.add_site("Yard").unwrap().id;
        let reader = storage.open_reader().unwrap();
        let shared = SharedStorage::with_reader(storage, reader);
        assert!(shared.has_reader());

        let mut writer = shared.lock().await;
        let tx = writer.begin().unwrap();
        tx.insert_event(worker, site, EventKind::Enter, at(9, 0)).unwrap();

        let read = tokio::time::timeout(Duration::from_secs(1), shared.read())
            .await
            .expect("read waited for the writer");
        assert_eq!(read.workers().unwrap().len(), 1);
        assert_eq!(read.stats().unwrap().events, 0, "uncommitted event is invisible");
        drop(read);

        tx.commit().unwrap();
        drop(writer);
        assert_eq!(shared.read().await.stats().unwrap().events, 1);
    }

    #[test]
    fn test_in_memory_storage_shares_one_connection() {
        let storage = create_test_storage();
        assert!(storage.open_reader().is_err());
        assert!(!storage.into_shared().has_reader());
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let nested_path = dir.path().join("nested/deeper/attendance.db");

        let storage = Storage::open(&nested_path).unwrap();
        assert!(nested_path.exists());
        drop(storage);
    }
}
