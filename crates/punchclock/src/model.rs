//! Core attendance types for punchclock.
//!
//! Workers and sites are reference data. `CheckEvent`s are the immutable
//! ledger facts, and `WorkerState` is the projection derived from them.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw database identifier.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// The raw database identifier.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Display::fmt(&self.0, f)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                i64::column_result(value).map(Self)
            }
        }
    };
}

id_type!(
    /// Identifier of a worker.
    WorkerId
);
id_type!(
    /// Identifier of a site.
    SiteId
);
id_type!(
    /// Identifier of a ledger event; strictly increasing in insertion order.
    EventId
);

/// A worker. Identity only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique identifier.
    pub id: WorkerId,
    /// Display name.
    pub name: String,
}

/// A physical site workers check in to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    /// Unique identifier.
    pub id: SiteId,
    /// Display name.
    pub name: String,
    /// Whether the site is under emergency; blocks new check-ins.
    pub emergency: bool,
}

/// The two kinds of ledger events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// The worker entered the site.
    #[serde(rename = "check_in")]
    Enter,
    /// The worker left the site.
    #[serde(rename = "check_out")]
    Leave,
}

impl EventKind {
    /// The persisted `event_type` value.
    #[must_use]
    pub fn as_db_str(self) -> &'static str {
        match self {
            Self::Enter => "check_in",
            Self::Leave => "check_out",
        }
    }

    /// Parse a persisted `event_type` value.
    #[must_use]
    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "check_in" => Some(Self::Enter),
            "check_out" => Some(Self::Leave),
            _ => None,
        }
    }

    /// Whether this event opens a presence interval.
    #[must_use]
    pub fn is_enter(self) -> bool {
        matches!(self, Self::Enter)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Enter => write!(f, "check-in"),
            Self::Leave => write!(f, "check-out"),
        }
    }
}

/// An immutable ledger fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckEvent {
    /// Ledger identifier, assigned on append.
    pub id: EventId,
    /// The worker the event is about.
    pub worker_id: WorkerId,
    /// The site the event happened at.
    pub site_id: SiteId,
    /// Enter or leave.
    #[serde(rename = "event_type")]
    pub kind: EventKind,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
}

/// Current presence of one worker, derived from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerState {
    /// The worker.
    pub worker_id: WorkerId,
    /// Site the worker is currently at, `None` when not present anywhere.
    pub site_id: Option<SiteId>,
    /// Whether the worker has an open check-in.
    pub is_checked_in: bool,
    /// Timestamp of the most recent check-in.
    pub last_check_in: Option<DateTime<Utc>>,
    /// Timestamp of the most recent check-out.
    pub last_check_out: Option<DateTime<Utc>>,
    /// Timestamp of the event that last changed this row.
    pub updated_at: DateTime<Utc>,
}

impl WorkerState {
    /// Whether the row satisfies the presence invariant on its own.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.is_checked_in == self.site_id.is_some()
    }
}

/// A worker state joined with the worker's and site's names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// The projected state.
    #[serde(flatten)]
    pub state: WorkerState,
    /// Name of the worker.
    pub worker_name: String,
    /// Name of the current site, if any.
    pub site_name: Option<String>,
}

impl WorkerStatus {
    /// The worker this status describes.
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.state.worker_id
    }

    /// Whether the worker is checked in at `site`.
    #[must_use]
    pub fn is_present_at(&self, site: SiteId) -> bool {
        self.state.is_checked_in && self.state.site_id == Some(site)
    }
}

/// Filters for ledger history queries.
///
/// All bounds are inclusive. Results are ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Only events at this site.
    pub site_id: Option<SiteId>,
    /// Only events for this worker.
    pub worker_id: Option<WorkerId>,
    /// Only events at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only events at or before this instant.
    pub until: Option<DateTime<Utc>>,
    /// Maximum number of events to return.
    pub limit: Option<usize>,
}
