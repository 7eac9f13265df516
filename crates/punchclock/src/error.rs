//! Error types for punchclock.
//!
//! Attendance outcomes (`NotFound`, `AlreadyCheckedIn`, `NotCheckedIn`,
//! `EmergencyBlocked`) are expected results that callers show to users.
//! Everything else is an infrastructure failure.

use std::path::PathBuf;
use thiserror::Error;

use crate::model::{SiteId, WorkerId};

/// The kind of entity a `NotFound` error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A worker reference.
    Worker,
    /// A site reference.
    Site,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Worker => write!(f, "worker"),
            Self::Site => write!(f, "site"),
        }
    }
}

/// The main error type for punchclock operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Attendance Outcomes ===
    /// A worker or site reference does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// Which kind of entity was looked up.
        entity: EntityKind,
        /// The identifier that was not found.
        id: i64,
    },

    /// A check-in was attempted for a worker who is already checked in.
    #[error("worker {worker_id} is already checked in")]
    AlreadyCheckedIn {
        /// The worker.
        worker_id: WorkerId,
    },

    /// A check-out was attempted for a worker who is not checked in.
    #[error("worker {worker_id} is not checked in")]
    NotCheckedIn {
        /// The worker.
        worker_id: WorkerId,
    },

    /// A check-in was refused because the site is in emergency mode.
    #[error("site {site_id} is in emergency mode; check-in is blocked")]
    EmergencyBlocked {
        /// The site under emergency.
        site_id: SiteId,
    },

    // === Synchronization Errors ===
    /// A read or write against the authoritative store failed.
    #[error("sync failure: {message}")]
    SyncFailure {
        /// Description of what went wrong.
        message: String,
    },

    /// The live notification subscription was dropped.
    #[error("subscription lost: {reason}")]
    SubscriptionLost {
        /// Why the subscription ended.
        reason: String,
    },

    /// The observing context was torn down while the operation was in flight.
    #[error("operation cancelled")]
    Cancelled,

    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for punchclock operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a not-found error for a worker.
    #[must_use]
    pub fn worker_not_found(id: WorkerId) -> Self {
        Self::NotFound {
            entity: EntityKind::Worker,
            id: id.get(),
        }
    }

    /// Create a not-found error for a site.
    #[must_use]
    pub fn site_not_found(id: SiteId) -> Self {
        Self::NotFound {
            entity: EntityKind::Site,
            id: id.get(),
        }
    }

    /// Create a new sync failure.
    #[must_use]
    pub fn sync(message: impl Into<String>) -> Self {
        Self::SyncFailure {
            message: message.into(),
        }
    }

    /// Create a new subscription-lost error.
    #[must_use]
    pub fn subscription_lost(reason: impl Into<String>) -> Self {
        Self::SubscriptionLost {
            reason: reason.into(),
        }
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Check if this error is an expected attendance outcome.
    ///
    /// These are returned to the caller as-is and never retried.
    #[must_use]
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::AlreadyCheckedIn { .. }
                | Self::NotCheckedIn { .. }
                | Self::EmergencyBlocked { .. }
        )
    }

    /// Check if this error is a storage or transport failure.
    #[must_use]
    pub fn is_sync_failure(&self) -> bool {
        matches!(
            self,
            Self::SyncFailure { .. } | Self::DatabaseQuery(_) | Self::Timeout { .. }
        )
    }

    /// Check if a background read that failed with this error may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_sync_failure()
    }

    /// Check if this error indicates a dropped notification subscription.
    #[must_use]
    pub fn is_subscription_lost(&self) -> bool {
        matches!(self, Self::SubscriptionLost { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::worker_not_found(WorkerId::new(7));
        assert_eq!(err.to_string(), "worker 7 not found");

        let err = Error::site_not_found(SiteId::new(3));
        assert_eq!(err.to_string(), "site 3 not found");

        let err = Error::sync("connection reset");
        assert_eq!(err.to_string(), "sync failure: connection reset");
    }

    #[test]
    fn test_business_outcomes_are_distinguishable() {
        let worker_id = WorkerId::new(1);
        let site_id = SiteId::new(2);

        let outcomes = [
            Error::worker_not_found(worker_id),
            Error::AlreadyCheckedIn { worker_id },
            Error::NotCheckedIn { worker_id },
            Error::EmergencyBlocked { site_id },
        ];
        for err in &outcomes {
            assert!(err.is_business(), "{err} should be a business outcome");
            assert!(!err.is_retryable(), "{err} must not be retried");
        }

        assert!(matches!(outcomes[1], Error::AlreadyCheckedIn { .. }));
        assert!(matches!(outcomes[3], Error::EmergencyBlocked { .. }));
    }

    #[test]
    fn test_sync_failures_are_retryable() {
        assert!(Error::sync("boom").is_retryable());
        assert!(Error::Timeout {
            operation: "fetch sites".to_string()
        }
        .is_retryable());
        assert!(!Error::sync("boom").is_business());
    }

    #[test]
    fn test_subscription_lost() {
        let err = Error::subscription_lost("lagged by 4 notifications");
        assert!(err.is_subscription_lost());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("lagged by 4"));
    }

    #[test]
    fn test_internal_error() {
        let err = Error::internal("something went wrong");
        assert_eq!(err.to_string(), "internal error: something went wrong");
    }

    #[test]
    fn test_emergency_blocked_display() {
        let err = Error::EmergencyBlocked {
            site_id: SiteId::new(4),
        };
        assert!(err.to_string().contains("site 4"));
        assert!(err.to_string().contains("emergency"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_rusqlite_error() {
        let result = rusqlite::Connection::open_with_flags(
            "/nonexistent/path/db.sqlite",
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        );
        if let Err(sqlite_err) = result {
            let err: Error = sqlite_err.into();
            assert!(matches!(err, Error::DatabaseQuery(_)));
            assert!(err.is_sync_failure());
        }
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_database_migration_error_display() {
        let err = Error::DatabaseMigration {
            message: "version mismatch".to_string(),
        };
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn test_config_validation_error_display() {
        let err = Error::ConfigValidation {
            message: "debounce_ms must be greater than 0".to_string(),
        };
        assert!(err.to_string().contains("debounce_ms"));
    }

    #[test]
    fn test_directory_create_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::DirectoryCreate {
            path: PathBuf::from("/root/forbidden"),
            source: io_err,
        };
        assert!(err.to_string().contains("/root/forbidden"));
    }
}
