//! `punchclock` - site attendance with real-time presence synchronization
//!
//! Workers check in to and out of sites. Every check is an immutable event in
//! an append-only ledger; each worker's current presence is a projection of
//! that ledger kept in step transactionally. Sites can be put under
//! emergency, which blocks new check-ins. Every change is published to
//! subscribed observers, and [`sync::ReconciliationClient`] keeps an
//! observer's cached view converged with the authoritative state.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

pub mod attendance;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod locks;
pub mod logging;
pub mod model;
pub mod notifier;
pub mod projector;
pub mod storage;
pub mod sync;

pub use attendance::Attendance;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use logging::init_logging;
pub use model::{
    CheckEvent, EventFilter, EventId, EventKind, Site, SiteId, Worker, WorkerId, WorkerState,
    WorkerStatus,
};
pub use notifier::{Change, ChangeNotifier, Notification, Operation, Subscription, Topic};
pub use storage::{Storage, StorageStats};
