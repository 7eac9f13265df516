//! Observer-side synchronization.
//!
//! A [`ReconciliationClient`] keeps a [`CachedView`] converged with an
//! [`AttendanceBackend`]: it reads everything on start, re-reads when
//! notified, applies optimistic writes for its own actions, and
//! resubscribes when its subscription is lost.

mod backend;
mod client;
mod retry;
mod view;

pub use backend::AttendanceBackend;
pub use client::{
    ActionKind, ActionPhase, ObserverHandle, ObserverSignal, PendingAction, Phase,
    ReconciliationClient, ViewSnapshot,
};
pub use retry::RetryPolicy;
pub use view::{CachedView, Scope, Versioned};
