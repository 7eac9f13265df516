//! Change notification fan-out.
//!
//! Every committed change to worker states or site flags is published as a
//! [`Notification`] carrying a sequence number. Observers hold a
//! [`Subscription`] and treat each notification as a hint to re-read.
//! A subscription that falls behind or is disconnected reports
//! [`Error::SubscriptionLost`] instead of silently skipping changes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::model::{EventKind, SiteId, WorkerId};

/// Default capacity of the change channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default capacity of the announcement channel.
pub const DEFAULT_ANNOUNCEMENT_CAPACITY: usize = 64;

/// The table a notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// The worker state projection.
    WorkerStates,
    /// Site reference data and emergency flags.
    Sites,
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WorkerStates => write!(f, "worker_states"),
            Self::Sites => write!(f, "sites"),
        }
    }
}

/// What happened to the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// A row was created.
    Insert,
    /// A row was modified.
    Update,
    /// A row was removed.
    Delete,
}

/// Snapshot of the changed row.
///
/// Snapshots are hints. Receivers must be prepared to re-read when a field
/// they need is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    /// A worker's presence changed.
    Attendance {
        /// The worker whose state changed.
        worker_id: WorkerId,
        /// The worker's site after the change.
        site_id: Option<SiteId>,
    },
    /// A site row changed.
    Site {
        /// The site.
        site_id: SiteId,
        /// The new emergency flag, when known.
        emergency: Option<bool>,
    },
}

impl Change {
    /// The topic this change is published on.
    #[must_use]
    pub fn topic(&self) -> Topic {
        match self {
            Self::Attendance { .. } => Topic::WorkerStates,
            Self::Site { .. } => Topic::Sites,
        }
    }
}

/// A published change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Position in the global publish order, starting at 1.
    pub sequence: u64,
    /// What happened to the row.
    pub operation: Operation,
    /// Snapshot of the new row.
    pub change: Change,
}

impl Notification {
    /// The topic this notification was published on.
    #[must_use]
    pub fn topic(&self) -> Topic {
        self.change.topic()
    }
}

/// Same-process broadcast of a completed check-in or check-out.
///
/// Terminals use these to show who just arrived or left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Enter or leave.
    pub kind: EventKind,
    /// The worker.
    pub worker_id: WorkerId,
    /// The site.
    pub site_id: SiteId,
    /// Display name of the worker.
    pub worker_name: String,
    /// Ledger timestamp of the event.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Inner {
    changes: broadcast::Sender<Notification>,
    announcements: broadcast::Sender<Announcement>,
    // Guards sequence assignment and send together so channel order matches sequence order.
    sequence: Mutex<u64>,
    epoch: watch::Sender<u64>,
    live: AtomicUsize,
}

/// Publish/subscribe hub for attendance changes.
///
/// Cloning is cheap; clones publish to the same subscribers.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    inner: Arc<Inner>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY, DEFAULT_ANNOUNCEMENT_CAPACITY)
    }
}

impl ChangeNotifier {
    /// Create a notifier whose subscribers may fall `capacity` notifications
    /// behind before they are considered lost.
    #[must_use]
    pub fn new(capacity: usize, announcement_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        let (announcements, _) = broadcast::channel(announcement_capacity.max(1));
        let (epoch, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                changes,
                announcements,
                sequence: Mutex::new(0),
                epoch,
                live: AtomicUsize::new(0),
            }),
        }
    }

    /// Publish a change and return the notification that was sent.
    ///
    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, operation: Operation, change: Change) -> Notification {
        let mut sequence = self
            .inner
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *sequence += 1;

        let notification = Notification {
            sequence: *sequence,
            operation,
            change,
        };
        let receivers = self.inner.changes.send(notification.clone()).unwrap_or(0);
        trace!(
            sequence = notification.sequence,
            topic = %notification.topic(),
            receivers,
            "Published notification"
        );
        notification
    }

    /// Broadcast an announcement to terminals in this process.
    pub fn announce(&self, announcement: Announcement) {
        let receivers = self.inner.announcements.send(announcement).unwrap_or(0);
        trace!(receivers, "Published announcement");
    }

    /// The sequence number of the most recent notification, 0 if none.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        *self
            .inner
            .sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a subscription that receives every notification published from
    /// now on.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let live = self.inner.live.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(live, "Subscription opened");
        Subscription {
            rx: self.inner.changes.subscribe(),
            epoch: self.inner.epoch.subscribe(),
            inner: Arc::clone(&self.inner),
            released: false,
        }
    }

    /// Receive announcements published from now on.
    #[must_use]
    pub fn subscribe_announcements(&self) -> broadcast::Receiver<Announcement> {
        self.inner.announcements.subscribe()
    }

    /// Number of subscriptions that have not been closed or dropped.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Terminate every open subscription, as a restarted notification
    /// server would. Subscribers see [`Error::SubscriptionLost`].
    pub fn disconnect_all(&self) {
        self.inner.epoch.send_modify(|epoch| *epoch += 1);
        debug!("Disconnected all subscriptions");
    }
}

/// A live stream of notifications.
///
/// Owned by exactly one observer. Closing or dropping it releases the
/// subscriber slot once.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Notification>,
    epoch: watch::Receiver<u64>,
    inner: Arc<Inner>,
    released: bool,
}

impl Subscription {
    /// Wait for the next notification.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SubscriptionLost`] if this subscriber fell behind,
    /// was disconnected, or was already closed. The subscription is closed
    /// afterwards and every later call fails the same way.
    pub async fn recv(&mut self) -> Result<Notification> {
        if self.released {
            return Err(Error::subscription_lost("subscription closed"));
        }

        let outcome = tokio::select! {
            biased;
            _ = self.epoch.changed() => Err(Error::subscription_lost("disconnected by notifier")),
            received = self.rx.recv() => match received {
                Ok(notification) => Ok(notification),
                Err(RecvError::Lagged(skipped)) => Err(Error::subscription_lost(format!(
                    "lagged by {skipped} notifications"
                ))),
                Err(RecvError::Closed) => Err(Error::subscription_lost("notifier closed")),
            },
        };

        if outcome.is_err() {
            self.close();
        }
        outcome
    }

    /// Whether [`Subscription::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.released
    }

    /// Release the subscription. Safe to call more than once.
    pub fn close(&mut self) {
        if !self.released {
            self.released = true;
            let live = self.inner.live.fetch_sub(1, Ordering::SeqCst) - 1;
            debug!(live, "Subscription closed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
