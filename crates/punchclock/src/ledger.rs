//! The append-only check-in/check-out ledger.
//!
//! [`EventLedger::append`] is the only way events enter the system. For a
//! given worker it runs strictly one at a time:
//!
//! 1. take the worker's lock
//! 2. open an immediate transaction
//! 3. validate references, the emergency gate, and the worker's current state
//! 4. insert the event and update the projection with a compare-and-swap
//! 5. commit, then publish
//!
//! A failure anywhere before commit leaves no trace in the database.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::{ledger_precision, Clock};
use crate::error::{Error, Result};
use crate::gate::EmergencyGate;
use crate::locks::WorkerLocks;
use crate::model::{CheckEvent, EventKind, SiteId, WorkerId, WorkerState};
use crate::notifier::{Announcement, Change, ChangeNotifier, Operation};
use crate::projector::StateProjector;
use crate::storage::SharedStorage;

/// Appends events and keeps the projection in step.
#[derive(Debug, Clone)]
pub struct EventLedger {
    storage: SharedStorage,
    locks: Arc<WorkerLocks>,
    clock: Arc<dyn Clock>,
    notifier: ChangeNotifier,
}

impl EventLedger {
    /// Create a ledger over shared storage.
    #[must_use]
    pub fn new(
        storage: SharedStorage,
        locks: Arc<WorkerLocks>,
        clock: Arc<dyn Clock>,
        notifier: ChangeNotifier,
    ) -> Self {
        Self {
            storage,
            locks,
            clock,
            notifier,
        }
    }

    /// Append an event for `worker_id` at `site_id`.
    ///
    /// On success the event and the updated worker state are both committed,
    /// and an attendance notification has been published.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the worker or site does not exist
    /// - [`Error::EmergencyBlocked`] for a check-in at a site under emergency
    /// - [`Error::AlreadyCheckedIn`] / [`Error::NotCheckedIn`] if the event
    ///   contradicts the worker's current state
    /// - a storage error if the transaction fails; nothing is written then
    pub async fn append(
        &self,
        worker_id: WorkerId,
        site_id: SiteId,
        kind: EventKind,
    ) -> Result<CheckEvent> {
        let _guard = self.locks.acquire(worker_id).await;
        let mut storage = self.storage.lock().await;
        let tx = storage.begin()?;

        let worker = tx
            .worker(worker_id)?
            .ok_or_else(|| Error::worker_not_found(worker_id))?;
        let site = tx
            .site(site_id)?
            .ok_or_else(|| Error::site_not_found(site_id))?;

        if let Err(err) = EmergencyGate::admit(&site, kind) {
            warn!(worker = %worker_id, site = %site_id, "Check-in refused: site under emergency");
            return Err(err);
        }

        let prev = tx.worker_state(worker_id)?;
        let checked_in = prev.as_ref().is_some_and(|s| s.is_checked_in);
        match kind {
            EventKind::Enter if checked_in => {
                debug!(worker = %worker_id, "Rejecting duplicate check-in");
                return Err(Error::AlreadyCheckedIn { worker_id });
            }
            EventKind::Leave if !checked_in => {
                debug!(worker = %worker_id, "Rejecting check-out without check-in");
                return Err(Error::NotCheckedIn { worker_id });
            }
            _ => {}
        }

        let timestamp = self.next_timestamp(prev.as_ref());
        let event = tx.insert_event(worker_id, site_id, kind, timestamp)?;
        let state = StateProjector::apply(&tx, prev.as_ref(), &event)?;
        tx.commit()?;

        // Still under the worker lock, so one worker's notifications go out
        // in commit order.
        let operation = if prev.is_some() {
            Operation::Update
        } else {
            Operation::Insert
        };
        self.notifier.publish(
            operation,
            Change::Attendance {
                worker_id,
                site_id: state.site_id,
            },
        );
        self.notifier.announce(Announcement {
            kind,
            worker_id,
            site_id,
            worker_name: worker.name.clone(),
            timestamp,
        });
        drop(storage);

        info!(
            worker = %worker_id,
            name = %worker.name,
            site = %site.name,
            event = %kind,
            "Recorded attendance event"
        );
        Ok(event)
    }

    /// Ledger time for the next event of a worker.
    ///
    /// Never earlier than the worker's last event, so the ledger order of
    /// one worker's events always agrees with their timestamps.
    fn next_timestamp(&self, prev: Option<&WorkerState>) -> DateTime<Utc> {
        let now = ledger_precision(self.clock.now());
        match prev {
            Some(state) if state.updated_at > now => state.updated_at,
            _ => now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::notifier::Topic;
    use crate::storage::Storage;
    use chrono::{Duration, TimeZone};

    struct Fixture {
        ledger: EventLedger,
        storage: SharedStorage,
        notifier: ChangeNotifier,
        gate: EmergencyGate,
        worker: WorkerId,
        site: SiteId,
    }

    fn fixture_with_clock(clock: Arc<dyn Clock>) -> Fixture {
        let storage = Storage::open_in_memory().unwrap();
        let worker = storage.add_worker("Ada").unwrap().id;
        let site = storage.add_site("Yard").unwrap().id;
        let storage = storage.into_shared();
        let notifier = ChangeNotifier::default();
        let ledger = EventLedger::new(
            storage.clone(),
            Arc::new(WorkerLocks::new()),
            clock,
            notifier.clone(),
        );
        let gate = EmergencyGate::new(storage.clone(), notifier.clone());
        Fixture {
            ledger,
            storage,
            notifier,
            gate,
            worker,
            site,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_clock(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_check_in_then_out() {
        let f = fixture();
        let mut sub = f.notifier.subscribe();

        let enter = f
            .ledger
            .append(f.worker, f.site, EventKind::Enter)
            .await
            .unwrap();
        assert_eq!(enter.kind, EventKind::Enter);

        let state = f.storage.lock().await.worker_state(f.worker).unwrap().unwrap();
        assert!(state.is_checked_in);
        assert_eq!(state.site_id, Some(f.site));

        f.ledger
            .append(f.worker, f.site, EventKind::Leave)
            .await
            .unwrap();
        let state = f.storage.lock().await.worker_state(f.worker).unwrap().unwrap();
        assert!(!state.is_checked_in);
        assert_eq!(state.site_id, None);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.operation, Operation::Insert);
        assert_eq!(first.topic(), Topic::WorkerStates);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.operation, Operation::Update);
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn test_double_check_in_is_rejected() {
        let f = fixture();
        f.ledger
            .append(f.worker, f.site, EventKind::Enter)
            .await
            .unwrap();

        let err = f
            .ledger
            .append(f.worker, f.site, EventKind::Enter)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyCheckedIn { .. }));
        assert_eq!(f.storage.lock().await.stats().unwrap().events, 1);
    }

    #[tokio::test]
    async fn test_check_out_without_check_in() {
        let f = fixture();
        let err = f
            .ledger
            .append(f.worker, f.site, EventKind::Leave)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotCheckedIn { .. }));
        assert!(f.storage.lock().await.worker_state(f.worker).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_references() {
        let f = fixture();
        let err = f
            .ledger
            .append(WorkerId::new(77), f.site, EventKind::Enter)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "worker 77 not found");

        let err = f
            .ledger
            .append(f.worker, SiteId::new(78), EventKind::Enter)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "site 78 not found");
        assert_eq!(f.notifier.sequence(), 0);
    }

    #[tokio::test]
    async fn test_emergency_blocks_check_in_but_not_check_out() {
        let f = fixture();
        f.ledger
            .append(f.worker, f.site, EventKind::Enter)
            .await
            .unwrap();
        f.gate.set_emergency(f.site, true).await.unwrap();

        f.ledger
            .append(f.worker, f.site, EventKind::Leave)
            .await
            .unwrap();

        let err = f
            .ledger
            .append(f.worker, f.site, EventKind::Enter)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmergencyBlocked { site_id } if site_id == f.site));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_check_ins_admit_exactly_one() {
        let f = fixture();
        let attempts = 16;

        let handles: Vec<_> = (0..attempts)
            .map(|_| {
                let ledger = f.ledger.clone();
                let (worker, site) = (f.worker, f.site);
                tokio::spawn(async move { ledger.append(worker, site, EventKind::Enter).await })
            })
            .collect();

        let mut successes = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(Error::AlreadyCheckedIn { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(rejected, attempts - 1);
        assert_eq!(f.storage.lock().await.stats().unwrap().events, 1);
    }

    #[tokio::test]
    async fn test_timestamps_never_go_backwards() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let f = fixture_with_clock(Arc::new(clock.clone()));

        f.ledger
            .append(f.worker, f.site, EventKind::Enter)
            .await
            .unwrap();
        clock.set(start - Duration::minutes(30));
        let leave = f
            .ledger
            .append(f.worker, f.site, EventKind::Leave)
            .await
            .unwrap();

        assert_eq!(leave.timestamp, start);
        let history = f.storage.lock().await.worker_history(f.worker).unwrap();
        assert_eq!(history.last().unwrap().kind, EventKind::Leave);
    }

    #[tokio::test]
    async fn test_announcement_carries_worker_name() {
        let f = fixture();
        let mut rx = f.notifier.subscribe_announcements();
        f.ledger
            .append(f.worker, f.site, EventKind::Enter)
            .await
            .unwrap();

        let announcement = rx.recv().await.unwrap();
        assert_eq!(announcement.worker_name, "Ada");
        assert_eq!(announcement.site_id, f.site);
    }
}
