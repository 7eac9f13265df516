//! Worker state projection.
//!
//! A worker's state is a left fold of [`project`] over that worker's ledger
//! history. The ledger applies the fold one event at a time inside the
//! append transaction; [`StateProjector::rebuild`] replays it from scratch.
//! Both paths share [`project`], so they cannot disagree.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::locks::WorkerLocks;
use crate::model::{CheckEvent, EventKind, WorkerId, WorkerState};
use crate::notifier::{Change, ChangeNotifier, Operation};
use crate::storage::{LedgerTx, SharedStorage};

/// Compute the state after `event` given the state before it.
///
/// No business validation happens here. A leave while not checked in still
/// yields a not-checked-in state with an updated `last_check_out`.
#[must_use]
pub fn project(prev: Option<&WorkerState>, event: &CheckEvent) -> WorkerState {
    let last_check_in = prev.and_then(|s| s.last_check_in);
    let last_check_out = prev.and_then(|s| s.last_check_out);

    match event.kind {
        EventKind::Enter => WorkerState {
            worker_id: event.worker_id,
            site_id: Some(event.site_id),
            is_checked_in: true,
            last_check_in: Some(event.timestamp),
            last_check_out,
            updated_at: event.timestamp,
        },
        EventKind::Leave => WorkerState {
            worker_id: event.worker_id,
            site_id: None,
            is_checked_in: false,
            last_check_in,
            last_check_out: Some(event.timestamp),
            updated_at: event.timestamp,
        },
    }
}

/// Fold an ordered history into the final state.
///
/// Returns `None` for an empty history.
pub fn replay<'a>(history: impl IntoIterator<Item = &'a CheckEvent>) -> Option<WorkerState> {
    history
        .into_iter()
        .fold(None, |state, event| Some(project(state.as_ref(), event)))
}

/// A worker whose stored state disagrees with its ledger history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    /// The worker.
    pub worker_id: WorkerId,
    /// What the `worker_states` table holds.
    pub stored: Option<WorkerState>,
    /// What replaying the ledger produces.
    pub replayed: Option<WorkerState>,
}

/// Maintains and repairs the `worker_states` projection.
#[derive(Debug, Clone)]
pub struct StateProjector {
    storage: SharedStorage,
    locks: Arc<WorkerLocks>,
    notifier: ChangeNotifier,
}

impl StateProjector {
    /// Create a projector over shared storage.
    ///
    /// `locks` must be the same table the ledger appends under.
    #[must_use]
    pub fn new(storage: SharedStorage, locks: Arc<WorkerLocks>, notifier: ChangeNotifier) -> Self {
        Self {
            storage,
            locks,
            notifier,
        }
    }

    /// Apply one freshly appended event inside the append transaction.
    ///
    /// The write only lands if the stored check-in flag still matches
    /// `prev`. A mismatch means another writer got there first and is
    /// reported as the attendance outcome that writer caused.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or loses the compare-and-swap.
    pub fn apply(
        tx: &LedgerTx<'_>,
        prev: Option<&WorkerState>,
        event: &CheckEvent,
    ) -> Result<WorkerState> {
        let next = project(prev, event);
        let expected = prev.is_some_and(|s| s.is_checked_in);

        if tx.store_state(&next, expected)? {
            Ok(next)
        } else {
            warn!(worker = %event.worker_id, "Worker state changed under the append");
            Err(match event.kind {
                EventKind::Enter => Error::AlreadyCheckedIn {
                    worker_id: event.worker_id,
                },
                EventKind::Leave => Error::NotCheckedIn {
                    worker_id: event.worker_id,
                },
            })
        }
    }

    /// Replay a worker's ledger history without writing anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown worker, or a storage error.
    pub async fn replay(&self, worker: WorkerId) -> Result<Option<WorkerState>> {
        let storage = self.storage.lock().await;
        if storage.worker(worker)?.is_none() {
            return Err(Error::worker_not_found(worker));
        }
        Ok(replay(&storage.worker_history(worker)?))
    }

    /// Recompute a worker's state from the full ledger and store it.
    ///
    /// Returns the rebuilt state, or `None` for a worker with no events (in
    /// which case any stored row is removed). Observers are notified only if
    /// the stored row actually changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown worker, or a storage error.
    pub async fn rebuild(&self, worker: WorkerId) -> Result<Option<WorkerState>> {
        let _guard = self.locks.acquire(worker).await;
        let storage = self.storage.lock().await;

        if storage.worker(worker)?.is_none() {
            return Err(Error::worker_not_found(worker));
        }

        let stored = storage.worker_state(worker)?;
        let rebuilt = replay(&storage.worker_history(worker)?);
        if stored == rebuilt {
            debug!(%worker, "Projection already matches ledger");
            return Ok(rebuilt);
        }

        storage.replace_worker_state(worker, rebuilt.as_ref())?;

        let operation = match (&stored, &rebuilt) {
            (None, _) => Operation::Insert,
            (Some(_), None) => Operation::Delete,
            (Some(_), Some(_)) => Operation::Update,
        };
        self.notifier.publish(
            operation,
            Change::Attendance {
                worker_id: worker,
                site_id: rebuilt.as_ref().and_then(|s| s.site_id),
            },
        );
        info!(%worker, "Rebuilt worker state from ledger");
        Ok(rebuilt)
    }

    /// Rebuild every worker. Returns how many rows changed.
    ///
    /// # Errors
    ///
    /// Returns the first storage error encountered.
    pub async fn rebuild_all(&self) -> Result<usize> {
        let workers = self.storage.lock().await.workers()?;
        let mut changed = 0;
        for worker in workers {
            let before = self.storage.lock().await.worker_state(worker.id)?;
            if self.rebuild(worker.id).await? != before {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Compare every stored state with its replayed ledger history.
    ///
    /// # Errors
    ///
    /// Returns an error if a storage read fails.
    pub async fn audit(&self) -> Result<Vec<Divergence>> {
        let storage = self.storage.lock().await;
        let mut divergent = Vec::new();

        for worker in storage.workers()? {
            let stored = storage.worker_state(worker.id)?;
            let replayed = replay(&storage.worker_history(worker.id)?);
            if stored != replayed {
                divergent.push(Divergence {
                    worker_id: worker.id,
                    stored,
                    replayed,
                });
            }
        }

        if !divergent.is_empty() {
            warn!(count = divergent.len(), "Projection diverges from ledger");
        }
        Ok(divergent)
    }

    /// Audit, then rebuild every divergent worker.
    ///
    /// Returns the divergences that were repaired.
    ///
    /// # Errors
    ///
    /// Returns the first storage error encountered.
    pub async fn repair(&self) -> Result<Vec<Divergence>> {
        let divergent = self.audit().await?;
        for divergence in &divergent {
            self.rebuild(divergence.worker_id).await?;
        }
        Ok(divergent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventId, SiteId};
    use crate::storage::Storage;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, minute, 0).unwrap()
    }

    fn event(id: i64, site: i64, kind: EventKind, ts: DateTime<Utc>) -> CheckEvent {
        CheckEvent {
            id: EventId::new(id),
            worker_id: WorkerId::new(1),
            site_id: SiteId::new(site),
            kind,
            timestamp: ts,
        }
    }

    #[test]
    fn test_project_enter() {
        let state = project(None, &event(1, 4, EventKind::Enter, at(9, 0)));
        assert!(state.is_checked_in);
        assert_eq!(state.site_id, Some(SiteId::new(4)));
        assert_eq!(state.last_check_in, Some(at(9, 0)));
        assert_eq!(state.last_check_out, None);
        assert_eq!(state.updated_at, at(9, 0));
        assert!(state.is_consistent());
    }

    #[test]
    fn test_project_leave_keeps_last_check_in() {
        let entered = project(None, &event(1, 4, EventKind::Enter, at(9, 0)));
        let left = project(Some(&entered), &event(2, 4, EventKind::Leave, at(17, 0)));

        assert!(!left.is_checked_in);
        assert_eq!(left.site_id, None);
        assert_eq!(left.last_check_in, Some(at(9, 0)));
        assert_eq!(left.last_check_out, Some(at(17, 0)));
        assert_eq!(left.updated_at, at(17, 0));
        assert!(left.is_consistent());
    }

    #[test]
    fn test_replay_empty_history() {
        assert_eq!(replay(std::iter::empty()), None);
    }

    #[test]
    fn test_replay_matches_step_by_step() {
        let history = [
            event(1, 1, EventKind::Enter, at(8, 0)),
            event(2, 1, EventKind::Leave, at(12, 0)),
            event(3, 2, EventKind::Enter, at(13, 0)),
        ];
        let mut state = None;
        for e in &history {
            state = Some(project(state.as_ref(), e));
        }
        assert_eq!(replay(&history), state);
        assert_eq!(state.unwrap().site_id, Some(SiteId::new(2)));
    }

    struct Fixture {
        storage: SharedStorage,
        notifier: ChangeNotifier,
        projector: StateProjector,
        worker: WorkerId,
        site: SiteId,
    }

    fn fixture() -> Fixture {
        let storage = Storage::open_in_memory().unwrap();
        let worker = storage.add_worker("Ada").unwrap().id;
        let site = storage.add_site("Yard").unwrap().id;
        let storage = storage.into_shared();
        let notifier = ChangeNotifier::default();
        let projector = StateProjector::new(
            storage.clone(),
            Arc::new(WorkerLocks::new()),
            notifier.clone(),
        );
        Fixture {
            storage,
            notifier,
            projector,
            worker,
            site,
        }
    }

    async fn append_raw(f: &Fixture, kind: EventKind, ts: DateTime<Utc>) {
        let mut storage = f.storage.lock().await;
        let tx = storage.begin().unwrap();
        let prev = tx.worker_state(f.worker).unwrap();
        let event = tx.insert_event(f.worker, f.site, kind, ts).unwrap();
        StateProjector::apply(&tx, prev.as_ref(), &event).unwrap();
        tx.commit().unwrap();
    }

    #[tokio::test]
    async fn test_apply_rejects_lost_compare_and_swap() {
        let f = fixture();
        append_raw(&f, EventKind::Enter, at(9, 0)).await;

        let mut storage = f.storage.lock().await;
        let tx = storage.begin().unwrap();
        let event = tx
            .insert_event(f.worker, f.site, EventKind::Enter, at(9, 1))
            .unwrap();
        // Pretend we read the state before the first check-in landed.
        let err = StateProjector::apply(&tx, None, &event).unwrap_err();
        assert!(matches!(err, Error::AlreadyCheckedIn { .. }));
    }

    #[tokio::test]
    async fn test_rebuild_agrees_with_incremental_path() {
        let f = fixture();
        append_raw(&f, EventKind::Enter, at(9, 0)).await;
        append_raw(&f, EventKind::Leave, at(12, 0)).await;
        append_raw(&f, EventKind::Enter, at(13, 0)).await;

        let incremental = f.storage.lock().await.worker_state(f.worker).unwrap();
        let rebuilt = f.projector.rebuild(f.worker).await.unwrap();

        assert_eq!(rebuilt, incremental);
        assert_eq!(f.notifier.sequence(), 0, "unchanged rows are not announced");
    }

    #[tokio::test]
    async fn test_rebuild_without_events_removes_row() {
        let f = fixture();
        let bogus = WorkerState {
            worker_id: f.worker,
            site_id: Some(f.site),
            is_checked_in: true,
            last_check_in: Some(at(7, 0)),
            last_check_out: None,
            updated_at: at(7, 0),
        };
        f.storage
            .lock()
            .await
            .replace_worker_state(f.worker, Some(&bogus))
            .unwrap();

        let mut sub = f.notifier.subscribe();
        assert_eq!(f.projector.rebuild(f.worker).await.unwrap(), None);
        assert!(f.storage.lock().await.worker_state(f.worker).unwrap().is_none());

        let notification = sub.recv().await.unwrap();
        assert_eq!(notification.operation, Operation::Delete);
    }

    #[tokio::test]
    async fn test_rebuild_unknown_worker() {
        let f = fixture();
        let err = f.projector.rebuild(WorkerId::new(99)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_audit_and_repair() {
        let f = fixture();
        append_raw(&f, EventKind::Enter, at(9, 0)).await;
        assert!(f.projector.audit().await.unwrap().is_empty());

        // Corrupt the projection behind the ledger's back.
        f.storage
            .lock()
            .await
            .replace_worker_state(f.worker, None)
            .unwrap();

        let divergent = f.projector.audit().await.unwrap();
        assert_eq!(divergent.len(), 1);
        assert_eq!(divergent[0].stored, None);
        assert!(divergent[0].replayed.as_ref().unwrap().is_checked_in);

        let repaired = f.projector.repair().await.unwrap();
        assert_eq!(repaired.len(), 1);
        assert!(f.projector.audit().await.unwrap().is_empty());
        assert_eq!(f.projector.rebuild_all().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_does_not_write() {
        let f = fixture();
        append_raw(&f, EventKind::Enter, at(9, 0)).await;
        f.storage
            .lock()
            .await
            .replace_worker_state(f.worker, None)
            .unwrap();

        let replayed = f.projector.replay(f.worker).await.unwrap();
        assert!(replayed.unwrap().is_checked_in);
        assert!(f.storage.lock().await.worker_state(f.worker).unwrap().is_none());
    }
}
