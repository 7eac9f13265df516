//! Per-worker mutual exclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SlotMutex, MutexGuard as SlotGuard, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::WorkerId;

type Slots = HashMap<WorkerId, Arc<Mutex<()>>>;

/// A table of async mutexes keyed by worker.
///
/// Holding the guard for a worker serializes every read-check-append
/// sequence for that worker. Different workers never contend. A worker's
/// slot is dropped again once nobody holds or waits for it.
#[derive(Debug, Default)]
pub struct WorkerLocks {
    slots: Arc<SlotMutex<Slots>>,
}

impl WorkerLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `worker`.
    pub async fn acquire(&self, worker: WorkerId) -> WorkerGuard {
        let lock = {
            let mut slots = lock_slots(&self.slots);
            Arc::clone(
                slots
                    .entry(worker)
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        WorkerGuard {
            worker,
            guard: Some(lock.lock_owned().await),
            slots: Arc::clone(&self.slots),
        }
    }

    /// Number of workers currently held or waited for.
    #[must_use]
    pub fn tracked(&self) -> usize {
        lock_slots(&self.slots).len()
    }
}

/// Exclusive access to one worker. Released on drop.
#[derive(Debug)]
pub struct WorkerGuard {
    worker: WorkerId,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Arc<SlotMutex<Slots>>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Clones are only taken under the slot lock, so a count of one
        // means no holder and no waiter.
        let mut slots = lock_slots(&self.slots);
        if slots
            .get(&self.worker)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            slots.remove(&self.worker);
        }
    }
}

fn lock_slots(slots: &SlotMutex<Slots>) -> SlotGuard<'_, Slots> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}
