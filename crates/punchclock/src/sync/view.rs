//! The observer-side cache of authoritative state.
//!
//! Every cached entity remembers the notifier sequence it was written at.
//! A read result is stamped with the sequence current when the read was
//! started, and only lands on entities whose version is not newer than that
//! stamp. Entities with an optimistic write in flight are left alone until
//! the write is confirmed or rolled back.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use crate::model::{Site, SiteId, WorkerId, WorkerStatus};

/// Which sites an observer is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(tag = "scope", content = "site_id", rename_all = "snake_case")]
pub enum Scope {
    /// Every site.
    #[default]
    All,
    /// A single site.
    Site(SiteId),
}

impl Scope {
    /// Whether `site` is inside this scope.
    #[must_use]
    pub fn includes(self, site: SiteId) -> bool {
        match self {
            Self::All => true,
            Self::Site(id) => id == site,
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all sites"),
            Self::Site(id) => write!(f, "site {id}"),
        }
    }
}

/// A cached value and the sequence it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    /// The cached value.
    pub value: T,
    /// Notifier sequence of the write.
    pub version: u64,
}

/// Local copy of worker states and sites for one scope.
#[derive(Debug, Clone, Default)]
pub struct CachedView {
    scope: Scope,
    workers: HashMap<WorkerId, Versioned<WorkerStatus>>,
    sites: HashMap<SiteId, Versioned<Site>>,
    pending_workers: HashSet<WorkerId>,
    pending_sites: HashSet<SiteId>,
    recently_changed: BTreeSet<WorkerId>,
    workers_loaded: bool,
    sites_loaded: bool,
}

impl CachedView {
    /// An empty view for `scope`.
    #[must_use]
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    /// The scope this view covers.
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Whether both worker states and sites have been read at least once.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.workers_loaded && self.sites_loaded
    }

    /// Replace worker states with a full read stamped `stamp`.
    ///
    /// Returns how many entities changed.
    pub fn apply_worker_states(&mut self, stamp: u64, statuses: Vec<WorkerStatus>) -> usize {
        self.recently_changed.clear();
        let mut changed = 0;

        let incoming: HashSet<WorkerId> = statuses.iter().map(WorkerStatus::worker_id).collect();
        let stale: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(id, entry)| {
                !incoming.contains(*id)
                    && entry.version <= stamp
                    && !self.pending_workers.contains(*id)
            })
            .map(|(id, _)| *id)
            .collect();
        for id in stale {
            self.workers.remove(&id);
            self.recently_changed.insert(id);
            changed += 1;
        }

        for status in statuses {
            if self.store_worker(stamp, status) {
                changed += 1;
            }
        }

        self.workers_loaded = true;
        changed
    }

    /// Apply a read of a single worker. `None` means the worker has no state.
    ///
    /// Returns whether the cache changed.
    pub fn apply_worker_state(
        &mut self,
        stamp: u64,
        worker: WorkerId,
        status: Option<WorkerStatus>,
    ) -> bool {
        match status {
            Some(status) => self.store_worker(stamp, status),
            None => {
                let removable = !self.pending_workers.contains(&worker)
                    && self
                        .workers
                        .get(&worker)
                        .is_some_and(|entry| entry.version <= stamp);
                if removable {
                    self.workers.remove(&worker);
                    self.recently_changed.insert(worker);
                }
                removable
            }
        }
    }

    fn store_worker(&mut self, stamp: u64, status: WorkerStatus) -> bool {
        let id = status.worker_id();
        if self.pending_workers.contains(&id) {
            return false;
        }
        match self.workers.get_mut(&id) {
            Some(entry) if entry.version > stamp => false,
            Some(entry) => {
                entry.version = stamp;
                if entry.value == status {
                    return false;
                }
                if entry.value.state.is_checked_in != status.state.is_checked_in
                    || entry.value.state.site_id != status.state.site_id
                {
                    self.recently_changed.insert(id);
                }
                entry.value = status;
                true
            }
            None => {
                self.recently_changed.insert(id);
                self.workers.insert(
                    id,
                    Versioned {
                        value: status,
                        version: stamp,
                    },
                );
                true
            }
        }
    }

    /// Replace sites with a full read stamped `stamp`.
    ///
    /// Sites outside the scope are ignored. Returns how many entities changed.
    pub fn apply_sites(&mut self, stamp: u64, sites: Vec<Site>) -> usize {
        let sites: Vec<Site> = sites
            .into_iter()
            .filter(|s| self.scope.includes(s.id))
            .collect();
        let incoming: HashSet<SiteId> = sites.iter().map(|s| s.id).collect();
        let stale: Vec<SiteId> = self
            .sites
            .iter()
            .filter(|(id, entry)| {
                !incoming.contains(*id) && entry.version <= stamp && !self.pending_sites.contains(*id)
            })
            .map(|(id, _)| *id)
            .collect();

        let mut changed = stale.len();
        for id in stale {
            self.sites.remove(&id);
        }
        for site in sites {
            if self.apply_site(stamp, site) {
                changed += 1;
            }
        }

        self.sites_loaded = true;
        changed
    }

    /// Apply a read of a single site. Returns whether the cache changed.
    pub fn apply_site(&mut self, stamp: u64, site: Site) -> bool {
        if !self.scope.includes(site.id) || self.pending_sites.contains(&site.id) {
            return false;
        }
        match self.sites.get_mut(&site.id) {
            Some(entry) if entry.version > stamp => false,
            Some(entry) => {
                entry.version = stamp;
                let changed = entry.value != site;
                entry.value = site;
                changed
            }
            None => {
                self.sites.insert(
                    site.id,
                    Versioned {
                        value: site,
                        version: stamp,
                    },
                );
                true
            }
        }
    }

    /// Patch a cached site's flag from a notification snapshot.
    ///
    /// Returns `false` when the site is not cached, in which case the caller
    /// should fetch it.
    pub fn patch_site_emergency(&mut self, sequence: u64, site: SiteId, emergency: bool) -> bool {
        if !self.scope.includes(site) {
            return true;
        }
        if self.pending_sites.contains(&site) {
            return true;
        }
        match self.sites.get_mut(&site) {
            Some(entry) => {
                if entry.version <= sequence {
                    entry.value.emergency = emergency;
                    entry.version = sequence;
                }
                true
            }
            None => false,
        }
    }

    /// Write an optimistic worker value and hold off reads until it settles.
    ///
    /// Returns the entry it replaced so the write can be rolled back.
    pub fn put_optimistic_worker(
        &mut self,
        version: u64,
        status: WorkerStatus,
    ) -> Option<Versioned<WorkerStatus>> {
        let id = status.worker_id();
        self.pending_workers.insert(id);
        self.workers.insert(
            id,
            Versioned {
                value: status,
                version,
            },
        )
    }

    /// Write an optimistic site value and hold off reads until it settles.
    pub fn put_optimistic_site(&mut self, version: u64, site: Site) -> Option<Versioned<Site>> {
        self.pending_sites.insert(site.id);
        self.sites.insert(
            site.id,
            Versioned {
                value: site,
                version,
            },
        )
    }

    /// Let reads land on `worker` again.
    pub fn settle_worker(&mut self, worker: WorkerId) {
        self.pending_workers.remove(&worker);
    }

    /// Let reads land on `site` again.
    pub fn settle_site(&mut self, site: SiteId) {
        self.pending_sites.remove(&site);
    }

    /// Undo an optimistic worker write.
    pub fn restore_worker(&mut self, worker: WorkerId, previous: Option<Versioned<WorkerStatus>>) {
        self.pending_workers.remove(&worker);
        match previous {
            Some(entry) => {
                self.workers.insert(worker, entry);
            }
            None => {
                self.workers.remove(&worker);
            }
        }
    }

    /// Undo an optimistic site write.
    pub fn restore_site(&mut self, site: SiteId, previous: Option<Versioned<Site>>) {
        self.pending_sites.remove(&site);
        match previous {
            Some(entry) => {
                self.sites.insert(site, entry);
            }
            None => {
                self.sites.remove(&site);
            }
        }
    }

    /// The cached status of a worker.
    #[must_use]
    pub fn worker(&self, id: WorkerId) -> Option<&WorkerStatus> {
        self.workers.get(&id).map(|entry| &entry.value)
    }

    /// The cached entry of a worker, including its version.
    #[must_use]
    pub fn worker_entry(&self, id: WorkerId) -> Option<&Versioned<WorkerStatus>> {
        self.workers.get(&id)
    }

    /// The cached site.
    #[must_use]
    pub fn site(&self, id: SiteId) -> Option<&Site> {
        self.sites.get(&id).map(|entry| &entry.value)
    }

    /// Cached worker statuses ordered by worker id.
    #[must_use]
    pub fn workers(&self) -> Vec<WorkerStatus> {
        let mut statuses: Vec<WorkerStatus> =
            self.workers.values().map(|e| e.value.clone()).collect();
        statuses.sort_by_key(WorkerStatus::worker_id);
        statuses
    }

    /// Cached sites ordered by name.
    #[must_use]
    pub fn sites(&self) -> Vec<Site> {
        let mut sites: Vec<Site> = self.sites.values().map(|e| e.value.clone()).collect();
        sites.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        sites
    }

    /// Number of workers checked in within the scope.
    #[must_use]
    pub fn checked_in_count(&self) -> usize {
        self.workers
            .values()
            .filter(|e| {
                e.value.state.is_checked_in
                    && e.value.state.site_id.is_some_and(|s| self.scope.includes(s))
            })
            .count()
    }

    /// Whether any site in scope is under emergency.
    #[must_use]
    pub fn emergency_active(&self) -> bool {
        self.sites.values().any(|e| e.value.emergency)
    }

    /// Workers whose presence changed in the most recent refresh.
    #[must_use]
    pub fn recently_changed(&self) -> Vec<WorkerId> {
        self.recently_changed.iter().copied().collect()
    }

    /// Number of optimistic writes not yet settled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending_workers.len() + self.pending_sites.len()
    }
}
