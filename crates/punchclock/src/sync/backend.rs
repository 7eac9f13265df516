//! The seam between observers and the authoritative service.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{CheckEvent, Site, SiteId, WorkerId, WorkerStatus};
use crate::notifier::Subscription;

/// Authoritative reads, mutations and change subscriptions.
///
/// The in-process [`crate::Attendance`] service implements this directly.
/// A networked implementation would wrap the same calls in a transport.
#[async_trait]
pub trait AttendanceBackend: Send + Sync {
    /// The sequence of the most recent published change.
    ///
    /// Observers stamp each read with this value before starting it.
    fn sequence(&self) -> u64;

    /// Every worker state joined with worker and site names.
    async fn fetch_worker_states(&self) -> Result<Vec<WorkerStatus>>;

    /// One worker's state, `None` if the worker has never checked in.
    async fn fetch_worker_state(&self, worker: WorkerId) -> Result<Option<WorkerStatus>>;

    /// Every site.
    async fn fetch_sites(&self) -> Result<Vec<Site>>;

    /// One site.
    async fn fetch_site(&self, site: SiteId) -> Result<Site>;

    /// Record a check-in.
    async fn check_in(&self, worker: WorkerId, site: SiteId) -> Result<CheckEvent>;

    /// Record a check-out.
    async fn check_out(&self, worker: WorkerId, site: SiteId) -> Result<CheckEvent>;

    /// Set a site's emergency flag and return the confirmed site.
    async fn set_emergency(&self, site: SiteId, active: bool) -> Result<Site>;

    /// Open a change subscription.
    async fn subscribe(&self) -> Result<Subscription>;
}
