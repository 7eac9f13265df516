//! The authoritative attendance service.
//!
//! [`Attendance`] wires storage, the ledger, the emergency gate, the
//! projector and the change notifier together. It is cheap to clone; every
//! clone shares the same database connections and notifier.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::gate::EmergencyGate;
use crate::ledger::EventLedger;
use crate::locks::WorkerLocks;
use crate::model::{
    CheckEvent, EventFilter, EventKind, Site, SiteId, Worker, WorkerId, WorkerStatus,
};
use crate::notifier::{Change, ChangeNotifier, Operation, Subscription};
use crate::projector::StateProjector;
use crate::storage::{SharedStorage, Storage, StorageStats};
use crate::sync::AttendanceBackend;

/// Site attendance with real-time change notifications.
#[derive(Debug, Clone)]
pub struct Attendance {
    storage: SharedStorage,
    ledger: EventLedger,
    gate: EmergencyGate,
    projector: StateProjector,
    notifier: ChangeNotifier,
}

impl Attendance {
    /// Open the database named by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(config: &Config) -> Result<Self> {
        let storage = Storage::open(config.database_path())?;
        storage.set_busy_timeout(config.busy_timeout())?;
        let reader = storage.open_reader()?;
        reader.set_busy_timeout(config.busy_timeout())?;
        let notifier = ChangeNotifier::new(
            config.notifier.channel_capacity,
            config.notifier.announcement_capacity,
        );
        Ok(Self::assemble(
            SharedStorage::with_reader(storage, reader),
            notifier,
            Arc::new(SystemClock),
        ))
    }

    /// A service over a fresh in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::with_storage(
            Storage::open_in_memory()?,
            ChangeNotifier::default(),
            Arc::new(SystemClock),
        ))
    }

    /// Assemble a service from parts.
    #[must_use]
    pub fn with_storage(storage: Storage, notifier: ChangeNotifier, clock: Arc<dyn Clock>) -> Self {
        Self::assemble(storage.into_shared(), notifier, clock)
    }

    fn assemble(storage: SharedStorage, notifier: ChangeNotifier, clock: Arc<dyn Clock>) -> Self {
        let locks = Arc::new(WorkerLocks::new());

        Self {
            ledger: EventLedger::new(
                storage.clone(),
                Arc::clone(&locks),
                clock,
                notifier.clone(),
            ),
            gate: EmergencyGate::new(storage.clone(), notifier.clone()),
            projector: StateProjector::new(storage.clone(), locks, notifier.clone()),
            storage,
            notifier,
        }
    }

    /// The event ledger.
    #[must_use]
    pub fn ledger(&self) -> &EventLedger {
        &self.ledger
    }

    /// The emergency gate.
    #[must_use]
    pub fn gate(&self) -> &EmergencyGate {
        &self.gate
    }

    /// The state projector.
    #[must_use]
    pub fn projector(&self) -> &StateProjector {
        &self.projector
    }

    /// The change notifier.
    #[must_use]
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Register a worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn add_worker(&self, name: &str) -> Result<Worker> {
        let worker = self.storage.lock().await.add_worker(name)?;
        info!(worker = %worker.id, name = %worker.name, "Registered worker");
        Ok(worker)
    }

    /// Register a site. New sites start without an emergency.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub async fn add_site(&self, name: &str) -> Result<Site> {
        let storage = self.storage.lock().await;
        let site = storage.add_site(name)?;
        self.notifier.publish(
            Operation::Insert,
            Change::Site {
                site_id: site.id,
                emergency: Some(site.emergency),
            },
        );
        drop(storage);

        info!(site = %site.id, name = %site.name, "Registered site");
        Ok(site)
    }

    /// All workers, by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn workers(&self) -> Result<Vec<Worker>> {
        self.storage.read().await.workers()
    }

    /// All sites, by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn sites(&self) -> Result<Vec<Site>> {
        self.storage.read().await.sites()
    }

    /// One site.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown site.
    pub async fn site(&self, id: SiteId) -> Result<Site> {
        self.storage
            .read()
            .await
            .site(id)?
            .ok_or_else(|| Error::site_not_found(id))
    }

    /// One worker's current state, `None` if they have never checked in.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn worker_status(&self, id: WorkerId) -> Result<Option<WorkerStatus>> {
        self.storage.read().await.worker_status(id)
    }

    /// Every worker state, most recently changed first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn worker_statuses(&self) -> Result<Vec<WorkerStatus>> {
        self.storage.read().await.worker_statuses()
    }

    /// Workers currently checked in at `site`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown site.
    pub async fn checked_in_at(&self, site: SiteId) -> Result<Vec<WorkerStatus>> {
        let storage = self.storage.read().await;
        if storage.site(site)?.is_none() {
            return Err(Error::site_not_found(site));
        }
        storage.checked_in_at(site)
    }

    /// Events matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn history(&self, filter: &EventFilter) -> Result<Vec<CheckEvent>> {
        self.storage.read().await.events(filter)
    }

    /// One worker's events in ledger order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown worker.
    pub async fn worker_history(&self, worker: WorkerId) -> Result<Vec<CheckEvent>> {
        let storage = self.storage.read().await;
        if storage.worker(worker)?.is_none() {
            return Err(Error::worker_not_found(worker));
        }
        storage.worker_history(worker)
    }

    /// Check a worker in.
    ///
    /// # Errors
    ///
    /// See [`EventLedger::append`].
    pub async fn check_in(&self, worker: WorkerId, site: SiteId) -> Result<CheckEvent> {
        self.ledger.append(worker, site, EventKind::Enter).await
    }

    /// Check a worker out.
    ///
    /// # Errors
    ///
    /// See [`EventLedger::append`].
    pub async fn check_out(&self, worker: WorkerId, site: SiteId) -> Result<CheckEvent> {
        self.ledger.append(worker, site, EventKind::Leave).await
    }

    /// Set a site's emergency flag.
    ///
    /// # Errors
    ///
    /// See [`EmergencyGate::set_emergency`].
    pub async fn set_emergency(&self, site: SiteId, active: bool) -> Result<Site> {
        self.gate.set_emergency(site, active).await
    }

    /// Whether a site is under emergency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown site.
    pub async fn is_emergency(&self, site: SiteId) -> Result<bool> {
        self.gate.is_emergency(site).await
    }

    /// Set the emergency flag on every site.
    ///
    /// # Errors
    ///
    /// Returns an error only if the site list cannot be read.
    pub async fn set_emergency_all(&self, active: bool) -> Result<Vec<(SiteId, Result<Site>)>> {
        self.gate.set_emergency_all(active).await
    }

    /// Database statistics.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn stats(&self) -> Result<StorageStats> {
        self.storage.read().await.stats()
    }
}

#[async_trait]
impl AttendanceBackend for Attendance {
    fn sequence(&self) -> u64 {
        self.notifier.sequence()
    }

    async fn fetch_worker_states(&self) -> Result<Vec<WorkerStatus>> {
        self.worker_statuses().await
    }

    async fn fetch_worker_state(&self, worker: WorkerId) -> Result<Option<WorkerStatus>> {
        self.worker_status(worker).await
    }

    async fn fetch_sites(&self) -> Result<Vec<Site>> {
        self.sites().await
    }

    async fn fetch_site(&self, site: SiteId) -> Result<Site> {
        self.site(site).await
    }

    async fn check_in(&self, worker: WorkerId, site: SiteId) -> Result<CheckEvent> {
        Attendance::check_in(self, worker, site).await
    }

    async fn check_out(&self, worker: WorkerId, site: SiteId) -> Result<CheckEvent> {
        Attendance::check_out(self, worker, site).await
    }

    async fn set_emergency(&self, site: SiteId, active: bool) -> Result<Site> {
        Attendance::set_emergency(self, site, active).await
    }

    async fn subscribe(&self) -> Result<Subscription> {
        Ok(self.notifier.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::Topic;

    async fn service() -> (Attendance, WorkerId, SiteId) {
        let service = Attendance::in_memory().unwrap();
        let worker = service.add_worker("Grace").await.unwrap().id;
        let site = service.add_site("Harbor").await.unwrap().id;
        (service, worker, site)
    }

    #[tokio::test]
    async fn test_add_site_publishes_insert() {
        let service = Attendance::in_memory().unwrap();
        let mut sub = service.notifier().subscribe();

        let site = service.add_site("Quarry").await.unwrap();
        assert!(!site.emergency);

        let notification = sub.recv().await.unwrap();
        assert_eq!(notification.operation, Operation::Insert);
        assert_eq!(notification.topic(), Topic::Sites);
    }

    #[tokio::test]
    async fn test_file_backed_service_reads_on_own_connection() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.database_path = Some(dir.path().join("attendance.db"));

        let service = Attendance::open(&config).unwrap();
        assert!(service.storage.has_reader());

        let worker = service.add_worker("Grace").await.unwrap().id;
        let site = service.add_site("Harbor").await.unwrap().id;
        service.check_in(worker, site).await.unwrap();

        let present = service.checked_in_at(site).await.unwrap();
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].worker_name, "Grace");
        assert_eq!(service.stats().await.unwrap().events, 1);
    }

    #[tokio::test]
    async fn test_presence_queries() {
        let (service, worker, site) = service().await;
        assert!(service.worker_status(worker).await.unwrap().is_none());

        service.check_in(worker, site).await.unwrap();
        let present = service.checked_in_at(site).await.unwrap();
        assert_eq!(present.len(), 1);
        assert_eq!(present[0].worker_name, "Grace");
        assert_eq!(present[0].site_name.as_deref(), Some("Harbor"));

        service.check_out(worker, site).await.unwrap();
        assert!(service.checked_in_at(site).await.unwrap().is_empty());
        assert_eq!(service.worker_history(worker).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_entities() {
        let (service, _, _) = service().await;
        assert!(matches!(
            service.site(SiteId::new(404)).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            service.checked_in_at(SiteId::new(404)).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            service.worker_history(WorkerId::new(404)).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_filter() {
        let (service, worker, site) = service().await;
        let other = service.add_worker("Linus").await.unwrap().id;
        service.check_in(worker, site).await.unwrap();
        service.check_in(other, site).await.unwrap();

        let filter = EventFilter {
            worker_id: Some(other),
            ..EventFilter::default()
        };
        let events = service.history(&filter).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].worker_id, other);
    }

    #[tokio::test]
    async fn test_backend_sequence_follows_notifier() {
        let (service, worker, site) = service().await;
        let before = service.sequence();
        service.check_in(worker, site).await.unwrap();
        assert_eq!(service.sequence(), before + 1);

        let sub = AttendanceBackend::subscribe(&service).await.unwrap();
        assert!(!sub.is_closed());
        assert_eq!(service.notifier().subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_emergency_all() {
        let (service, _, site) = service().await;
        let second = service.add_site("Depot").await.unwrap().id;

        let outcomes = service.set_emergency_all(true).await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, outcome)| outcome.is_ok()));
        assert!(service.is_emergency(site).await.unwrap());
        assert!(service.is_emergency(second).await.unwrap());
    }

    #[tokio::test]
    async fn test_stats() {
        let (service, worker, site) = service().await;
        service.check_in(worker, site).await.unwrap();
        let stats = service.stats().await.unwrap();
        assert_eq!(stats.workers, 1);
        assert_eq!(stats.sites, 1);
        assert_eq!(stats.events, 1);
        assert_eq!(stats.checked_in, 1);
    }
}
