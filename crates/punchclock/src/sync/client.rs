//! The reconciliation client.
//!
//! Lifecycle:
//!
//! ```text
//! Cold ──activate──▶ Subscribed ──subscription lost──▶ Reconnecting
//!                        ▲                                  │
//!                        └──────────── resubscribed ◀───────┤
//!                                                           │ attempts exhausted
//!                                  foreground signal ◀── Degraded
//! ```
//!
//! Every transition into `Subscribed` is followed by a full read, so a gap
//! in notifications never leaves the view behind.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::AttendanceBackend;
use super::retry::RetryPolicy;
use super::view::{CachedView, Scope, Versioned};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::model::{
    CheckEvent, EventId, EventKind, Site, SiteId, WorkerId, WorkerState, WorkerStatus,
};
use crate::notifier::{Change, Notification, Subscription};
use crate::projector::project;

/// Connection state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing read yet.
    Cold,
    /// Subscribed and reading.
    Subscribed,
    /// Subscription lost; trying to get it back.
    Reconnecting,
    /// Reconnection gave up. The only state shown to end users.
    Degraded,
    /// Shut down.
    Closed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cold => "cold",
            Self::Subscribed => "subscribed",
            Self::Reconnecting => "reconnecting",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A user action the client can apply optimistically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Check a worker in at a site.
    CheckIn {
        /// The worker.
        worker: WorkerId,
        /// The site.
        site: SiteId,
    },
    /// Check a worker out.
    CheckOut {
        /// The worker.
        worker: WorkerId,
        /// The site the check-out is recorded at.
        site: SiteId,
    },
    /// Toggle a site's emergency flag.
    Emergency {
        /// The site.
        site: SiteId,
        /// The requested flag.
        active: bool,
    },
}

/// Where an optimistic action is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    /// Applied locally, outcome unknown.
    Pending,
    /// The backend accepted it and the entity was re-read.
    Confirmed,
    /// The backend refused it and the previous value was restored.
    RolledBack,
}

#[derive(Debug)]
enum Previous {
    Worker(Option<Versioned<WorkerStatus>>),
    Site(Option<Versioned<Site>>),
}

/// An optimistic write awaiting its backend outcome.
#[derive(Debug)]
pub struct PendingAction {
    kind: ActionKind,
    phase: ActionPhase,
    previous: Option<Previous>,
}

impl PendingAction {
    /// The action.
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    /// The action's current phase.
    #[must_use]
    pub fn phase(&self) -> ActionPhase {
        self.phase
    }
}

/// What an observer displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewSnapshot {
    /// Connection state.
    pub phase: Phase,
    /// Observed scope.
    pub scope: Scope,
    /// Workers checked in within the scope. `None` until the first full read.
    pub checked_in: Option<usize>,
    /// Whether the scope has an active emergency. `None` until the first full read.
    pub emergency_active: Option<bool>,
    /// Cached worker states.
    pub workers: Vec<WorkerStatus>,
    /// Cached sites in scope.
    pub sites: Vec<Site>,
    /// Workers whose presence changed in the last refresh.
    pub recently_changed: Vec<WorkerId>,
    /// Optimistic writes not yet settled.
    pub pending: usize,
}

impl ViewSnapshot {
    /// Whether the end user should be told the view may be out of date.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.phase == Phase::Degraded
    }
}

/// Signals from the hosting UI.
///
/// User actions carry a reply channel for their outcome. They are applied
/// optimistically by the running client and always run to completion;
/// refetches and reconnects give way to any signal that arrives meanwhile.
#[derive(Debug)]
pub enum ObserverSignal {
    /// The observer became visible again; refresh now.
    Foreground,
    /// Observe a different scope.
    SwitchScope(Scope),
    /// Check a worker in.
    CheckIn {
        /// The worker.
        worker: WorkerId,
        /// The site.
        site: SiteId,
        /// Receives the recorded event or the refusal.
        reply: oneshot::Sender<Result<CheckEvent>>,
    },
    /// Check a worker out.
    CheckOut {
        /// The worker.
        worker: WorkerId,
        /// The site the check-out is recorded at.
        site: SiteId,
        /// Receives the recorded event or the refusal.
        reply: oneshot::Sender<Result<CheckEvent>>,
    },
    /// Toggle a site's emergency flag.
    SetEmergency {
        /// The site.
        site: SiteId,
        /// The requested flag.
        active: bool,
        /// Receives the updated site or the error.
        reply: oneshot::Sender<Result<Site>>,
    },
}

impl ObserverSignal {
    fn is_action(&self) -> bool {
        matches!(
            self,
            Self::CheckIn { .. } | Self::CheckOut { .. } | Self::SetEmergency { .. }
        )
    }
}

/// Sends signals to a running [`ReconciliationClient`].
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    signals: mpsc::Sender<ObserverSignal>,
}

impl ObserverHandle {
    /// A handle and the receiver to pass to [`ReconciliationClient::run`].
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ObserverSignal>) {
        let (signals, receiver) = mpsc::channel(capacity.max(1));
        (Self { signals }, receiver)
    }

    /// Ask the observer to refresh now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the observer has stopped.
    pub async fn foreground(&self) -> Result<()> {
        self.send(ObserverSignal::Foreground).await
    }

    /// Ask the observer to watch a different scope.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the observer has stopped.
    pub async fn switch_scope(&self, scope: Scope) -> Result<()> {
        self.send(ObserverSignal::SwitchScope(scope)).await
    }

    /// Check a worker in through the observer.
    ///
    /// # Errors
    ///
    /// Returns the backend's refusal, or [`Error::Cancelled`] if the
    /// observer stopped before answering.
    pub async fn check_in(&self, worker: WorkerId, site: SiteId) -> Result<CheckEvent> {
        let (reply, answer) = oneshot::channel();
        self.send(ObserverSignal::CheckIn {
            worker,
            site,
            reply,
        })
        .await?;
        answer.await.map_err(|_| Error::Cancelled)?
    }

    /// Check a worker out through the observer.
    ///
    /// # Errors
    ///
    /// Returns the backend's refusal, or [`Error::Cancelled`] if the
    /// observer stopped before answering.
    pub async fn check_out(&self, worker: WorkerId, site: SiteId) -> Result<CheckEvent> {
        let (reply, answer) = oneshot::channel();
        self.send(ObserverSignal::CheckOut {
            worker,
            site,
            reply,
        })
        .await?;
        answer.await.map_err(|_| Error::Cancelled)?
    }

    /// Set a site's emergency flag through the observer.
    ///
    /// # Errors
    ///
    /// Returns the backend's error, or [`Error::Cancelled`] if the observer
    /// stopped before answering.
    pub async fn set_emergency(&self, site: SiteId, active: bool) -> Result<Site> {
        let (reply, answer) = oneshot::channel();
        self.send(ObserverSignal::SetEmergency {
            site,
            active,
            reply,
        })
        .await?;
        answer.await.map_err(|_| Error::Cancelled)?
    }

    async fn send(&self, signal: ObserverSignal) -> Result<()> {
        self.signals.send(signal).await.map_err(|_| Error::Cancelled)
    }
}

#[derive(Debug, Default)]
struct Dirty {
    workers: bool,
    sites: bool,
    deadline: Option<Instant>,
}

enum Step {
    Shutdown,
    Connect,
    Signal(ObserverSignal),
    Received(Result<Notification>),
    Flush,
}

impl Step {
    fn is_interruptible(&self) -> bool {
        match self {
            Self::Signal(signal) => !signal.is_action(),
            Self::Shutdown | Self::Received(Ok(_)) => false,
            Self::Connect | Self::Received(Err(_)) | Self::Flush => true,
        }
    }
}

/// Keeps a [`CachedView`] converged with an [`AttendanceBackend`].
#[derive(Debug)]
pub struct ReconciliationClient<B> {
    backend: Arc<B>,
    policy: RetryPolicy,
    debounce: Duration,
    reconnect_attempts: u32,
    view: CachedView,
    phase: Phase,
    subscription: Option<Subscription>,
    shutdown: CancellationToken,
    context: CancellationToken,
    dirty: Dirty,
    last_seen: u64,
    snapshots: watch::Sender<ViewSnapshot>,
}

impl<B: AttendanceBackend> ReconciliationClient<B> {
    /// Create a cold client for `scope`.
    #[must_use]
    pub fn new(backend: Arc<B>, config: &SyncConfig, scope: Scope) -> Self {
        let view = CachedView::new(scope);
        let shutdown = CancellationToken::new();
        let context = shutdown.child_token();
        let (snapshots, _) = watch::channel(snapshot_of(&view, Phase::Cold));

        Self {
            backend,
            policy: RetryPolicy::from(config),
            debounce: config.debounce(),
            reconnect_attempts: config.reconnect_attempts,
            view,
            phase: Phase::Cold,
            subscription: None,
            shutdown,
            context,
            dirty: Dirty::default(),
            last_seen: 0,
            snapshots,
        }
    }

    /// The current connection state.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The cached view.
    #[must_use]
    pub fn view(&self) -> &CachedView {
        &self.view
    }

    /// Build a snapshot of the current view.
    #[must_use]
    pub fn snapshot(&self) -> ViewSnapshot {
        snapshot_of(&self.view, self.phase)
    }

    /// Receive a new snapshot whenever the view or phase changes.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ViewSnapshot> {
        self.snapshots.subscribe()
    }

    /// A token that stops [`ReconciliationClient::run`] when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// When the next coalesced refetch is due, if one is scheduled.
    #[must_use]
    pub fn refresh_deadline(&self) -> Option<Instant> {
        self.dirty.deadline
    }

    /// Subscribe, then read everything in scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed or no subscription could be
    /// established (the client is then [`Phase::Degraded`]). A failed
    /// initial read is not an error; it is retried on the next flush.
    pub async fn activate(&mut self) -> Result<()> {
        if self.phase == Phase::Closed {
            return Err(Error::Cancelled);
        }
        self.connect().await
    }

    /// Read worker states and sites in scope.
    ///
    /// A failed read leaves the cached view as it was.
    ///
    /// # Errors
    ///
    /// Returns the first read error after retries.
    pub async fn refresh_all(&mut self) -> Result<()> {
        self.dirty.workers = true;
        self.dirty.sites = true;
        let workers = self.refresh_workers().await;
        let sites = self.refresh_sites().await;
        if workers.is_ok() && sites.is_ok() {
            self.dirty = Dirty::default();
        } else if !self.context.is_cancelled() {
            self.schedule_flush();
        }
        workers.and(sites)
    }

    /// Record a notification and schedule the refetch it calls for.
    ///
    /// Site notifications with a snapshot patch the cached flag directly.
    pub fn handle_notification(&mut self, notification: Notification) {
        self.last_seen = self.last_seen.max(notification.sequence);
        debug!(
            sequence = notification.sequence,
            topic = %notification.topic(),
            "Received notification"
        );

        match notification.change {
            Change::Attendance { .. } => self.mark_dirty(true, false),
            Change::Site {
                site_id,
                emergency: Some(emergency),
            } => {
                if self
                    .view
                    .patch_site_emergency(notification.sequence, site_id, emergency)
                {
                    self.publish_snapshot();
                } else {
                    self.mark_dirty(false, true);
                }
            }
            Change::Site {
                emergency: None, ..
            } => self.mark_dirty(false, true),
        }
    }

    /// Run the refetches scheduled by notifications.
    ///
    /// On failure the view is left untouched and the refetch is scheduled
    /// again one debounce window later.
    ///
    /// # Errors
    ///
    /// Returns the read error.
    pub async fn flush_pending(&mut self) -> Result<()> {
        self.dirty.deadline = None;
        let mut outcome = Ok(());

        if self.dirty.workers {
            if let Err(err) = self.refresh_workers().await {
                outcome = Err(err);
            }
        }
        if self.dirty.sites {
            if let Err(err) = self.refresh_sites().await {
                outcome = outcome.and(Err(err));
            }
        }

        if outcome.is_err() && !self.context.is_cancelled() {
            self.dirty.deadline = Some(Instant::now() + self.debounce);
        }
        outcome
    }

    /// React to a lost subscription by reconnecting.
    ///
    /// # Errors
    ///
    /// Returns an error if reconnection is exhausted.
    pub async fn on_subscription_lost(&mut self, cause: Error) -> Result<()> {
        warn!(error = %cause, "Subscription lost; reconnecting");
        self.release_subscription();
        self.phase = Phase::Reconnecting;
        self.publish_snapshot();
        self.connect().await
    }

    /// The observer came back to the foreground: refresh now, reconnecting
    /// first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed, reconnection fails, or the
    /// refresh fails.
    pub async fn on_foreground(&mut self) -> Result<()> {
        match self.phase {
            Phase::Closed => Err(Error::Cancelled),
            Phase::Subscribed => self.refresh_all().await,
            Phase::Cold | Phase::Reconnecting | Phase::Degraded => self.connect().await,
        }
    }

    /// Start observing a different scope.
    ///
    /// In-flight reads are cancelled, the subscription is released, and the
    /// client cold-starts in the new scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the new subscription cannot be established.
    pub async fn switch_scope(&mut self, scope: Scope) -> Result<()> {
        self.context.cancel();
        self.context = self.shutdown.child_token();
        self.release_subscription();

        self.view = CachedView::new(scope);
        self.dirty = Dirty::default();
        self.phase = Phase::Cold;
        self.publish_snapshot();
        info!(%scope, "Switched observer scope");

        self.connect().await
    }

    /// Shut the client down. In-flight reads are cancelled and the
    /// subscription is released. Safe to call more than once.
    pub fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        self.shutdown.cancel();
        self.release_subscription();
        self.phase = Phase::Closed;
        self.publish_snapshot();
        info!("Observer closed");
    }

    /// Optimistically show `worker` checked in at `site`.
    pub fn begin_check_in(&mut self, worker: WorkerId, site: SiteId) -> PendingAction {
        self.begin(ActionKind::CheckIn { worker, site })
    }

    /// Optimistically show `worker` checked out.
    pub fn begin_check_out(&mut self, worker: WorkerId, site: SiteId) -> PendingAction {
        self.begin(ActionKind::CheckOut { worker, site })
    }

    /// Optimistically show the site's emergency flag as `active`.
    pub fn begin_emergency(&mut self, site: SiteId, active: bool) -> PendingAction {
        self.begin(ActionKind::Emergency { site, active })
    }

    /// Settle a pending action as accepted: re-read the affected entity and
    /// let the authoritative value replace the optimistic one.
    ///
    /// If the re-read fails the entity is scheduled for the next refetch.
    ///
    /// # Errors
    ///
    /// Returns an error if the action is not pending.
    pub async fn confirm(&mut self, action: &mut PendingAction) -> Result<()> {
        if action.phase != ActionPhase::Pending {
            return Err(Error::internal("action is already settled"));
        }

        match action.kind {
            ActionKind::CheckIn { worker, .. } | ActionKind::CheckOut { worker, .. } => {
                self.view.settle_worker(worker);
                let stamp = self.stamp();
                let backend = Arc::clone(&self.backend);
                let outcome = cancellable(
                    &self.context,
                    self.policy
                        .run("fetch worker state", || backend.fetch_worker_state(worker)),
                )
                .await;
                match outcome {
                    Ok(status) => {
                        self.view.apply_worker_state(stamp, worker, status);
                    }
                    Err(err) => {
                        warn!(%worker, error = %err, "Re-read after action failed");
                        self.mark_dirty(true, false);
                    }
                }
            }
            ActionKind::Emergency { site, .. } => {
                self.view.settle_site(site);
                let stamp = self.stamp();
                let backend = Arc::clone(&self.backend);
                let outcome = cancellable(
                    &self.context,
                    self.policy.run("fetch site", || backend.fetch_site(site)),
                )
                .await;
                match outcome {
                    Ok(fresh) => {
                        self.view.apply_site(stamp, fresh);
                    }
                    Err(err) => {
                        warn!(%site, error = %err, "Re-read after action failed");
                        self.mark_dirty(false, true);
                    }
                }
            }
        }

        action.previous = None;
        action.phase = ActionPhase::Confirmed;
        self.publish_snapshot();
        Ok(())
    }

    /// Settle a pending action as refused and restore the previous value.
    ///
    /// Reads that arrived while the action was pending skipped the entity,
    /// so a refetch is scheduled to pick up whatever they carried.
    pub fn roll_back(&mut self, action: &mut PendingAction) {
        if action.phase != ActionPhase::Pending {
            return;
        }

        match (action.kind, action.previous.take()) {
            (
                ActionKind::CheckIn { worker, .. } | ActionKind::CheckOut { worker, .. },
                previous,
            ) => {
                let previous = match previous {
                    Some(Previous::Worker(previous)) => previous,
                    _ => None,
                };
                self.view.restore_worker(worker, previous);
                self.mark_dirty(true, false);
            }
            (ActionKind::Emergency { site, .. }, previous) => {
                if let Some(Previous::Site(previous)) = previous {
                    self.view.restore_site(site, previous);
                } else {
                    self.view.settle_site(site);
                }
                self.mark_dirty(false, true);
            }
        }

        action.phase = ActionPhase::RolledBack;
        self.publish_snapshot();
    }

    /// Check a worker in with an optimistic update.
    ///
    /// # Errors
    ///
    /// Returns the backend's error after rolling the view back.
    pub async fn check_in(&mut self, worker: WorkerId, site: SiteId) -> Result<CheckEvent> {
        let mut action = self.begin_check_in(worker, site);
        let backend = Arc::clone(&self.backend);
        let outcome = self
            .policy
            .call_once("check in", backend.check_in(worker, site))
            .await;
        self.settle(&mut action, outcome).await
    }

    /// Check a worker out with an optimistic update.
    ///
    /// # Errors
    ///
    /// Returns the backend's error after rolling the view back.
    pub async fn check_out(&mut self, worker: WorkerId, site: SiteId) -> Result<CheckEvent> {
        let mut action = self.begin_check_out(worker, site);
        let backend = Arc::clone(&self.backend);
        let outcome = self
            .policy
            .call_once("check out", backend.check_out(worker, site))
            .await;
        self.settle(&mut action, outcome).await
    }

    /// Set a site's emergency flag with an optimistic update.
    ///
    /// # Errors
    ///
    /// Returns the backend's error after rolling the view back.
    pub async fn set_emergency(&mut self, site: SiteId, active: bool) -> Result<Site> {
        let mut action = self.begin_emergency(site, active);
        let backend = Arc::clone(&self.backend);
        let outcome = self
            .policy
            .call_once("set emergency", backend.set_emergency(site, active))
            .await;
        self.settle(&mut action, outcome).await
    }

    /// Drive the client until shut down or until `signals` closes.
    ///
    /// Cold clients are activated first. Notifications are coalesced over
    /// the debounce window, lost subscriptions are re-established, and a
    /// degraded client waits for a foreground signal to try again.
    ///
    /// A refetch or reconnect in progress is abandoned as soon as a signal
    /// arrives; the signal is handled and the abandoned work rescheduled.
    pub async fn run(mut self, mut signals: mpsc::Receiver<ObserverSignal>) {
        let shutdown = self.shutdown.clone();
        let mut queued = None;

        loop {
            if shutdown.is_cancelled() {
                break;
            }
            let step = match queued.take() {
                Some(step) => step,
                None if self.needs_connect() => Step::Connect,
                None => {
                    let deadline = self.dirty.deadline;
                    tokio::select! {
                        () = shutdown.cancelled() => Step::Shutdown,
                        signal = signals.recv() => signal.map_or(Step::Shutdown, Step::Signal),
                        received = next_notification(self.subscription.as_mut()) => Step::Received(received),
                        () = wait_for_deadline(deadline) => Step::Flush,
                    }
                }
            };
            if matches!(step, Step::Shutdown) {
                break;
            }

            if step.is_interruptible() {
                let interrupted = {
                    let work = self.perform(step);
                    tokio::select! {
                        () = work => None,
                        signal = signals.recv() => Some(signal.map_or(Step::Shutdown, Step::Signal)),
                    }
                };
                if let Some(next) = interrupted {
                    debug!(phase = %self.phase, "Abandoned observer step for a new signal");
                    self.resume_after_interrupt();
                    queued = Some(next);
                }
            } else {
                self.perform(step).await;
            }
        }

        self.close();
    }

    async fn perform(&mut self, step: Step) {
        let outcome = match step {
            Step::Shutdown => Ok(()),
            Step::Connect => self.connect().await,
            Step::Signal(signal) => self.handle_signal(signal).await,
            Step::Received(Ok(notification)) => {
                self.handle_notification(notification);
                Ok(())
            }
            Step::Received(Err(err)) => self.on_subscription_lost(err).await,
            Step::Flush => self.flush_pending().await,
        };

        if let Err(err) = outcome {
            debug!(error = %err, phase = %self.phase, "Observer step failed");
        }
    }

    async fn handle_signal(&mut self, signal: ObserverSignal) -> Result<()> {
        match signal {
            ObserverSignal::Foreground => self.on_foreground().await,
            ObserverSignal::SwitchScope(scope) => self.switch_scope(scope).await,
            ObserverSignal::CheckIn {
                worker,
                site,
                reply,
            } => {
                let outcome = self.check_in(worker, site).await;
                // The caller may have stopped waiting.
                let _ = reply.send(outcome);
                Ok(())
            }
            ObserverSignal::CheckOut {
                worker,
                site,
                reply,
            } => {
                let outcome = self.check_out(worker, site).await;
                let _ = reply.send(outcome);
                Ok(())
            }
            ObserverSignal::SetEmergency {
                site,
                active,
                reply,
            } => {
                let outcome = self.set_emergency(site, active).await;
                let _ = reply.send(outcome);
                Ok(())
            }
        }
    }

    fn needs_connect(&self) -> bool {
        self.subscription.is_none() && matches!(self.phase, Phase::Cold | Phase::Reconnecting)
    }

    fn resume_after_interrupt(&mut self) {
        if self.dirty.workers || self.dirty.sites {
            self.schedule_flush();
        }
    }

    fn begin(&mut self, kind: ActionKind) -> PendingAction {
        let version = self.stamp();
        let previous = match kind {
            ActionKind::CheckIn { worker, site } => {
                let status = self.optimistic_status(worker, site, EventKind::Enter);
                Some(Previous::Worker(
                    self.view.put_optimistic_worker(version, status),
                ))
            }
            ActionKind::CheckOut { worker, site } => {
                let status = self.optimistic_status(worker, site, EventKind::Leave);
                Some(Previous::Worker(
                    self.view.put_optimistic_worker(version, status),
                ))
            }
            ActionKind::Emergency { site, active } => self.view.site(site).cloned().map(|s| {
                Previous::Site(self.view.put_optimistic_site(
                    version,
                    Site {
                        emergency: active,
                        ..s
                    },
                ))
            }),
        };

        debug!(?kind, "Applied optimistic update");
        self.publish_snapshot();
        PendingAction {
            kind,
            phase: ActionPhase::Pending,
            previous,
        }
    }

    fn optimistic_status(&self, worker: WorkerId, site: SiteId, kind: EventKind) -> WorkerStatus {
        let now = Utc::now();
        let mut status = self.view.worker(worker).cloned().unwrap_or_else(|| WorkerStatus {
            state: WorkerState {
                worker_id: worker,
                site_id: None,
                is_checked_in: false,
                last_check_in: None,
                last_check_out: None,
                updated_at: now,
            },
            worker_name: format!("worker {worker}"),
            site_name: None,
        });

        let event = CheckEvent {
            id: EventId::new(0),
            worker_id: worker,
            site_id: site,
            kind,
            timestamp: now,
        };
        status.state = project(Some(&status.state), &event);
        status.site_name = if kind.is_enter() {
            self.view.site(site).map(|s| s.name.clone())
        } else {
            None
        };
        status
    }

    async fn settle<T>(&mut self, action: &mut PendingAction, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                self.confirm(action).await?;
                Ok(value)
            }
            Err(err) => {
                info!(kind = ?action.kind, error = %err, "Action refused; rolling back");
                self.roll_back(action);
                Err(err)
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        // Subscribe before reading so no change between the two is missed.
        self.subscribe_with_backoff().await?;

        if let Err(err) = self.refresh_all().await {
            warn!(error = %err, "Initial read failed; will retry");
        }
        Ok(())
    }

    async fn subscribe_with_backoff(&mut self) -> Result<()> {
        let attempts = self.reconnect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                if self.phase != Phase::Reconnecting {
                    self.phase = Phase::Reconnecting;
                    self.publish_snapshot();
                }
                let delay = self.policy.backoff(attempt - 1);
                cancellable(&self.context, async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }

            let backend = Arc::clone(&self.backend);
            let outcome = cancellable(
                &self.context,
                self.policy.call_once("subscribe", backend.subscribe()),
            )
            .await;
            match outcome {
                Ok(subscription) => {
                    self.subscription = Some(subscription);
                    self.phase = Phase::Subscribed;
                    self.publish_snapshot();
                    info!(scope = %self.view.scope(), attempt, "Subscribed to changes");
                    return Ok(());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(err) => {
                    warn!(attempt, error = %err, "Subscribe failed");
                    last_error = Some(err);
                }
            }
        }

        self.phase = Phase::Degraded;
        self.publish_snapshot();
        warn!(attempts, "Reconnection exhausted; view may be stale");
        Err(last_error
            .unwrap_or_else(|| Error::subscription_lost("reconnection attempts exhausted")))
    }

    async fn refresh_workers(&mut self) -> Result<()> {
        let stamp = self.stamp();
        let backend = Arc::clone(&self.backend);
        let outcome = cancellable(
            &self.context,
            self.policy
                .run("fetch worker states", || backend.fetch_worker_states()),
        )
        .await;

        match outcome {
            Ok(statuses) => {
                let changed = self.view.apply_worker_states(stamp, statuses);
                self.dirty.workers = false;
                debug!(stamp, changed, "Refreshed worker states");
                self.publish_snapshot();
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Worker state refresh failed; keeping last known view");
                Err(err)
            }
        }
    }

    async fn refresh_sites(&mut self) -> Result<()> {
        let stamp = self.stamp();
        let backend = Arc::clone(&self.backend);
        let outcome = match self.view.scope() {
            Scope::All => {
                cancellable(
                    &self.context,
                    self.policy.run("fetch sites", || backend.fetch_sites()),
                )
                .await
            }
            Scope::Site(site) => cancellable(
                &self.context,
                self.policy.run("fetch site", || backend.fetch_site(site)),
            )
            .await
            .map(|site| vec![site]),
        };

        match outcome {
            Ok(sites) => {
                let changed = self.view.apply_sites(stamp, sites);
                self.dirty.sites = false;
                debug!(stamp, changed, "Refreshed sites");
                self.publish_snapshot();
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Site refresh failed; keeping last known view");
                Err(err)
            }
        }
    }

    fn mark_dirty(&mut self, workers: bool, sites: bool) {
        self.dirty.workers |= workers;
        self.dirty.sites |= sites;
        self.schedule_flush();
    }

    fn schedule_flush(&mut self) {
        if self.dirty.deadline.is_none() {
            self.dirty.deadline = Some(Instant::now() + self.debounce);
        }
    }

    fn stamp(&self) -> u64 {
        self.backend.sequence().max(self.last_seen)
    }

    fn release_subscription(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

fn snapshot_of(view: &CachedView, phase: Phase) -> ViewSnapshot {
    let loaded = view.is_loaded();
    ViewSnapshot {
        phase,
        scope: view.scope(),
        checked_in: loaded.then(|| view.checked_in_count()),
        emergency_active: loaded.then(|| view.emergency_active()),
        workers: view.workers(),
        sites: view.sites(),
        recently_changed: view.recently_changed(),
        pending: view.pending(),
    }
}

async fn cancellable<T>(
    token: &CancellationToken,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(Error::Cancelled),
        outcome = operation => outcome,
    }
}

async fn next_notification(subscription: Option<&mut Subscription>) -> Result<Notification> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
