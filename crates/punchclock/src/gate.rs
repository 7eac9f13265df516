//! Site emergency override.

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{EventKind, Site, SiteId};
use crate::notifier::{Change, ChangeNotifier, Operation};
use crate::storage::SharedStorage;

/// Owns the per-site emergency flag.
///
/// Writes go through the `update_site_emergency` procedure and are confirmed
/// by reading the site back before the caller is told they succeeded.
#[derive(Debug, Clone)]
pub struct EmergencyGate {
    storage: SharedStorage,
    notifier: ChangeNotifier,
}

impl EmergencyGate {
    /// Create a gate over shared storage.
    #[must_use]
    pub fn new(storage: SharedStorage, notifier: ChangeNotifier) -> Self {
        Self { storage, notifier }
    }

    /// Decide whether `kind` may be appended at `site`.
    ///
    /// Only check-ins are ever refused. A worker can always leave.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmergencyBlocked`] for a check-in at a site under
    /// emergency.
    pub fn admit(site: &Site, kind: EventKind) -> Result<()> {
        if site.emergency && kind.is_enter() {
            return Err(Error::EmergencyBlocked { site_id: site.id });
        }
        Ok(())
    }

    /// Set a site's emergency flag and return the confirmed site.
    ///
    /// Setting the value the site already has is a no-op: nothing is written
    /// and nothing is published.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown site and
    /// [`Error::SyncFailure`] if the follow-up read does not show the new
    /// value.
    pub async fn set_emergency(&self, site_id: SiteId, active: bool) -> Result<Site> {
        let storage = self.storage.lock().await;
        let current = storage
            .site(site_id)?
            .ok_or_else(|| Error::site_not_found(site_id))?;

        if current.emergency == active {
            debug!(site = %site_id, active, "Emergency flag already set");
            return Ok(current);
        }

        storage.update_site_emergency(site_id, active)?;

        let confirmed = storage.site(site_id)?.ok_or_else(|| {
            Error::sync(format!("site {site_id} vanished while updating emergency"))
        })?;
        if confirmed.emergency != active {
            warn!(site = %site_id, active, "Emergency update was not confirmed");
            return Err(Error::sync(format!(
                "emergency for site {site_id} still reads {}",
                confirmed.emergency
            )));
        }

        // Published under the storage lock so per-site notification order
        // matches write order.
        self.notifier.publish(
            Operation::Update,
            Change::Site {
                site_id,
                emergency: Some(active),
            },
        );
        drop(storage);

        if active {
            warn!(site = %site_id, name = %confirmed.name, "Emergency declared; check-ins blocked");
        } else {
            info!(site = %site_id, name = %confirmed.name, "Emergency lifted");
        }
        Ok(confirmed)
    }

    /// Whether a site is under emergency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown site.
    pub async fn is_emergency(&self, site_id: SiteId) -> Result<bool> {
        let site = self
            .storage
            .lock()
            .await
            .site(site_id)?
            .ok_or_else(|| Error::site_not_found(site_id))?;
        Ok(site.emergency)
    }

    /// Apply [`EmergencyGate::set_emergency`] to every site.
    ///
    /// Each site is confirmed on its own; one failure does not stop the rest.
    ///
    /// # Errors
    ///
    /// Returns an error only if the site list cannot be read.
    pub async fn set_emergency_all(&self, active: bool) -> Result<Vec<(SiteId, Result<Site>)>> {
        let sites = self.storage.lock().await.sites()?;
        let mut outcomes = Vec::with_capacity(sites.len());
        for site in sites {
            let outcome = self.set_emergency(site.id, active).await;
            outcomes.push((site.id, outcome));
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn gate() -> (EmergencyGate, ChangeNotifier, SiteId) {
        let storage = Storage::open_in_memory().unwrap();
        let site = storage.add_site("Yard").unwrap().id;
        let notifier = ChangeNotifier::default();
        (
            EmergencyGate::new(storage.into_shared(), notifier.clone()),
            notifier,
            site,
        )
    }

    #[test]
    fn test_admit() {
        let mut site = Site {
            id: SiteId::new(1),
            name: "Yard".to_string(),
            emergency: false,
        };
        assert!(EmergencyGate::admit(&site, EventKind::Enter).is_ok());

        site.emergency = true;
        let err = EmergencyGate::admit(&site, EventKind::Enter).unwrap_err();
        assert!(matches!(err, Error::EmergencyBlocked { site_id } if site_id == site.id));
        assert!(EmergencyGate::admit(&site, EventKind::Leave).is_ok());
    }

    #[tokio::test]
    async fn test_set_emergency_twice_publishes_once() {
        let (gate, notifier, site) = gate();
        let mut sub = notifier.subscribe();

        let first = gate.set_emergency(site, true).await.unwrap();
        let second = gate.set_emergency(site, true).await.unwrap();
        assert!(first.emergency);
        assert_eq!(first, second);
        assert_eq!(notifier.sequence(), 1);

        let notification = sub.recv().await.unwrap();
        assert_eq!(
            notification.change,
            Change::Site {
                site_id: site,
                emergency: Some(true)
            }
        );
        assert!(gate.is_emergency(site).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_emergency() {
        let (gate, notifier, site) = gate();
        gate.set_emergency(site, true).await.unwrap();
        let cleared = gate.set_emergency(site, false).await.unwrap();

        assert!(!cleared.emergency);
        assert!(!gate.is_emergency(site).await.unwrap());
        assert_eq!(notifier.sequence(), 2);
    }

    #[tokio::test]
    async fn test_unknown_site() {
        let (gate, notifier, _) = gate();
        let missing = SiteId::new(404);

        assert!(matches!(
            gate.set_emergency(missing, true).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            gate.is_emergency(missing).await,
            Err(Error::NotFound { .. })
        ));
        assert_eq!(notifier.sequence(), 0);
    }

    #[tokio::test]
    async fn test_set_emergency_all() {
        let storage = Storage::open_in_memory().unwrap();
        let a = storage.add_site("A").unwrap().id;
        let b = storage.add_site("B").unwrap().id;
        let notifier = ChangeNotifier::default();
        let gate = EmergencyGate::new(storage.into_shared(), notifier.clone());

        gate.set_emergency(a, true).await.unwrap();
        let outcomes = gate.set_emergency_all(true).await.unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, r)| r.as_ref().is_ok_and(|s| s.emergency)));
        assert!(gate.is_emergency(b).await.unwrap());
        // Site A was already set, so only B produced a notification.
        assert_eq!(notifier.sequence(), 2);
    }
}
