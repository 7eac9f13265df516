//! End-to-end attendance scenario on a file-backed database.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use punchclock::{
    Attendance, ChangeNotifier, Error, EventFilter, EventKind, ManualClock, Storage,
};

#[tokio::test]
async fn test_morning_on_site_a() {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path().join("attendance.db")).unwrap();
    let nine = Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap();
    let clock = ManualClock::new(nine);
    let service = Attendance::with_storage(
        storage,
        ChangeNotifier::default(),
        Arc::new(clock.clone()),
    );

    let w1 = service.add_worker("W1").await.unwrap().id;
    let w2 = service.add_worker("W2").await.unwrap().id;
    let site_a = service.add_site("Site A").await.unwrap().id;

    // 09:00 W1 checks in.
    service.check_in(w1, site_a).await.unwrap();
    let state = service.worker_status(w1).await.unwrap().unwrap().state;
    assert!(state.is_checked_in);
    assert_eq!(state.site_id, Some(site_a));
    assert_eq!(state.last_check_in, Some(nine));

    // 09:01 a second check-in is refused.
    clock.advance(Duration::minutes(1));
    let err = service.check_in(w1, site_a).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyCheckedIn { worker_id } if worker_id == w1));

    // 09:05 emergency at site A.
    clock.set(nine + Duration::minutes(5));
    let site = service.set_emergency(site_a, true).await.unwrap();
    assert!(site.emergency);

    // 09:06 W2 is kept out.
    clock.set(nine + Duration::minutes(6));
    let err = service.check_in(w2, site_a).await.unwrap_err();
    assert!(matches!(err, Error::EmergencyBlocked { site_id } if site_id == site_a));
    assert!(err.is_business());
    assert!(service.worker_status(w2).await.unwrap().is_none());

    // 09:10 W1 leaves despite the emergency.
    clock.set(nine + Duration::minutes(10));
    let leave = service.check_out(w1, site_a).await.unwrap();
    assert_eq!(leave.kind, EventKind::Leave);
    let state = service.worker_status(w1).await.unwrap().unwrap().state;
    assert!(!state.is_checked_in);
    assert_eq!(state.site_id, None);
    assert_eq!(state.last_check_out, Some(nine + Duration::minutes(10)));

    let events = service.history(&EventFilter::default()).await.unwrap();
    let kinds: Vec<_> = events.iter().rev().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Enter, EventKind::Leave]);
    assert!(service.projector().audit().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_ledger_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("attendance.db");

    let (worker, site) = {
        let service = Attendance::with_storage(
            Storage::open(&path).unwrap(),
            ChangeNotifier::default(),
            Arc::new(punchclock::SystemClock),
        );
        let worker = service.add_worker("Night shift").await.unwrap().id;
        let site = service.add_site("Depot").await.unwrap().id;
        service.check_in(worker, site).await.unwrap();
        (worker, site)
    };

    let reopened = Attendance::with_storage(
        Storage::open(&path).unwrap(),
        ChangeNotifier::default(),
        Arc::new(punchclock::SystemClock),
    );
    let status = reopened.worker_status(worker).await.unwrap().unwrap();
    assert!(status.is_present_at(site));
    assert_eq!(reopened.checked_in_at(site).await.unwrap().len(), 1);
}
