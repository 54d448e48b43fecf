//! Integration test: capacity monitoring over files stored through jobs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shelf_integration_tests::TestShelf;
use shelf_monitor::*;
use shelf_types::events::{CapacityLevel, CapacityThresholdCrossed};
use shelf_types::*;

#[derive(Default)]
struct Inbox {
    notes: Mutex<Vec<(String, NotificationLevel)>>,
    maintenance: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for Inbox {
    async fn notify(&self, _message: &str, title: &str, level: NotificationLevel, recipient_role: &str) {
        assert_eq!(recipient_role, ADMIN_ROLE);
        self.notes.lock().unwrap().push((title.to_string(), level));
    }
}

#[async_trait]
impl MaintenanceSignal for Inbox {
    async fn set_maintenance(&self, scope: &str) {
        self.maintenance.lock().unwrap().push(scope.to_string());
    }
}

fn shelf_with_bounded_backends() -> TestShelf {
    let mut shelf = TestShelf::new();
    shelf.add_backend(BackendSpec::new("disk", BackendKind::Online).with_capacity(1_000));
    shelf.add_backend(BackendSpec::new("tape", BackendKind::Nearline).with_capacity(10_000));
    shelf.add_backend(BackendSpec::new("scratch", BackendKind::Online));
    shelf
}

fn monitor(shelf: &TestShelf, inbox: &Arc<Inbox>) -> Arc<CapacityMonitor> {
    Arc::new(CapacityMonitor::new(
        shelf.registry.clone(),
        inbox.clone(),
        inbox.clone(),
        shelf.events.clone(),
        Thresholds::default(),
    ))
}

#[tokio::test]
async fn test_usage_follows_stored_and_deleted_files() {
    let shelf = shelf_with_bounded_backends();
    let inbox = Arc::new(Inbox::default());
    let monitor = monitor(&shelf, &inbox);

    shelf.put("a", "disk", 300).await;
    shelf.put("b", "disk", 200).await;
    shelf.put("c", "tape", 1_000).await;

    let report = monitor.run("default").await.unwrap();
    assert_eq!(report.backend("disk").unwrap().used_bytes, 500);
    assert_eq!(report.backend("disk").unwrap().occupation_percent, Some(50.0));
    assert_eq!(report.backend("tape").unwrap().file_count, 1);
    assert_eq!(report.backend("scratch").unwrap().occupation_percent, None);
    assert_eq!(report.alerts().count(), 0);

    shelf.run(vec![shelf.delete("a"), shelf.delete("c")]).await;
    let report = monitor.run("default").await.unwrap();
    assert_eq!(report.backend("disk").unwrap().used_bytes, 200);
    assert_eq!(report.backend("tape").unwrap().used_bytes, 0);
    assert_eq!(shelf.registry.get_by_label("tape").unwrap().used_capacity_bytes, 0);
}

#[tokio::test]
async fn test_thresholds_raise_notifications_and_maintenance() {
    let shelf = shelf_with_bounded_backends();
    let inbox = Arc::new(Inbox::default());
    let monitor = monitor(&shelf, &inbox);
    let mut crossed = shelf.events.subscribe::<CapacityThresholdCrossed>();

    shelf.put("a", "disk", 950).await;
    shelf.put("b", "tape", 7_500).await;
    shelf.put("c", "scratch", 1_000_000).await;

    let report = monitor.run("tenant-a").await.unwrap();

    assert!(report.maintenance);
    assert_eq!(report.backend("disk").unwrap().level, Some(CapacityLevel::Critical));
    assert_eq!(report.backend("tape").unwrap().level, Some(CapacityLevel::Warning));
    assert_eq!(report.backend("scratch").unwrap().level, None);
    assert_eq!(*inbox.maintenance.lock().unwrap(), vec!["tenant-a".to_string()]);

    let notes = inbox.notes.lock().unwrap().clone();
    assert_eq!(
        notes,
        vec![
            ("Data storage disk is full".to_string(), NotificationLevel::Error),
            ("Data storage tape is almost full".to_string(), NotificationLevel::Warning),
        ]
    );

    let mut levels = vec![crossed.try_recv().unwrap().level, crossed.try_recv().unwrap().level];
    levels.sort_by_key(|l| *l == CapacityLevel::Warning);
    assert_eq!(levels, vec![CapacityLevel::Critical, CapacityLevel::Warning]);
}

#[tokio::test]
async fn test_scheduler_pass_covers_every_scope() {
    let shelf = shelf_with_bounded_backends();
    let inbox = Arc::new(Inbox::default());
    shelf.put("a", "disk", 980).await;

    let scheduler = MonitorScheduler::new(
        monitor(&shelf, &inbox),
        Arc::new(StaticScopes::new(["tenant-a", "tenant-b"])),
        Duration::from_secs(3_600),
    );
    for run in scheduler.tick().await {
        assert!(run.await.unwrap().unwrap().maintenance);
    }

    let mut scopes = inbox.maintenance.lock().unwrap().clone();
    scopes.sort();
    assert_eq!(scopes, vec!["tenant-a", "tenant-b"]);
    for scope in ["tenant-a", "tenant-b"] {
        let run = shelf.meta.get_monitoring_run(scope).unwrap().unwrap();
        assert!(!run.running);
        assert!(run.last_run_at.is_some());
    }
}
