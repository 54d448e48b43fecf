//! Integration test: job lifecycle.
//!
//! Batches are split into one job per backend and operation; jobs report
//! through the progress protocol and only their reports change bookkeeping.

use std::time::Duration;

use shelf_engine::EngineError;
use shelf_integration_tests::{Script, SETTLE_TIMEOUT, TestShelf};
use shelf_types::events::{FileStored, RequestFailed};
use shelf_types::*;

fn checksums(list: &[&str]) -> Vec<Checksum> {
    list.iter().map(|c| Checksum::from(*c)).collect()
}

#[tokio::test]
async fn test_batch_runs_one_job_per_backend() {
    let shelf = TestShelf::with_backends(&[
        ("disk-a", BackendKind::Online),
        ("disk-b", BackendKind::Online),
        ("tape", BackendKind::Nearline),
    ]);

    let outcomes = shelf
        .run(vec![
            shelf.store("f1", "disk-b", 10),
            shelf.store("f2", "disk-a", 10),
            shelf.store("f3", "disk-b", 10),
            shelf.store("f4", "tape", 10),
            shelf.store("f5", "disk-a", 10),
        ])
        .await;

    assert_eq!(outcomes.len(), 5);
    assert!(outcomes.iter().all(RequestOutcome::is_success));

    let a = shelf.plugin("disk-a").jobs();
    assert_eq!(a.len(), 1);
    assert_eq!(a[0].kind, RequestKind::Storage);
    assert_eq!(a[0].checksums, checksums(&["f2", "f5"]));
    assert_eq!(shelf.plugin("disk-b").jobs()[0].checksums, checksums(&["f1", "f3"]));
    assert_eq!(shelf.plugin("tape").jobs().len(), 1);

    assert_eq!(shelf.file("f4").unwrap().backend_label, "tape");
    assert_eq!(shelf.file("f1").unwrap().url, "scripted://disk-b/f1");
}

#[tokio::test]
async fn test_mixed_operations_are_split_by_kind() {
    let shelf = TestShelf::with_backends(&[("disk", BackendKind::Online), ("tape", BackendKind::Nearline)]);
    shelf.put("old", "disk", 10).await;
    shelf.put("cold", "tape", 10).await;

    let outcomes = shelf
        .run(vec![
            shelf.store("new", "disk", 10),
            shelf.delete("old"),
            shelf.restore("cold"),
        ])
        .await;
    assert!(outcomes.iter().all(RequestOutcome::is_success));

    let kinds: Vec<RequestKind> = shelf.plugin("disk").jobs().iter().map(|j| j.kind).collect();
    assert!(kinds.contains(&RequestKind::Deletion));
    assert_eq!(kinds.iter().filter(|k| **k == RequestKind::Storage).count(), 2);
    assert!(shelf.file("old").is_none());
    assert!(shelf.file("new").is_some());

    let entry = shelf.meta.get_cache_entry(&"cold".into()).unwrap().unwrap();
    assert_eq!(entry.source_backend, "tape");
    assert_eq!(entry.local_path.to_str(), Some("/restored/cold"));
}

#[tokio::test]
async fn test_failed_requests_leave_no_trace() {
    let shelf = TestShelf::with_backends(&[("disk", BackendKind::Online)]);
    let disk = shelf.plugin("disk");
    disk.script("bad", Script::Fail("checksum mismatch".into()));
    let mut failures = shelf.events.subscribe::<RequestFailed>();

    let outcomes = shelf
        .run(vec![shelf.store("good", "disk", 10), shelf.store("bad", "disk", 10)])
        .await;

    assert!(outcomes[0].is_success());
    assert_eq!(
        outcomes[1].status,
        OutcomeStatus::Failed {
            cause: "checksum mismatch".into()
        }
    );
    assert!(shelf.file("good").is_some());
    assert!(shelf.file("bad").is_none());

    let failure = failures.try_recv().unwrap();
    assert_eq!(failure.kind, RequestKind::Storage);
    assert_eq!(failure.cause, "checksum mismatch");
}

#[tokio::test]
async fn test_failed_deletion_keeps_reference() {
    let shelf = TestShelf::with_backends(&[("disk", BackendKind::Online)]);
    shelf.put("f1", "disk", 10).await;
    shelf.plugin("disk").script("f1", Script::Fail("device busy".into()));

    let outcomes = shelf.run(vec![shelf.delete("f1")]).await;

    assert!(!outcomes[0].is_success());
    assert!(shelf.file("f1").is_some());
}

#[tokio::test]
async fn test_duplicate_reports_apply_once() {
    let shelf = TestShelf::with_backends(&[("disk", BackendKind::Online)]);
    let disk = shelf.plugin("disk");
    disk.script("twice", Script::ReportTwice);
    disk.script("flip", Script::SucceedThenFail);
    let mut stored = shelf.events.subscribe::<FileStored>();
    let mut failures = shelf.events.subscribe::<RequestFailed>();

    let outcomes = shelf
        .run(vec![shelf.store("twice", "disk", 10), shelf.store("flip", "disk", 10)])
        .await;

    assert!(outcomes.iter().all(RequestOutcome::is_success));
    assert!(shelf.file("twice").is_some());
    assert!(shelf.file("flip").is_some());

    assert!(stored.try_recv().is_some());
    assert!(stored.try_recv().is_some());
    assert!(stored.try_recv().is_none());
    assert!(failures.try_recv().is_none());
}

#[tokio::test]
async fn test_unreported_request_stays_unresolved() {
    let shelf = TestShelf::with_backends(&[("disk", BackendKind::Online)]);
    shelf.plugin("disk").script("lost", Script::Silent);

    let submission = shelf
        .engine
        .submit(vec![shelf.store("lost", "disk", 10), shelf.store("kept", "disk", 10)])
        .unwrap();
    let ids = submission.join().await;
    let outcomes = shelf
        .engine
        .await_outcomes(&ids, Duration::from_millis(200))
        .await;

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].checksum, Checksum::from("kept"));
    assert!(shelf.engine.outcome(ids[0]).is_none());
    assert!(shelf.file("lost").is_none());
}

#[tokio::test]
async fn test_late_report_is_applied_after_job_returns() {
    let shelf = TestShelf::with_backends(&[("tape", BackendKind::Nearline)]);
    shelf
        .plugin("tape")
        .script("slow", Script::Late(Duration::from_millis(100)));

    let submission = shelf.engine.submit(vec![shelf.store("slow", "tape", 10)]).unwrap();
    let ids = submission.join().await;
    assert!(shelf.engine.outcome(ids[0]).is_none());

    let outcomes = shelf.engine.await_outcomes(&ids, SETTLE_TIMEOUT).await;
    assert!(outcomes[0].is_success());
    assert_eq!(shelf.file("slow").unwrap().backend_label, "tape");
}

#[tokio::test]
async fn test_plugin_refusal_settles_before_job() {
    let shelf = TestShelf::with_backends(&[("disk", BackendKind::Online)]);
    shelf.plugin("disk").refuse("huge", "exceeds object size limit");

    let submission = shelf
        .engine
        .submit(vec![shelf.store("huge", "disk", 10), shelf.store("small", "disk", 10)])
        .unwrap();
    assert_eq!(submission.rejected.len(), 1);
    let refused = submission.rejected[0];
    assert_eq!(
        shelf.engine.outcome(refused).unwrap().status,
        OutcomeStatus::Failed {
            cause: "exceeds object size limit".into()
        }
    );

    let ids = submission.join().await;
    let outcomes = shelf.engine.await_outcomes(&ids, SETTLE_TIMEOUT).await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(shelf.plugin("disk").jobs()[0].checksums, checksums(&["small"]));
}

#[tokio::test]
async fn test_invalid_target_rejects_whole_batch() {
    let mut shelf = TestShelf::new();
    shelf.add_backend(BackendSpec::new("disk", BackendKind::Online));
    shelf.add_backend(BackendSpec::new("retired", BackendKind::Online).inactive());

    let inactive = shelf
        .engine
        .submit(vec![shelf.store("f1", "disk", 10), shelf.store("f2", "retired", 10)]);
    assert!(matches!(
        inactive,
        Err(EngineError::InactiveBackend { ref label, .. }) if label == "retired"
    ));

    let unknown = shelf.engine.submit(vec![shelf.store("f3", "nowhere", 10)]);
    assert!(matches!(unknown, Err(EngineError::UnknownBackend { .. })));

    assert!(shelf.plugin("disk").jobs().is_empty());
    assert!(shelf.file("f1").is_none());
}

#[tokio::test]
async fn test_restore_on_online_backend_fails() {
    let mut shelf = TestShelf::new();
    shelf.add_backend(BackendSpec::new("disk", BackendKind::Online));
    shelf.put("f1", "disk", 10).await;
    shelf.plugin("disk").script("f1", Script::Fail("online backends do not restore files".into()));

    let outcomes = shelf.run(vec![shelf.restore("f1")]).await;

    assert_eq!(outcomes[0].kind, RequestKind::Restoration);
    assert!(!outcomes[0].is_success());
    assert!(shelf.meta.get_cache_entry(&"f1".into()).unwrap().is_none());
}
