//! Integration test: backend priority ordering.
//!
//! Priorities within a kind stay a contiguous `0..n` under registration,
//! swaps, deletion and restarts, and readers never see a duplicate.

use std::sync::Arc;

use shelf_integration_tests::TestShelf;
use shelf_registry::RegistryError;
use shelf_types::*;

fn id(label: &str) -> BackendId {
    BackendId::from_label(label)
}

fn labels(shelf: &TestShelf, kind: BackendKind) -> Vec<String> {
    shelf.priorities(kind).into_iter().map(|(label, _)| label).collect()
}

/// A, B, C registered in order get 0, 1, 2; moving C up swaps it with B.
#[tokio::test]
async fn test_increase_priority_swaps_with_neighbour() {
    let shelf = TestShelf::with_backends(&[
        ("A", BackendKind::Online),
        ("B", BackendKind::Online),
        ("C", BackendKind::Online),
    ]);
    assert_eq!(
        shelf.priorities(BackendKind::Online),
        vec![("A".into(), 0), ("B".into(), 1), ("C".into(), 2)]
    );

    shelf.registry.increase_priority(&id("C")).unwrap();

    assert_eq!(
        shelf.priorities(BackendKind::Online),
        vec![("A".into(), 0), ("C".into(), 1), ("B".into(), 2)]
    );
}

#[tokio::test]
async fn test_moves_past_the_ends_are_noops() {
    let shelf = TestShelf::with_backends(&[("A", BackendKind::Online), ("B", BackendKind::Online)]);
    let before = shelf.priorities(BackendKind::Online);

    shelf.registry.increase_priority(&id("A")).unwrap();
    shelf.registry.decrease_priority(&id("B")).unwrap();

    assert_eq!(shelf.priorities(BackendKind::Online), before);
    assert!(matches!(
        shelf.registry.increase_priority(&id("missing")),
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_kinds_are_ordered_independently() {
    let shelf = TestShelf::with_backends(&[
        ("disk-1", BackendKind::Online),
        ("tape-1", BackendKind::Nearline),
        ("disk-2", BackendKind::Online),
        ("tape-2", BackendKind::Nearline),
    ]);
    shelf.registry.increase_priority(&id("tape-2")).unwrap();

    assert_eq!(labels(&shelf, BackendKind::Online), vec!["disk-1", "disk-2"]);
    assert_eq!(labels(&shelf, BackendKind::Nearline), vec!["tape-2", "tape-1"]);
    assert!(shelf.priorities(BackendKind::Offline).is_empty());
}

#[tokio::test]
async fn test_highest_active_candidate_wins() {
    let mut shelf = TestShelf::new();
    shelf.add_backend(BackendSpec::new("fast", BackendKind::Online).inactive());
    shelf.add_backend(BackendSpec::new("medium", BackendKind::Online));
    shelf.add_backend(BackendSpec::new("slow", BackendKind::Online));
    shelf.add_backend(BackendSpec::new("tape", BackendKind::Nearline));

    let chosen = shelf
        .registry
        .highest_active_for(&["slow", "fast", "medium", "tape"], BackendKind::Online)
        .unwrap();
    assert_eq!(chosen.label, "medium");

    shelf.registry.increase_priority(&id("slow")).unwrap();
    let chosen = shelf
        .registry
        .highest_active_for(&["slow", "medium"], BackendKind::Online)
        .unwrap();
    assert_eq!(chosen.label, "slow");

    assert!(
        shelf
            .registry
            .highest_active_for(&["fast"], BackendKind::Online)
            .is_none()
    );
}

#[tokio::test]
async fn test_delete_is_refused_while_files_remain() {
    let shelf = TestShelf::with_backends(&[
        ("A", BackendKind::Online),
        ("B", BackendKind::Online),
        ("C", BackendKind::Online),
    ]);
    shelf.put("f1", "B", 10).await;

    let refused = shelf.registry.delete(&id("B"));
    assert!(matches!(refused, Err(RegistryError::Forbidden { .. })));
    assert_eq!(shelf.priorities(BackendKind::Online).len(), 3);

    let outcomes = shelf.run(vec![shelf.delete("f1")]).await;
    assert!(outcomes[0].is_success());

    shelf.registry.delete(&id("B")).unwrap();
    assert_eq!(
        shelf.priorities(BackendKind::Online),
        vec![("A".into(), 0), ("C".into(), 1)]
    );
    assert!(shelf.registry.plugin_for("B").is_none());
}

#[tokio::test]
async fn test_order_survives_restart() {
    let shelf = TestShelf::with_backends(&[
        ("A", BackendKind::Online),
        ("B", BackendKind::Online),
        ("T", BackendKind::Nearline),
    ]);
    shelf.registry.decrease_priority(&id("A")).unwrap();
    shelf.put("f1", "A", 10).await;

    let shelf = shelf.restart();

    assert_eq!(
        shelf.priorities(BackendKind::Online),
        vec![("B".into(), 0), ("A".into(), 1)]
    );
    assert_eq!(labels(&shelf, BackendKind::Nearline), vec!["T"]);
    // Plugins are bound again, so jobs still run.
    let outcomes = shelf.run(vec![shelf.store("f2", "B", 5)]).await;
    assert!(outcomes[0].is_success());
    assert_eq!(shelf.file("f1").unwrap().backend_label, "A");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_observe_duplicate_priorities() {
    let shelf = TestShelf::with_backends(&[
        ("A", BackendKind::Online),
        ("B", BackendKind::Online),
        ("C", BackendKind::Online),
        ("D", BackendKind::Online),
    ]);
    let registry = Arc::clone(&shelf.registry);

    let mut writers = Vec::new();
    for (n, label) in ["A", "B", "C", "D"].into_iter().enumerate() {
        let registry = Arc::clone(&registry);
        writers.push(tokio::spawn(async move {
            for i in 0..200 {
                if (i + n) % 2 == 0 {
                    registry.increase_priority(&BackendId::from_label(label)).unwrap();
                } else {
                    registry.decrease_priority(&BackendId::from_label(label)).unwrap();
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    let reader = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move {
            for _ in 0..2_000 {
                let mut priorities: Vec<u32> = registry
                    .list_by_kind(BackendKind::Online)
                    .iter()
                    .map(|b| b.priority)
                    .collect();
                priorities.sort_unstable();
                assert_eq!(priorities, vec![0, 1, 2, 3]);
                tokio::task::yield_now().await;
            }
        }
    });

    for writer in writers {
        writer.await.unwrap();
    }
    reader.await.unwrap();

    let mut labels = labels(&shelf, BackendKind::Online);
    labels.sort();
    assert_eq!(labels, vec!["A", "B", "C", "D"]);
}
