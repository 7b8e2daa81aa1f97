//! End-to-end engine behavior against the SQLite backend.

use futures::future::join_all;
use leadflow_core::{AssignmentResult, AssignmentStatus, CapacityRange, ChangeReason};
use leadflow_engine::{
    AssignmentEngine, AssignmentPolicy, EngineConfig, EngineError, ReassignOutcome,
};
use leadflow_storage::SqliteStorage;

fn range(min: f64, max: f64) -> CapacityRange {
    CapacityRange::new(min, max).unwrap()
}

async fn engine() -> AssignmentEngine<SqliteStorage> {
    AssignmentEngine::new(SqliteStorage::in_memory().await.unwrap())
}

#[tokio::test]
async fn test_assign_and_reassign_flow() {
    let engine = engine().await;
    let a = engine.register_worker("Asha", range(1000.0, 5000.0)).await.unwrap();
    let b = engine.register_worker("Bala", range(1000.0, 5000.0)).await.unwrap();
    let c = engine.register_worker("Chen", range(6000.0, 9000.0)).await.unwrap();

    let (first, result) = engine.submit("lead-1", 2000.0).await.unwrap();
    assert_eq!(result, AssignmentResult::Assigned(a.id));
    let (_, result) = engine.submit("lead-2", 2000.0).await.unwrap();
    assert_eq!(result, AssignmentResult::Assigned(b.id));

    let (_, result) = engine.submit("lead-3", 999_999.0).await.unwrap();
    assert_eq!(result, AssignmentResult::Unassigned);

    let err = engine.reassign(first.id, c.id).await.unwrap_err();
    assert!(matches!(err, EngineError::EligibilityMismatch { .. }));

    let outcome = engine.reassign(first.id, b.id).await.unwrap();
    assert_eq!(outcome, ReassignOutcome::Moved { from: a.id, to: b.id });
    assert_eq!(engine.active_assignments(b.id).await.unwrap().len(), 2);
    assert!(engine.active_assignments(a.id).await.unwrap().is_empty());

    let history = engine.history(first.id).await.unwrap();
    let reasons: Vec<_> = history.iter().map(|h| h.reason).collect();
    assert_eq!(reasons, vec![ChangeReason::Reassigned, ChangeReason::Assigned]);
}

#[tokio::test]
async fn test_rebalance_evens_out_loads() {
    let engine = engine().await;
    let a = engine.register_worker("A", range(0.0, 100.0)).await.unwrap();
    for i in 0..6 {
        let (_, result) = engine.submit(format!("lead-{i}"), 50.0).await.unwrap();
        assert_eq!(result, AssignmentResult::Assigned(a.id));
    }

    let b = engine.register_worker("B", range(0.0, 100.0)).await.unwrap();
    engine.register_worker("C", range(0.0, 100.0)).await.unwrap();

    let (item, result) = engine.submit("trigger", 50.0).await.unwrap();
    assert_eq!(result, AssignmentResult::Assigned(a.id));

    let loads: Vec<u64> = engine.worker_loads().await.unwrap().iter().map(|l| l.active_load).collect();
    assert_eq!(loads, vec![2, 2, 3]);

    // The two oldest of A's items went to B.
    let moved = engine.active_assignments(b.id).await.unwrap();
    assert!(moved.iter().all(|a| a.work_item_id != item.id));
    let history = engine.history(moved[0].work_item_id).await.unwrap();
    assert_eq!(history[0].reason, ChangeReason::Rebalanced);
    assert_eq!(history[0].previous_worker_id, Some(a.id));
}

#[tokio::test]
async fn test_concurrent_submissions_are_serialized() {
    let engine = engine()
        .await
        .with_config(EngineConfig::default().with_policy(AssignmentPolicy::Greedy));
    engine.register_worker("A", range(0.0, 100.0)).await.unwrap();
    engine.register_worker("B", range(0.0, 100.0)).await.unwrap();

    let results = join_all((0..8).map(|i| engine.submit(format!("lead-{i}"), 10.0))).await;
    for result in results {
        assert!(matches!(result.unwrap().1, AssignmentResult::Assigned(_)));
    }

    let loads: Vec<u64> = engine.worker_loads().await.unwrap().iter().map(|l| l.active_load).collect();
    assert_eq!(loads, vec![4, 4]);
}

#[tokio::test]
async fn test_complete_then_reassign_is_rejected() {
    let engine = engine().await;
    let a = engine.register_worker("A", range(0.0, 10.0)).await.unwrap();
    let b = engine.register_worker("B", range(0.0, 10.0)).await.unwrap();
    let (item, _) = engine.submit("lead", 5.0).await.unwrap();

    let done = engine.complete(item.id, a.id).await.unwrap();
    assert_eq!(done.status, AssignmentStatus::Completed);

    assert!(matches!(
        engine.reassign(item.id, b.id).await,
        Err(EngineError::AlreadyCompleted(_))
    ));
    assert!(matches!(
        engine.complete(item.id, a.id).await,
        Err(EngineError::NotAssigned { .. })
    ));
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leadflow.db");

    let (worker_id, item_id) = {
        let engine = AssignmentEngine::new(SqliteStorage::new_from_path(&path).await.unwrap());
        let worker = engine.register_worker("A", range(0.0, 10.0)).await.unwrap();
        let (item, _) = engine.submit("lead", 5.0).await.unwrap();
        (worker.id, item.id)
    };

    let engine = AssignmentEngine::new(SqliteStorage::new_from_path(&path).await.unwrap());
    let active = engine.active_assignments(worker_id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].work_item_id, item_id);
    assert_eq!(engine.history(item_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_two_handles_on_one_file_queue_their_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("leadflow.db");
    let config = EngineConfig::default().with_policy(AssignmentPolicy::Greedy);

    let first = AssignmentEngine::new(SqliteStorage::new_from_path(&path).await.unwrap())
        .with_config(config.clone());
    let second = AssignmentEngine::new(SqliteStorage::new_from_path(&path).await.unwrap())
        .with_config(config);
    first.register_worker("A", range(0.0, 100.0)).await.unwrap();
    first.register_worker("B", range(0.0, 100.0)).await.unwrap();

    // Neither handle sees the other's writer lock; only SQLite orders them.
    let submits = (0..16).map(|i| {
        let engine = if i % 2 == 0 { &first } else { &second };
        engine.submit(format!("lead-{i}"), 10.0)
    });
    for result in join_all(submits).await {
        assert!(matches!(result.unwrap().1, AssignmentResult::Assigned(_)));
    }

    let loads: Vec<u64> = second.worker_loads().await.unwrap().iter().map(|l| l.active_load).collect();
    assert_eq!(loads, vec![8, 8]);
}
