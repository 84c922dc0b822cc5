use std::future::Future;

use super::{make_rollback_snapshot, TestResult};
use crate::{EngineStorage, StorageError};

pub(super) async fn run_rollback_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "rollback",
            "snapshot_readable_after_commit",
            snapshot_readable_after_commit(factory).await,
        ),
        TestResult::from_result(
            "rollback",
            "claim_twice_returns_consumed",
            claim_twice_returns_consumed(factory).await,
        ),
        TestResult::from_result(
            "rollback",
            "release_allows_reclaim",
            release_allows_reclaim(factory).await,
        ),
        TestResult::from_result(
            "rollback",
            "claim_missing_returns_not_found",
            claim_missing_returns_not_found(factory).await,
        ),
        TestResult::from_result(
            "rollback",
            "delete_discards_snapshot",
            delete_discards_snapshot(factory).await,
        ),
    ]
}

async fn seed_snapshot<S: EngineStorage>(storage: &S, next_move_id: &str) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_rollback_snapshot(&mut snap, make_rollback_snapshot(next_move_id, "m1"))
        .await
        .map_err(|e| format!("insert snapshot: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

/// Claim in its own snapshot; returns the storage error if the claim fails.
async fn claim<S: EngineStorage>(
    storage: &S,
    next_move_id: &str,
) -> Result<Result<(), StorageError>, String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    match storage.claim_rollback_snapshot(&mut snap, next_move_id).await {
        Ok(_) => Ok(storage.commit_snapshot(snap).await),
        Err(e) => {
            let _ = storage.abort_snapshot(snap).await;
            Ok(Err(e))
        }
    }
}

async fn snapshot_readable_after_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_snapshot(&storage, "nm-1").await?;

    match storage.get_rollback_snapshot("nm-1").await {
        Ok(Some(s)) if !s.consumed && s.prior_state["title"] == "Old title" => Ok(()),
        other => Err(format!("unexpected snapshot: {other:?}")),
    }
}

async fn claim_twice_returns_consumed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_snapshot(&storage, "nm-1").await?;

    claim(&storage, "nm-1")
        .await?
        .map_err(|e| format!("first claim: {e}"))?;
    match claim(&storage, "nm-1").await? {
        Err(StorageError::SnapshotConsumed { .. }) => Ok(()),
        Err(e) => Err(format!("expected SnapshotConsumed, got {e}")),
        Ok(()) => Err("snapshot claimed twice".to_string()),
    }
}

async fn release_allows_reclaim<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_snapshot(&storage, "nm-1").await?;
    claim(&storage, "nm-1")
        .await?
        .map_err(|e| format!("claim: {e}"))?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .release_rollback_snapshot(&mut snap, "nm-1")
        .await
        .map_err(|e| format!("release: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    claim(&storage, "nm-1")
        .await?
        .map_err(|e| format!("reclaim after release: {e}"))
}

async fn claim_missing_returns_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match claim(&storage, "nm-missing").await? {
        Err(StorageError::SnapshotNotFound { .. }) => Ok(()),
        Err(e) => Err(format!("expected SnapshotNotFound, got {e}")),
        Ok(()) => Err("claimed a snapshot that does not exist".to_string()),
    }
}

async fn delete_discards_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_snapshot(&storage, "nm-1").await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .delete_rollback_snapshot(&mut snap, "nm-1")
        .await
        .map_err(|e| format!("delete: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    match storage.get_rollback_snapshot("nm-1").await {
        Ok(None) => Ok(()),
        other => Err(format!("snapshot survived delete: {other:?}")),
    }
}
