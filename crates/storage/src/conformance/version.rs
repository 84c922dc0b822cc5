use std::future::Future;

use super::{make_next_move, seed_ledger, seed_next_move, TestResult};
use crate::{EngineStorage, StorageError};

pub(super) async fn run_version_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "version",
            "ledger_versions_increment_sequentially",
            ledger_versions_increment_sequentially(factory).await,
        ),
        TestResult::from_result(
            "version",
            "stale_ledger_version_returns_conflict",
            stale_ledger_version_returns_conflict(factory).await,
        ),
        TestResult::from_result(
            "version",
            "next_move_update_returns_new_version",
            next_move_update_returns_new_version(factory).await,
        ),
        TestResult::from_result(
            "version",
            "stale_next_move_version_returns_conflict",
            stale_next_move_version_returns_conflict(factory).await,
        ),
    ]
}

async fn ledger_versions_increment_sequentially<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_ledger(&storage, "m1", 100).await?;

    for expected in 0..3i64 {
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        let new_version = storage
            .update_ledger(&mut snap, "m1", expected, 100 - (expected + 1) * 10, None)
            .await
            .map_err(|e| format!("update v{expected}: {e}"))?;
        if new_version != expected + 1 {
            return Err(format!(
                "expected new version {}, got {new_version}",
                expected + 1
            ));
        }
        storage
            .commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit: {e}"))?;
    }

    let row = storage.get_ledger("m1").await.map_err(|e| format!("{e}"))?;
    if row.version != 3 || row.remaining != 70 {
        return Err(format!(
            "expected 70@3, got {}@{}",
            row.remaining, row.version
        ));
    }
    Ok(())
}

async fn stale_ledger_version_returns_conflict<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_ledger(&storage, "m1", 100).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let staged = storage.update_ledger(&mut snap, "m1", 7, 50, None).await;
    let outcome = match staged {
        Err(e) => {
            let _ = storage.abort_snapshot(snap).await;
            Err(e)
        }
        Ok(_) => storage.commit_snapshot(snap).await,
    };
    match outcome {
        Err(StorageError::ConcurrentConflict {
            expected_version, ..
        }) if expected_version == 7 => Ok(()),
        Err(e) => Err(format!("expected ConcurrentConflict(7), got {e}")),
        Ok(()) => Err("stale ledger version committed".to_string()),
    }
}

async fn next_move_update_returns_new_version<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_next_move(&storage, "nm-1", "m1", None).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let v1 = storage
        .update_next_move(&mut snap, make_next_move("nm-1", "m1", "executing"), 0)
        .await
        .map_err(|e| format!("update: {e}"))?;
    let v2 = storage
        .update_next_move(&mut snap, make_next_move("nm-1", "m1", "monitoring"), v1)
        .await
        .map_err(|e| format!("update: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let row = storage
        .get_next_move("nm-1")
        .await
        .map_err(|e| format!("{e}"))?;
    if v1 != 1 || v2 != 2 || row.version != 2 || row.status != "monitoring" {
        return Err(format!(
            "expected monitoring@2 (v1=1, v2=2), got {}@{} (v1={v1}, v2={v2})",
            row.status, row.version
        ));
    }
    Ok(())
}

async fn stale_next_move_version_returns_conflict<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_next_move(&storage, "nm-1", "m1", None).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let staged = storage
        .update_next_move(&mut snap, make_next_move("nm-1", "m1", "executing"), 3)
        .await;
    let outcome = match staged {
        Err(e) => {
            let _ = storage.abort_snapshot(snap).await;
            Err(e)
        }
        Ok(_) => storage.commit_snapshot(snap).await,
    };
    match outcome {
        Err(StorageError::ConcurrentConflict { .. }) => Ok(()),
        Err(e) => Err(format!("expected ConcurrentConflict, got {e}")),
        Ok(()) => Err("stale next move version committed".to_string()),
    }
}
