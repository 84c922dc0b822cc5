use std::future::Future;

use super::{make_next_move, seed_ledger, TestResult};
use crate::{EngineStorage, StorageError};

pub(super) async fn run_isolation_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "isolation",
            "uncommitted_debit_invisible",
            uncommitted_debit_invisible(factory).await,
        ),
        TestResult::from_result(
            "isolation",
            "uncommitted_next_move_invisible",
            uncommitted_next_move_invisible(factory).await,
        ),
        TestResult::from_result(
            "isolation",
            "aborted_snapshot_discards_writes",
            aborted_snapshot_discards_writes(factory).await,
        ),
    ]
}

async fn uncommitted_debit_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .update_ledger(&mut snap, "m1", 0, 85, None)
        .await
        .map_err(|e| format!("debit: {e}"))?;

    let outside = storage.get_ledger("m1").await.map_err(|e| format!("{e}"))?;
    if outside.remaining != 100 {
        return Err(format!(
            "uncommitted debit visible: remaining {}",
            outside.remaining
        ));
    }
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    let after = storage.get_ledger("m1").await.map_err(|e| format!("{e}"))?;
    if after.remaining != 85 {
        return Err(format!("committed debit not visible: {}", after.remaining));
    }
    Ok(())
}

async fn uncommitted_next_move_invisible<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_next_move(&mut snap, make_next_move("nm-1", "m1", "ready"), None)
        .await
        .map_err(|e| format!("insert: {e}"))?;

    match storage.head_next_move("m1").await {
        Ok(None) => {}
        Ok(Some(r)) => return Err(format!("uncommitted head visible: {}", r.id)),
        Err(e) => return Err(format!("head: {e}")),
    }
    match storage.get_next_move("nm-1").await {
        Err(StorageError::NextMoveNotFound { .. }) => {}
        Err(e) => return Err(format!("expected NextMoveNotFound, got {e}")),
        Ok(_) => return Err("uncommitted next move readable".to_string()),
    }
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))
}

async fn aborted_snapshot_discards_writes<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .update_ledger(&mut snap, "m1", 0, 0, None)
        .await
        .map_err(|e| format!("debit: {e}"))?;
    storage
        .insert_next_move(&mut snap, make_next_move("nm-1", "m1", "executing"), None)
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    let row = storage.get_ledger("m1").await.map_err(|e| format!("{e}"))?;
    if row.remaining != 100 || row.version != 0 {
        return Err(format!(
            "abort leaked ledger write: remaining={} version={}",
            row.remaining, row.version
        ));
    }
    let merchants = storage.list_merchants().await.map_err(|e| format!("{e}"))?;
    if !merchants.is_empty() {
        return Err(format!("abort leaked next move for {merchants:?}"));
    }
    Ok(())
}
