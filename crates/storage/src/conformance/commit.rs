use std::future::Future;

use super::{make_next_move, make_rollback_snapshot, seed_ledger, seed_next_move, TestResult};
use crate::EngineStorage;

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "commit",
            "debit_snapshot_and_status_commit_together",
            debit_snapshot_and_status_commit_together(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "failing_write_aborts_whole_snapshot",
            failing_write_aborts_whole_snapshot(factory).await,
        ),
        TestResult::from_result(
            "commit",
            "next_move_body_preserved",
            next_move_body_preserved(factory).await,
        ),
    ]
}

/// The executor's atomic unit: debit + rollback snapshot + status change.
async fn debit_snapshot_and_status_commit_together<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_ledger(&storage, "m1", 100).await?;
    seed_next_move(&storage, "nm-1", "m1", None).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .update_ledger(&mut snap, "m1", 0, 85, None)
        .await
        .map_err(|e| format!("debit: {e}"))?;
    storage
        .insert_rollback_snapshot(&mut snap, make_rollback_snapshot("nm-1", "m1"))
        .await
        .map_err(|e| format!("snapshot: {e}"))?;
    storage
        .update_next_move(&mut snap, make_next_move("nm-1", "m1", "executing"), 0)
        .await
        .map_err(|e| format!("status: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let ledger = storage.get_ledger("m1").await.map_err(|e| format!("{e}"))?;
    let snapshot = storage
        .get_rollback_snapshot("nm-1")
        .await
        .map_err(|e| format!("{e}"))?;
    let next_move = storage
        .get_next_move("nm-1")
        .await
        .map_err(|e| format!("{e}"))?;
    if ledger.remaining != 85 {
        return Err(format!("expected remaining 85, got {}", ledger.remaining));
    }
    if snapshot.is_none() {
        return Err("rollback snapshot missing after commit".to_string());
    }
    if next_move.status != "executing" || next_move.version != 1 {
        return Err(format!(
            "expected executing@1, got {}@{}",
            next_move.status, next_move.version
        ));
    }
    Ok(())
}

/// A write that fails at commit time takes every other write down with it.
async fn failing_write_aborts_whole_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_ledger(&storage, "m1", 100).await?;
    seed_next_move(&storage, "nm-1", "m1", None).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .update_ledger(&mut snap, "m1", 0, 85, None)
        .await
        .map_err(|e| format!("debit: {e}"))?;
    storage
        .insert_rollback_snapshot(&mut snap, make_rollback_snapshot("nm-1", "m1"))
        .await
        .map_err(|e| format!("snapshot: {e}"))?;

    // Someone else moves the next move forward before we commit.
    {
        let mut other = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin other: {e}"))?;
        storage
            .update_next_move(&mut other, make_next_move("nm-1", "m1", "declined"), 0)
            .await
            .map_err(|e| format!("other update: {e}"))?;
        storage
            .commit_snapshot(other)
            .await
            .map_err(|e| format!("other commit: {e}"))?;
    }

    let staged = storage
        .update_next_move(&mut snap, make_next_move("nm-1", "m1", "executing"), 0)
        .await;
    let outcome = match staged {
        Err(e) => {
            let _ = storage.abort_snapshot(snap).await;
            Err(e)
        }
        Ok(_) => storage.commit_snapshot(snap).await,
    };
    match outcome {
        Err(e) if e.is_conflict() => {}
        Err(e) => return Err(format!("expected conflict, got {e}")),
        Ok(()) => return Err("stale status update committed".to_string()),
    }

    let ledger = storage.get_ledger("m1").await.map_err(|e| format!("{e}"))?;
    if ledger.remaining != 100 {
        return Err(format!(
            "debit leaked from aborted snapshot: remaining {}",
            ledger.remaining
        ));
    }
    let snapshot = storage
        .get_rollback_snapshot("nm-1")
        .await
        .map_err(|e| format!("{e}"))?;
    if snapshot.is_some() {
        return Err("rollback snapshot leaked from aborted snapshot".to_string());
    }
    Ok(())
}

async fn next_move_body_preserved<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut record = make_next_move("nm-1", "m1", "awaiting_approval");
    record.body = serde_json::json!({"nested": {"reasons": ["a", "b"]}, "ratio": "12.5"});

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_next_move(&mut snap, record.clone(), None)
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let stored = storage
        .get_next_move("nm-1")
        .await
        .map_err(|e| format!("{e}"))?;
    if stored.body != record.body || stored.opportunity_id != record.opportunity_id {
        return Err(format!("record not preserved: {stored:?}"));
    }
    Ok(())
}
