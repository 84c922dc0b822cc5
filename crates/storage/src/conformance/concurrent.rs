use std::future::Future;
use std::sync::Arc;

use super::{make_next_move, make_rollback_snapshot, seed_ledger, TestResult};
use crate::{EngineStorage, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "concurrent",
            "concurrent_debits_exactly_one_wins",
            concurrent_debits_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_head_inserts_exactly_one_wins",
            concurrent_head_inserts_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_claims_exactly_one_wins",
            concurrent_claims_exactly_one_wins(factory).await,
        ),
        TestResult::from_result(
            "concurrent",
            "concurrent_debits_different_merchants_all_succeed",
            concurrent_debits_different_merchants_all_succeed(factory).await,
        ),
    ]
}

/// Outcome of one racing task: `Ok(true)` won, `Ok(false)` lost cleanly.
fn tally(outcomes: Vec<Result<bool, String>>) -> Result<(usize, usize), String> {
    let mut winners = 0usize;
    let mut losers = 0usize;
    for outcome in outcomes {
        if outcome? {
            winners += 1;
        } else {
            losers += 1;
        }
    }
    Ok((winners, losers))
}

/// Stage `write`, then commit; a conflict at either point counts as a loss.
async fn race<S, W, WFut>(storage: Arc<S>, write: W) -> Result<bool, String>
where
    S: EngineStorage,
    W: FnOnce(Arc<S>, S::Snapshot) -> WFut,
    WFut: Future<Output = (S::Snapshot, Result<(), StorageError>)>,
{
    let snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let (snap, staged) = write(storage.clone(), snap).await;
    let result = match staged {
        Ok(()) => storage.commit_snapshot(snap).await,
        Err(e) => {
            let _ = storage.abort_snapshot(snap).await;
            Err(e)
        }
    };
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_conflict() => Ok(false),
        Err(StorageError::SnapshotConsumed { .. }) => Ok(false),
        Err(e) => Err(format!("storage error: {e}")),
    }
}

async fn join_all(
    handles: Vec<tokio::task::JoinHandle<Result<bool, String>>>,
) -> Result<Vec<Result<bool, String>>, String> {
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.map_err(|e| format!("task panic: {e}"))?);
    }
    Ok(outcomes)
}

/// N tasks each debit the same ledger from version 0. Exactly one commit
/// succeeds; the rest conflict. This is the double-spend guard.
async fn concurrent_debits_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    seed_ledger(storage.as_ref(), "m1", 20).await?;

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(race(s, |s, mut snap| async move {
            let r = s.update_ledger(&mut snap, "m1", 0, 5, None).await.map(|_| ());
            (snap, r)
        })));
    }
    let (winners, losers) = tally(join_all(handles).await?)?;
    if winners != 1 || losers != N - 1 {
        return Err(format!("expected 1 winner, got {winners} ({losers} losers)"));
    }

    let row = storage.get_ledger("m1").await.map_err(|e| format!("{e}"))?;
    if row.remaining != 5 || row.version != 1 {
        return Err(format!(
            "expected 5@1 after race, got {}@{}",
            row.remaining, row.version
        ));
    }
    Ok(())
}

/// N tasks each try to become the first head next move for the merchant.
async fn concurrent_head_inserts_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(race(s, move |s, mut snap| async move {
            let r = s
                .insert_next_move(&mut snap, make_next_move(&format!("nm-{i}"), "m1", "ready"), None)
                .await;
            (snap, r)
        })));
    }
    let (winners, _) = tally(join_all(handles).await?)?;
    if winners != 1 {
        return Err(format!("expected 1 head winner, got {winners}"));
    }
    let history = storage
        .list_next_moves("m1", 0)
        .await
        .map_err(|e| format!("{e}"))?;
    if history.len() != 1 {
        return Err(format!("expected 1 next move, got {}", history.len()));
    }
    Ok(())
}

/// N tasks each try to claim the same rollback snapshot.
async fn concurrent_claims_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    {
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        storage
            .insert_rollback_snapshot(&mut snap, make_rollback_snapshot("nm-1", "m1"))
            .await
            .map_err(|e| format!("insert: {e}"))?;
        storage
            .commit_snapshot(snap)
            .await
            .map_err(|e| format!("commit: {e}"))?;
    }

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(race(s, |s, mut snap| async move {
            let r = s
                .claim_rollback_snapshot(&mut snap, "nm-1")
                .await
                .map(|_| ());
            (snap, r)
        })));
    }
    let (winners, _) = tally(join_all(handles).await?)?;
    if winners != 1 {
        return Err(format!("expected 1 claim winner, got {winners}"));
    }
    Ok(())
}

async fn concurrent_debits_different_merchants_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    for i in 0..N {
        seed_ledger(storage.as_ref(), &format!("m{i}"), 20).await?;
    }

    // Different rows never conflict, but a backend with table-level
    // validation may still report a conflict; retry those.
    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let merchant = format!("m{i}");
            for _ in 0..N {
                let m = merchant.clone();
                let won = race(s.clone(), move |s, mut snap| async move {
                    let r = s.update_ledger(&mut snap, &m, 0, 5, None).await.map(|_| ());
                    (snap, r)
                })
                .await?;
                if won {
                    return Ok(true);
                }
            }
            Ok(false)
        }));
    }
    let (winners, _) = tally(join_all(handles).await?)?;
    if winners != N {
        return Err(format!("expected all {N} merchants debited, got {winners}"));
    }
    Ok(())
}
