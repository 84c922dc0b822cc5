use std::future::Future;

use super::{make_next_move, seed_next_move, TestResult};
use crate::{EngineStorage, StorageError};

pub(super) async fn run_head_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "head",
            "insert_becomes_head",
            insert_becomes_head(factory).await,
        ),
        TestResult::from_result(
            "head",
            "insert_with_stale_head_returns_head_moved",
            insert_with_stale_head_returns_head_moved(factory).await,
        ),
        TestResult::from_result(
            "head",
            "history_lists_newest_first",
            history_lists_newest_first(factory).await,
        ),
        TestResult::from_result(
            "head",
            "prune_keeps_newest_and_head",
            prune_keeps_newest_and_head(factory).await,
        ),
        TestResult::from_result(
            "head",
            "merchants_are_independent",
            merchants_are_independent(factory).await,
        ),
    ]
}

async fn insert_becomes_head<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_next_move(&storage, "nm-1", "m1", None).await?;
    seed_next_move(&storage, "nm-2", "m1", Some("nm-1")).await?;

    match storage.head_next_move("m1").await {
        Ok(Some(r)) if r.id == "nm-2" => Ok(()),
        Ok(other) => Err(format!("expected head nm-2, got {other:?}")),
        Err(e) => Err(format!("head: {e}")),
    }
}

async fn insert_with_stale_head_returns_head_moved<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .insert_next_move(&mut snap, make_next_move("nm-2", "m1", "ready"), None)
        .await;
    let outcome = match staged {
        Err(e) => {
            let _ = storage.abort_snapshot(snap).await;
            Err(e)
        }
        Ok(()) => storage.commit_snapshot(snap).await,
    };
    match outcome {
        Err(StorageError::HeadMoved { found, .. }) if found.as_deref() == Some("nm-1") => Ok(()),
        Err(e) => Err(format!("expected HeadMoved(found nm-1), got {e}")),
        Ok(()) => Err("second head inserted without seeing the first".to_string()),
    }
}

async fn history_lists_newest_first<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_next_move(&storage, "nm-1", "m1", None).await?;
    seed_next_move(&storage, "nm-2", "m1", Some("nm-1")).await?;
    seed_next_move(&storage, "nm-3", "m1", Some("nm-2")).await?;

    let all = storage
        .list_next_moves("m1", 0)
        .await
        .map_err(|e| format!("{e}"))?;
    let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
    if ids != ["nm-3", "nm-2", "nm-1"] {
        return Err(format!("expected newest first, got {ids:?}"));
    }
    let limited = storage
        .list_next_moves("m1", 2)
        .await
        .map_err(|e| format!("{e}"))?;
    if limited.len() != 2 || limited[0].id != "nm-3" {
        return Err(format!("limit not applied: {} records", limited.len()));
    }
    Ok(())
}

async fn prune_keeps_newest_and_head<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_next_move(&storage, "nm-1", "m1", None).await?;
    seed_next_move(&storage, "nm-2", "m1", Some("nm-1")).await?;
    seed_next_move(&storage, "nm-3", "m1", Some("nm-2")).await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let removed = storage
        .prune_next_moves(&mut snap, "m1", 2)
        .await
        .map_err(|e| format!("prune: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    if removed != 1 {
        return Err(format!("expected 1 pruned, got {removed}"));
    }
    if storage.get_next_move("nm-1").await.is_ok() {
        return Err("oldest next move survived prune".to_string());
    }
    match storage.head_next_move("m1").await {
        Ok(Some(r)) if r.id == "nm-3" => Ok(()),
        other => Err(format!("head changed by prune: {other:?}")),
    }
}

async fn merchants_are_independent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_next_move(&storage, "nm-a", "m1", None).await?;
    seed_next_move(&storage, "nm-b", "m2", None).await?;

    let merchants = storage.list_merchants().await.map_err(|e| format!("{e}"))?;
    if merchants != ["m1", "m2"] {
        return Err(format!("expected [m1, m2], got {merchants:?}"));
    }
    let m2 = storage
        .list_next_moves("m2", 0)
        .await
        .map_err(|e| format!("{e}"))?;
    if m2.len() != 1 || m2[0].id != "nm-b" {
        return Err(format!("m2 history polluted: {m2:?}"));
    }
    Ok(())
}
