use std::future::Future;

use super::{make_ledger, seed_ledger, TestResult};
use crate::{EngineStorage, StorageError};

pub(super) async fn run_ledger_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    vec![
        TestResult::from_result(
            "ledger",
            "initialize_creates_full_balance",
            initialize_creates_full_balance(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "initialize_twice_returns_already_initialized",
            initialize_twice_returns_already_initialized(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "missing_ledger_returns_not_found",
            missing_ledger_returns_not_found(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "update_missing_ledger_returns_not_found",
            update_missing_ledger_returns_not_found(factory).await,
        ),
        TestResult::from_result(
            "ledger",
            "reset_timestamp_only_changes_when_given",
            reset_timestamp_only_changes_when_given(factory).await,
        ),
    ]
}

async fn initialize_creates_full_balance<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_ledger(&storage, "m1", 100).await?;

    let row = storage
        .get_ledger("m1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if row.remaining != 100 || row.monthly_limit != 100 {
        return Err(format!(
            "expected 100/100, got {}/{}",
            row.remaining, row.monthly_limit
        ));
    }
    if row.version != 0 {
        return Err(format!("expected version 0, got {}", row.version));
    }
    Ok(())
}

async fn initialize_twice_returns_already_initialized<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
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
    let result = storage
        .initialize_ledger(&mut snap, make_ledger("m1", 50))
        .await;
    let staged = match result {
        Err(StorageError::AlreadyInitialized { .. }) => return Ok(()),
        Err(e) => return Err(format!("expected AlreadyInitialized, got {e}")),
        Ok(()) => storage.commit_snapshot(snap).await,
    };
    match staged {
        Err(StorageError::AlreadyInitialized { .. }) => Ok(()),
        Err(e) => Err(format!("expected AlreadyInitialized at commit, got {e}")),
        Ok(()) => Err("duplicate ledger initialization was committed".to_string()),
    }
}

async fn missing_ledger_returns_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage.get_ledger("nobody").await {
        Err(StorageError::LedgerNotFound { merchant_id }) if merchant_id == "nobody" => Ok(()),
        Err(e) => Err(format!("expected LedgerNotFound, got {e}")),
        Ok(_) => Err("expected LedgerNotFound, got a row".to_string()),
    }
}

async fn update_missing_ledger_returns_not_found<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let result = storage.update_ledger(&mut snap, "nobody", 0, 10, None).await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::LedgerNotFound { .. }) => Ok(()),
        Err(e) => Err(format!("expected LedgerNotFound, got {e}")),
        Ok(_) => Err("update of a missing ledger succeeded".to_string()),
    }
}

async fn reset_timestamp_only_changes_when_given<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .update_ledger(&mut snap, "m1", 0, 90, None)
        .await
        .map_err(|e| format!("debit: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    let row = storage.get_ledger("m1").await.map_err(|e| format!("{e}"))?;
    if row.last_reset_at != "2025-01-01T00:00:00Z" {
        return Err(format!("last_reset_at changed to {}", row.last_reset_at));
    }

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .update_ledger(&mut snap, "m1", 1, 100, Some("2025-02-01T00:00:00Z"))
        .await
        .map_err(|e| format!("reset: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    let row = storage.get_ledger("m1").await.map_err(|e| format!("{e}"))?;
    if row.last_reset_at != "2025-02-01T00:00:00Z" || row.remaining != 100 {
        return Err(format!(
            "expected reset row, got remaining={} last_reset_at={}",
            row.remaining, row.last_reset_at
        ));
    }
    Ok(())
}
