//! Conformance test suite for `EngineStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any `EngineStorage`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Ledger**: row creation, duplicate detection, missing rows
//! - **Snapshot isolation**: uncommitted writes invisible, committed writes visible
//! - **Atomic commit**: all-or-nothing semantics for multi-record snapshots
//! - **Version validation / OCC**: optimistic concurrency conflict detection
//! - **Head compare-and-set**: one head next move per merchant
//! - **Rollback snapshots**: claim/release/delete lifecycle
//! - **Concurrency**: real parallel tasks racing on the same rows
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use nextmove_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_storage().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod commit;
mod concurrent;
mod head;
mod isolation;
mod ledger;
mod rollback;
mod version;

use std::fmt;
use std::future::Future;

use crate::record::{LedgerRecord, NextMoveRecord, RollbackSnapshotRecord};
use crate::EngineStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "ledger", "isolation", "commit").
    pub category: String,
    /// Test name (e.g. "initialize_creates_full_balance").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: EngineStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(ledger::run_ledger_tests(&factory).await);
    results.extend(isolation::run_isolation_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(version::run_version_tests(&factory).await);
    results.extend(head::run_head_tests(&factory).await);
    results.extend(rollback::run_rollback_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn make_ledger(merchant_id: &str, limit: i64) -> LedgerRecord {
    LedgerRecord {
        merchant_id: merchant_id.to_string(),
        monthly_limit: limit,
        remaining: limit,
        last_reset_at: "2025-01-01T00:00:00Z".to_string(),
        version: 0,
    }
}

fn make_next_move(id: &str, merchant_id: &str, status: &str) -> NextMoveRecord {
    NextMoveRecord {
        id: id.to_string(),
        merchant_id: merchant_id.to_string(),
        opportunity_id: format!("opp-{id}"),
        status: status.to_string(),
        version: 0,
        updated_at: "2025-01-01T00:00:00Z".to_string(),
        body: serde_json::json!({"id": id, "status": status}),
    }
}

fn make_rollback_snapshot(next_move_id: &str, merchant_id: &str) -> RollbackSnapshotRecord {
    RollbackSnapshotRecord {
        next_move_id: next_move_id.to_string(),
        merchant_id: merchant_id.to_string(),
        captured_at: "2025-01-01T00:00:00Z".to_string(),
        prior_state: serde_json::json!({"title": "Old title"}),
        consumed: false,
    }
}

/// Commit a fresh ledger row at full balance.
async fn seed_ledger<S: EngineStorage>(
    storage: &S,
    merchant_id: &str,
    limit: i64,
) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .initialize_ledger(&mut snap, make_ledger(merchant_id, limit))
        .await
        .map_err(|e| format!("init ledger: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit ledger: {e}"))
}

/// Commit a next move as the merchant's new head.
async fn seed_next_move<S: EngineStorage>(
    storage: &S,
    id: &str,
    merchant_id: &str,
    expected_head: Option<&str>,
) -> Result<(), String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_next_move(&mut snap, make_next_move(id, merchant_id, "ready"), expected_head)
        .await
        .map_err(|e| format!("insert next move: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit next move: {e}"))
}
