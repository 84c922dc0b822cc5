//! Guarantees that must hold across the execution path: readiness is
//! re-checked, credits and snapshots move together, failures compensate.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{opportunity, Harness};
use nextmove_engine::{
    Collaborators, ConnectorError, Engine, EngineConfig, EngineError, InMemoryStorefront,
    ManualClock, NextMoveStatus, NextMoveView, NoRegression, Opportunity, PlanTier, Readiness,
    ReadinessGate, RiskLevel, StaticDirectory, StaticOpportunitySource, StaticReadiness,
    StorefrontConnector,
};
use nextmove_storage::{EngineStorage, InMemoryStorage};
use serde_json::Value;
use time::macros::datetime;
use time::Duration;

#[tokio::test]
async fn readiness_is_rechecked_right_before_execution() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Pro, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let ready = h.active("m1").await;
    assert_eq!(ready.status, NextMoveStatus::Ready);

    h.readiness.set("m1", Readiness::WarmingUp);
    let after = h.engine.execute(&ready.id).await.unwrap();
    assert_eq!(after.blocked_reason(), Some("store not ready: warming_up"));
    assert_eq!(h.storefront.apply_count(), 0);
    assert_eq!(h.remaining("m1").await, 100);
    assert!(after.executed_at.is_none());

    // The active move keeps its slot while the store is warming up.
    let view = h.engine.get_next_move("m1").await.unwrap();
    assert_eq!(view.next_move().map(|nm| nm.id.clone()), Some(ready.id.clone()));

    h.readiness.set("m1", Readiness::Ready);
    assert_eq!(h.active("m1").await.status, NextMoveStatus::Ready);
}

#[tokio::test]
async fn failed_execution_refunds_and_drops_the_snapshot() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Pro, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let ready = h.active("m1").await;

    h.storefront
        .fail_next_apply(ConnectorError::Unavailable("timeout".to_string()));
    let err = h.engine.execute(&ready.id).await.unwrap_err();
    let EngineError::ExecutionFailed {
        next_move,
        retryable,
        ..
    } = err
    else {
        panic!("expected an execution failure, got {:?}", err);
    };
    assert!(retryable);
    assert_eq!(
        next_move.blocked_reason(),
        Some("execution failed: storefront unavailable: timeout")
    );
    assert_eq!(next_move.execution_attempts, 1);
    assert!(!next_move.rollback_available);
    assert_eq!(h.remaining("m1").await, 100);
    assert!(h
        .storage
        .get_rollback_snapshot(&ready.id)
        .await
        .unwrap()
        .is_none());

    // Re-evaluated on the next cycle and retried.
    let retried = h.active("m1").await;
    assert_eq!(retried.id, ready.id);
    assert_eq!(retried.status, NextMoveStatus::Ready);
    let done = h.engine.execute(&ready.id).await.unwrap();
    assert_eq!(done.status, NextMoveStatus::Monitoring);
    assert_eq!(done.execution_attempts, 1);
    assert_eq!(h.remaining("m1").await, 85);
}

#[tokio::test]
async fn capture_failure_blocks_without_charging() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Pro, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let ready = h.active("m1").await;

    let failing = Harness::build_on(
        h.storage.clone(),
        EngineConfig::default(),
        h.storefront.clone(),
        Arc::new(CaptureFails),
    );
    failing.directory.set_plan("m1", PlanTier::Pro);
    failing.readiness.set("m1", Readiness::Ready);

    let err = failing.engine.execute(&ready.id).await.unwrap_err();
    assert!(matches!(err, EngineError::ExecutionFailed { .. }));
    let blocked = failing.engine.next_move(&ready.id).await.unwrap();
    assert!(blocked
        .blocked_reason()
        .unwrap()
        .starts_with("execution failed: could not capture prior state"));
    assert_eq!(failing.remaining("m1").await, 100);
    assert!(h
        .storage
        .get_rollback_snapshot(&ready.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn repeated_failures_give_up_and_free_the_slot() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Pro, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let first = h.active("m1").await;

    for attempt in 1..=3 {
        h.storefront
            .fail_next_apply(ConnectorError::Unavailable(format!("attempt {}", attempt)));
        let current = h.active("m1").await;
        assert_eq!(current.id, first.id);
        assert!(h.engine.execute(&first.id).await.is_err());
    }

    // Attempts exhausted: the move fails and a fresh one is selected.
    let next = h.active("m1").await;
    assert_ne!(next.id, first.id);
    let failed = h.engine.next_move(&first.id).await.unwrap();
    match &failed.status {
        NextMoveStatus::Failed { reason } => {
            assert!(reason.starts_with("gave up after 3 failed execution attempts"));
            assert!(reason.contains("attempt 3"));
        }
        other => panic!("expected failed, got {:?}", other),
    }
    assert!(failed.status.is_terminal());
    assert_eq!(h.remaining("m1").await, 100);
}

#[tokio::test]
async fn concurrent_selection_yields_one_move() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Starter, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);

    let (a, b) = tokio::join!(
        h.engine.get_next_move("m1"),
        h.engine.get_next_move("m1")
    );
    let a = a.unwrap().next_move().unwrap().id.clone();
    let b = b.unwrap().next_move().unwrap().id.clone();
    assert_eq!(a, b);
    assert_eq!(h.engine.history("m1").await.unwrap().len(), 1);
}

/// Records what storage looked like at the moment `apply` ran.
struct ApplyObserver {
    inner: Arc<InMemoryStorefront>,
    storage: Arc<InMemoryStorage>,
    seen: Mutex<Option<(String, bool, i64)>>,
}

#[async_trait]
impl StorefrontConnector for ApplyObserver {
    async fn capture(&self, merchant_id: &str, opp: &Opportunity) -> Result<Value, ConnectorError> {
        self.inner.capture(merchant_id, opp).await
    }

    async fn apply(&self, merchant_id: &str, opp: &Opportunity) -> Result<Value, ConnectorError> {
        let head = self.storage.head_next_move(merchant_id).await.unwrap().unwrap();
        let snapshot = self.storage.get_rollback_snapshot(&head.id).await.unwrap();
        let ledger = self.storage.get_ledger(merchant_id).await.unwrap();
        *self.seen.lock().unwrap() = Some((head.status, snapshot.is_some(), ledger.remaining));
        self.inner.apply(merchant_id, opp).await
    }

    async fn revert(
        &self,
        merchant_id: &str,
        opp: &Opportunity,
        prior: &Value,
    ) -> Result<(), ConnectorError> {
        self.inner.revert(merchant_id, opp, prior).await
    }
}

#[tokio::test]
async fn snapshot_and_debit_are_committed_before_the_mutation() {
    let storage = Arc::new(InMemoryStorage::new());
    let storefront = Arc::new(InMemoryStorefront::new());
    let observer = Arc::new(ApplyObserver {
        inner: storefront.clone(),
        storage: storage.clone(),
        seen: Mutex::new(None),
    });
    let h = Harness::build_on(storage, EngineConfig::default(), storefront, observer.clone());
    h.merchant("m1", PlanTier::Pro, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);

    let ready = h.active("m1").await;
    h.engine.execute(&ready.id).await.unwrap();

    let seen = observer.seen.lock().unwrap().clone();
    assert_eq!(seen, Some(("executing".to_string(), true, 85)));
}

#[tokio::test]
async fn unapproved_moves_expire_after_their_ttl() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Starter, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let waiting = h.active("m1").await;
    assert_eq!(waiting.status, NextMoveStatus::AwaitingApproval);

    h.clock.advance(Duration::days(6));
    assert_eq!(h.active("m1").await.id, waiting.id);

    h.clock.advance(Duration::days(1));
    let replacement = h.active("m1").await;
    assert_ne!(replacement.id, waiting.id);
    let expired = h.engine.next_move(&waiting.id).await.unwrap();
    assert_eq!(expired.status, NextMoveStatus::Expired);
    assert!(expired.expired_at.is_some());

    // An expired move can no longer be approved.
    let err = h.engine.approve(&waiting.id).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition(_)));
}

#[tokio::test]
async fn blocked_moves_expire_after_their_ttl() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Pro, 5, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let blocked = h.active("m1").await;
    assert_eq!(blocked.status.name(), "blocked");

    h.clock.advance(Duration::days(14));
    let view = h.engine.get_next_move("m1").await.unwrap();
    assert_ne!(view.next_move().unwrap().id, blocked.id);
    assert_eq!(
        h.engine.next_move(&blocked.id).await.unwrap().status,
        NextMoveStatus::Expired
    );
}

#[tokio::test]
async fn high_risk_always_needs_approval() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Enterprise, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::High)]);
    let nm = h.active("m1").await;
    assert_eq!(nm.status, NextMoveStatus::AwaitingApproval);

    // execute() refuses to bypass the approval.
    let refused = h.engine.execute(&nm.id).await;
    assert!(matches!(refused, Err(EngineError::IllegalTransition(_))));
    assert_eq!(h.storefront.apply_count(), 0);
}

#[tokio::test]
async fn approving_a_ready_move_is_illegal() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Pro, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let ready = h.active("m1").await;

    let err = h.engine.approve(&ready.id).await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalTransition(_)));
    assert_eq!(
        err.to_string(),
        "illegal transition: approve is not allowed from ready"
    );
    assert!(matches!(
        h.engine.decline(&ready.id).await,
        Err(EngineError::IllegalTransition(_))
    ));
}

#[tokio::test]
async fn no_selection_while_a_move_is_active() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Pro, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o2", 15, RiskLevel::Low)]);
    let first = h.active("m1").await;
    h.engine.execute(&first.id).await.unwrap();

    // A better-ranked opportunity arrives while the first is monitored.
    let mut better = opportunity("o1", 5, RiskLevel::Low);
    better.rank = 0;
    h.source.replace("m1", vec![better, opportunity("o2", 15, RiskLevel::Low)]);
    assert_eq!(h.active("m1").await.id, first.id);
    assert_eq!(h.engine.history("m1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn zero_retention_discards_the_snapshot_on_completion() {
    let mut config = EngineConfig::default();
    config.monitoring.post_completion_rollback_secs = 0;
    let h = Harness::with_config(config);
    h.merchant("m1", PlanTier::Pro, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let ready = h.active("m1").await;
    h.engine.execute(&ready.id).await.unwrap();

    h.clock.advance(Duration::hours(72));
    let completed = h.engine.observe(&ready.id).await.unwrap();
    assert_eq!(completed.status, NextMoveStatus::Completed);
    assert!(!completed.rollback_available);
    assert!(h
        .storage
        .get_rollback_snapshot(&ready.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn revert_failure_keeps_the_snapshot_for_a_retry() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Pro, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let ready = h.active("m1").await;
    h.engine.execute(&ready.id).await.unwrap();

    h.storefront
        .fail_next_revert(ConnectorError::Unavailable("502".to_string()));
    let err = h.engine.rollback(&ready.id).await.unwrap_err();
    assert!(matches!(err, EngineError::RollbackFailed { .. }));
    let record = h
        .storage
        .get_rollback_snapshot(&ready.id)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.consumed);
    assert_eq!(
        h.engine.next_move(&ready.id).await.unwrap().status,
        NextMoveStatus::Monitoring
    );

    assert!(matches!(
        h.engine.rollback(&ready.id).await.unwrap(),
        nextmove_engine::RollbackOutcome::Reverted { .. }
    ));
}

#[tokio::test]
async fn rollback_of_an_unexecuted_move_has_no_snapshot() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Starter, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let waiting = h.active("m1").await;
    assert_eq!(
        h.engine.rollback(&waiting.id).await.unwrap(),
        nextmove_engine::RollbackOutcome::NoSnapshot
    );
    assert!(matches!(
        h.engine.rollback("nm-missing").await,
        Err(EngineError::NotFound(_))
    ));
    let view = h.engine.get_next_move("m1").await.unwrap();
    assert!(matches!(view, NextMoveView::Active { ref next_move } if next_move.id == waiting.id));
}

/// Connector whose `capture` always fails.
struct CaptureFails;

#[async_trait]
impl StorefrontConnector for CaptureFails {
    async fn capture(&self, _: &str, _: &Opportunity) -> Result<Value, ConnectorError> {
        Err(ConnectorError::Unavailable("read timeout".to_string()))
    }

    async fn apply(&self, _: &str, _: &Opportunity) -> Result<Value, ConnectorError> {
        panic!("apply must not run without a captured prior state");
    }

    async fn revert(&self, _: &str, _: &Opportunity, _: &Value) -> Result<(), ConnectorError> {
        Ok(())
    }
}

#[tokio::test]
async fn approval_is_still_required_after_a_block() {
    let h = Harness::new();
    h.merchant("m1", PlanTier::Starter, 100, Readiness::Ready).await;
    h.source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let waiting = h.active("m1").await;
    assert_eq!(waiting.status, NextMoveStatus::AwaitingApproval);

    h.readiness.set("m1", Readiness::WarmingUp);
    let blocked = h.active("m1").await;
    assert_eq!(blocked.blocked_reason(), Some("store not ready: warming_up"));

    // The gate would now allow auto-execution, but nobody approved.
    h.directory.set_plan("m1", PlanTier::Pro);
    h.readiness.set("m1", Readiness::Ready);
    let back = h.active("m1").await;
    assert_eq!(back.status, NextMoveStatus::AwaitingApproval);
    assert!(matches!(
        h.engine.execute(&waiting.id).await,
        Err(EngineError::IllegalTransition(_))
    ));
    assert_eq!(h.remaining("m1").await, 100);

    let done = h.engine.approve(&waiting.id).await.unwrap();
    assert_eq!(done.status, NextMoveStatus::Monitoring);
    assert!(!done.approval_pending);
}

/// Counts readiness queries on top of a static gate.
struct CountingReadiness {
    inner: StaticReadiness,
    queries: AtomicUsize,
}

#[async_trait]
impl ReadinessGate for CountingReadiness {
    async fn readiness(&self, merchant_id: &str) -> Readiness {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.readiness(merchant_id).await
    }
}

#[tokio::test]
async fn next_move_lookup_queries_readiness_once() {
    let readiness = Arc::new(CountingReadiness {
        inner: StaticReadiness::new(Readiness::Ready),
        queries: AtomicUsize::new(0),
    });
    let directory = Arc::new(StaticDirectory::new());
    directory.set_plan("m1", PlanTier::Pro);
    let source = Arc::new(StaticOpportunitySource::new());
    source.replace("m1", vec![opportunity("o1", 15, RiskLevel::Low)]);
    let parts = Collaborators {
        source,
        readiness: readiness.clone(),
        directory,
        connector: Arc::new(InMemoryStorefront::new()),
        signal: Arc::new(NoRegression),
        clock: Arc::new(ManualClock::new(datetime!(2026-10-01 09:00 UTC))),
    };
    let engine = Engine::new(Arc::new(InMemoryStorage::new()), parts, EngineConfig::default());
    engine.ledger().open("m1", 100).await.unwrap();

    let selected = engine.get_next_move("m1").await.unwrap();
    assert!(selected.next_move().is_some());
    assert_eq!(readiness.queries.load(Ordering::SeqCst), 1);

    let refreshed = engine.get_next_move("m1").await.unwrap();
    assert_eq!(refreshed.next_move(), selected.next_move());
    assert_eq!(readiness.queries.load(Ordering::SeqCst), 2);
}
