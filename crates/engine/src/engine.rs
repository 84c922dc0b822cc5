//! The engine facade: the operations exposed to the scheduler and the API.

use std::collections::BTreeSet;
use std::sync::Arc;

use nextmove_storage::{EngineStorage, StorageError};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::authorization::{AuthorizationGate, AuthorizationInput, Verdict};
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::connector::StorefrontConnector;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::ledger::{Balance, CreditLedger};
use crate::monitor::{MonitorDecision, MonitoringLoop, RegressionSignal};
use crate::next_move::NextMove;
use crate::persist::{self, MAX_CONFLICT_RETRIES};
use crate::readiness::{confirm_ready, Readiness, ReadinessGate, ReadyStore};
use crate::rollback::{RollbackManager, RollbackOutcome};
use crate::selector;
use crate::source::{MerchantDirectory, OpportunitySource};
use crate::status::{NextMoveStatus, RollbackTrigger, Transition};
use crate::types::PlanTier;

/// What `get_next_move` shows a merchant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextMoveView {
    /// The store cannot be acted on; show readiness instead of a move.
    StoreNotReady { readiness: Readiness },
    /// Nothing worth doing this cycle.
    NoAction,
    /// The merchant's current move.
    Active { next_move: NextMove },
}

impl NextMoveView {
    pub fn next_move(&self) -> Option<&NextMove> {
        match self {
            NextMoveView::Active { next_move } => Some(next_move),
            _ => None,
        }
    }
}

/// External collaborators the engine consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn OpportunitySource>,
    pub readiness: Arc<dyn ReadinessGate>,
    pub directory: Arc<dyn MerchantDirectory>,
    pub connector: Arc<dyn StorefrontConnector>,
    pub signal: Arc<dyn RegressionSignal>,
    pub clock: Arc<dyn Clock>,
}

/// Recommendation and execution engine over a storage backend.
pub struct Engine<S: EngineStorage> {
    storage: Arc<S>,
    parts: Collaborators,
    config: EngineConfig,
    gate: AuthorizationGate,
    ledger: CreditLedger<S>,
    executor: Executor<S>,
    rollback: RollbackManager<S>,
    monitor: MonitoringLoop,
}

impl<S: EngineStorage> Engine<S> {
    pub fn new(storage: Arc<S>, parts: Collaborators, config: EngineConfig) -> Self {
        let ledger = CreditLedger::new(Arc::clone(&storage), Arc::clone(&parts.clock));
        let monitor = MonitoringLoop::new(config.monitoring_window());
        let executor = Executor::new(
            Arc::clone(&storage),
            ledger.clone(),
            Arc::clone(&parts.connector),
            Arc::clone(&parts.clock),
            monitor,
        );
        let rollback = RollbackManager::new(
            Arc::clone(&storage),
            Arc::clone(&parts.connector),
            Arc::clone(&parts.clock),
        );
        Self {
            gate: AuthorizationGate::new(&config.plans),
            storage,
            parts,
            config,
            ledger,
            executor,
            rollback,
            monitor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &CreditLedger<S> {
        &self.ledger
    }

    pub fn directory(&self) -> &Arc<dyn MerchantDirectory> {
        &self.parts.directory
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub async fn next_move(&self, next_move_id: &str) -> Result<NextMove, EngineError> {
        persist::load(&*self.storage, next_move_id).await
    }

    /// Retained next moves for a merchant, newest first.
    pub async fn history(&self, merchant_id: &str) -> Result<Vec<NextMove>, EngineError> {
        persist::history(&*self.storage, merchant_id, self.config.selection.history_limit).await
    }

    pub async fn credits(&self, merchant_id: &str) -> Result<Balance, EngineError> {
        self.ledger.balance(merchant_id).await
    }

    // ── getNextMove ──────────────────────────────────────────────────────

    /// The merchant's current next move, selecting a new one if the slot is
    /// free.
    ///
    /// An active move is returned after housekeeping (expiry, give-up) and
    /// re-authorization. A new move is only selected once the previous one
    /// is terminal, and only while the store is ready.
    pub async fn get_next_move(&self, merchant_id: &str) -> Result<NextMoveView, EngineError> {
        let plan = self.plan_tier(merchant_id).await?;
        let gate = confirm_ready(&*self.parts.readiness, merchant_id).await;
        let readiness = match &gate {
            Ok(_) => Readiness::Ready,
            Err(readiness) => *readiness,
        };

        for _ in 0..MAX_CONFLICT_RETRIES {
            let head = persist::head(&*self.storage, merchant_id).await?;
            if let Some(current) = &head {
                if current.status.is_active() {
                    if let Some(active) = self.refresh(current.clone(), plan, readiness).await? {
                        return Ok(NextMoveView::Active { next_move: active });
                    }
                }
            }

            let store = match &gate {
                Ok(store) => store,
                Err(readiness) => {
                    return Ok(NextMoveView::StoreNotReady {
                        readiness: *readiness,
                    })
                }
            };

            // Housekeeping may have moved the head; select against the latest.
            let head_id = persist::head(&*self.storage, merchant_id)
                .await?
                .map(|nm| nm.id);
            match self.select(store, plan, head_id.as_deref()).await {
                Ok(view) => return Ok(view),
                // Another request selected first; show that one.
                Err(EngineError::Storage(StorageError::HeadMoved { .. })) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::Conflict(format!("merchant/{}", merchant_id)))
    }

    /// Recover a stalled execution, expire or give up on a stale move,
    /// otherwise re-authorize it. `None` when the move became terminal and
    /// the slot is free.
    async fn refresh(
        &self,
        mut current: NextMove,
        plan: PlanTier,
        readiness: Readiness,
    ) -> Result<Option<NextMove>, EngineError> {
        let now = self.parts.clock.now();
        if current.status == NextMoveStatus::Executing {
            let started = current.execution_started_at.unwrap_or(current.selected_at);
            let timeout = self.config.executing_timeout();
            if now - started < timeout {
                return Ok(Some(current));
            }
            current = self.executor.abandon(current, timeout).await?;
        }

        // An abandoned execution keeps its snapshot until the storefront
        // is restored; until then the move stays blocked.
        if matches!(current.status, NextMoveStatus::Blocked { .. })
            && self
                .storage
                .get_rollback_snapshot(&current.id)
                .await?
                .is_some()
            && !self.rollback.restore_orphan(&current).await?
        {
            return Ok(Some(current));
        }

        if let Some(event) = self.housekeeping_event(&current, now) {
            let from = current.status.name();
            current.transition(event, now)?;
            persist::save(&*self.storage, &mut current, now).await?;
            info!(
                merchant_id = %current.merchant_id,
                next_move_id = %current.id,
                from,
                to = current.status.name(),
                "stale next move closed"
            );
            return Ok(None);
        }

        match current.status {
            NextMoveStatus::Ready
            | NextMoveStatus::AwaitingApproval
            | NextMoveStatus::Blocked { .. } => {
                let verdict = self.authorize(&current, plan, readiness).await?;
                self.apply_verdict(&mut current, verdict, now).await?;
            }
            _ => {}
        }
        Ok(Some(current))
    }

    fn housekeeping_event(&self, next_move: &NextMove, now: OffsetDateTime) -> Option<Transition> {
        let age = now - next_move.selected_at;
        match &next_move.status {
            NextMoveStatus::Blocked { .. }
                if next_move.execution_attempts >= self.config.selection.max_execution_attempts =>
            {
                Some(Transition::GiveUp {
                    reason: format!(
                        "gave up after {} failed execution attempts: {}",
                        next_move.execution_attempts,
                        next_move.last_error.as_deref().unwrap_or("unknown error")
                    ),
                })
            }
            NextMoveStatus::Blocked { .. } if age >= self.config.blocked_ttl() => {
                Some(Transition::Expire)
            }
            NextMoveStatus::Ready | NextMoveStatus::AwaitingApproval
                if age >= self.config.approval_ttl() =>
            {
                Some(Transition::Expire)
            }
            _ => None,
        }
    }

    async fn select(
        &self,
        store: &ReadyStore,
        plan: PlanTier,
        head_id: Option<&str>,
    ) -> Result<NextMoveView, EngineError> {
        let merchant_id = store.merchant_id();
        let opportunities = self.parts.source.opportunities(merchant_id).await?;
        let exclude = self.excluded_opportunities(merchant_id).await?;
        let Some(opportunity) = selector::select_next(store, &opportunities, &exclude) else {
            debug!(merchant_id, candidates = opportunities.len(), "no action this cycle");
            return Ok(NextMoveView::NoAction);
        };

        let balance = self.remaining_credits(merchant_id).await?;
        let verdict = self.gate.evaluate(
            opportunity,
            AuthorizationInput {
                plan,
                readiness: Readiness::Ready,
                balance,
            },
        );
        let now = self.parts.clock.now();
        let mut next_move = NextMove::select(
            new_next_move_id(),
            merchant_id,
            opportunity.clone(),
            verdict,
            now,
        );

        let mut snapshot = self.storage.begin_snapshot().await?;
        let record = match next_move.to_record(now) {
            Ok(record) => record,
            Err(e) => {
                let _ = self.storage.abort_snapshot(snapshot).await;
                return Err(e);
            }
        };
        if let Err(e) = self
            .storage
            .insert_next_move(&mut snapshot, record, head_id)
            .await
        {
            let _ = self.storage.abort_snapshot(snapshot).await;
            return Err(e.into());
        }
        if let Err(e) = self
            .storage
            .prune_next_moves(&mut snapshot, merchant_id, self.config.selection.history_limit)
            .await
        {
            let _ = self.storage.abort_snapshot(snapshot).await;
            return Err(e.into());
        }
        self.storage.commit_snapshot(snapshot).await?;
        next_move.version = 0;

        info!(
            merchant_id,
            next_move_id = %next_move.id,
            opportunity_id = %next_move.opportunity.id,
            to = next_move.status.name(),
            credits = next_move.opportunity.credit_cost,
            "next move selected"
        );
        Ok(NextMoveView::Active { next_move })
    }

    /// Opportunity ids that already ran to completion, were declined or
    /// were rolled back are not proposed again.
    async fn excluded_opportunities(&self, merchant_id: &str) -> Result<BTreeSet<String>, EngineError> {
        let history = self.history(merchant_id).await?;
        Ok(history
            .into_iter()
            .filter(|nm| {
                matches!(
                    nm.status,
                    NextMoveStatus::Completed
                        | NextMoveStatus::Declined
                        | NextMoveStatus::RolledBack { .. }
                )
            })
            .map(|nm| nm.opportunity.id)
            .collect())
    }

    // ── approve / decline / execute ──────────────────────────────────────

    /// Merchant sign-off on an `awaiting_approval` move; executes it.
    pub async fn approve(&self, next_move_id: &str) -> Result<NextMove, EngineError> {
        self.start(next_move_id, Transition::Approve).await
    }

    /// Run a `ready` move. Invoked by the scheduler or the UI.
    pub async fn execute(&self, next_move_id: &str) -> Result<NextMove, EngineError> {
        self.start(next_move_id, Transition::AutoExecute).await
    }

    /// Dismiss an `awaiting_approval` move. No credits or snapshots are
    /// touched.
    pub async fn decline(&self, next_move_id: &str) -> Result<NextMove, EngineError> {
        let mut next_move = persist::load(&*self.storage, next_move_id).await?;
        let now = self.parts.clock.now();
        next_move.transition(Transition::Decline, now)?;
        persist::save(&*self.storage, &mut next_move, now).await?;
        info!(
            merchant_id = %next_move.merchant_id,
            next_move_id,
            from = "awaiting_approval",
            to = "declined",
            "next move declined"
        );
        Ok(next_move)
    }

    /// Re-validate readiness and authorization right before the move enters
    /// `executing`; anything short of a pass leaves it re-blocked or
    /// awaiting approval instead.
    async fn start(&self, next_move_id: &str, event: Transition) -> Result<NextMove, EngineError> {
        let mut next_move = persist::load(&*self.storage, next_move_id).await?;
        next_move.status.apply(event.clone())?;

        let merchant_id = next_move.merchant_id.clone();
        let plan = self.plan_tier(&merchant_id).await?;
        let now = self.parts.clock.now();

        let store = match confirm_ready(&*self.parts.readiness, &merchant_id).await {
            Ok(store) => store,
            Err(readiness) => {
                let verdict = Verdict::Blocked {
                    reason: format!("store not ready: {}", readiness),
                };
                self.apply_verdict(&mut next_move, verdict, now).await?;
                return Ok(next_move);
            }
        };

        let verdict = self.authorize(&next_move, plan, Readiness::Ready).await?;
        let proceed = match (&event, &verdict) {
            (_, Verdict::Blocked { .. }) => false,
            (Transition::AutoExecute, Verdict::AwaitingApproval) => false,
            _ => true,
        };
        if !proceed {
            self.apply_verdict(&mut next_move, verdict, now).await?;
            return Ok(next_move);
        }

        self.executor.run(&store, next_move, event).await
    }

    // ── rollback / monitoring ────────────────────────────────────────────

    /// Merchant-requested rollback. A move still `executing` yields
    /// [`RollbackOutcome::InProgress`].
    pub async fn rollback(&self, next_move_id: &str) -> Result<RollbackOutcome, EngineError> {
        let outcome = self
            .rollback
            .revert(next_move_id, RollbackTrigger::Manual)
            .await?;
        if matches!(outcome, RollbackOutcome::Reverted { .. }) {
            self.parts.signal.settle(next_move_id);
        }
        Ok(outcome)
    }

    /// One monitoring step for a move: consult the regression signal and
    /// complete, revert or keep watching. Moves not in `monitoring` are
    /// returned unchanged.
    pub async fn observe(&self, next_move_id: &str) -> Result<NextMove, EngineError> {
        let mut next_move = persist::load(&*self.storage, next_move_id).await?;
        if next_move.status != NextMoveStatus::Monitoring {
            return Ok(next_move);
        }

        let observation = self.parts.signal.observe(&next_move).await;
        let now = self.parts.clock.now();
        match self.monitor.decide(&next_move, &observation, now) {
            MonitorDecision::KeepWatching { deadline } => {
                debug!(next_move_id, %deadline, "still monitoring");
                Ok(next_move)
            }
            MonitorDecision::Complete => {
                next_move.transition(Transition::Stabilized, now)?;
                persist::save(&*self.storage, &mut next_move, now).await?;
                info!(
                    merchant_id = %next_move.merchant_id,
                    next_move_id,
                    from = "monitoring",
                    to = "completed",
                    "monitoring window closed without regression"
                );
                self.parts.signal.settle(next_move_id);
                if self.config.monitoring.post_completion_rollback_secs == 0 {
                    self.rollback.discard(&mut next_move).await?;
                }
                Ok(next_move)
            }
            MonitorDecision::Revert { reason } => {
                info!(next_move_id, %reason, "regression detected; rolling back");
                let outcome = self
                    .rollback
                    .revert(next_move_id, RollbackTrigger::Regression)
                    .await?;
                self.parts.signal.settle(next_move_id);
                match outcome {
                    RollbackOutcome::Reverted { next_move } => Ok(next_move),
                    RollbackOutcome::NoSnapshot
                    | RollbackOutcome::AlreadyReverted
                    | RollbackOutcome::InProgress => {
                        persist::load(&*self.storage, next_move_id).await
                    }
                }
            }
        }
    }

    /// Observe the merchant's head move if it is being monitored.
    pub async fn monitor_merchant(&self, merchant_id: &str) -> Result<Option<NextMove>, EngineError> {
        match persist::head(&*self.storage, merchant_id).await? {
            Some(head) if head.status == NextMoveStatus::Monitoring => {
                self.observe(&head.id).await.map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Discard rollback snapshots whose post-completion window has passed.
    pub async fn sweep(&self, merchant_id: &str) -> Result<usize, EngineError> {
        self.rollback
            .sweep(merchant_id, self.config.post_completion_retention())
            .await
    }

    // ── helpers ──────────────────────────────────────────────────────────

    async fn plan_tier(&self, merchant_id: &str) -> Result<PlanTier, EngineError> {
        self.parts
            .directory
            .plan_tier(merchant_id)
            .await
            .ok_or_else(|| EngineError::UnknownMerchant(merchant_id.to_string()))
    }

    /// A merchant without a ledger row has no credits to spend.
    async fn remaining_credits(&self, merchant_id: &str) -> Result<u32, EngineError> {
        match self.ledger.balance(merchant_id).await {
            Ok(balance) => Ok(balance.remaining),
            Err(EngineError::Storage(StorageError::LedgerNotFound { .. })) => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn authorize(
        &self,
        next_move: &NextMove,
        plan: PlanTier,
        readiness: Readiness,
    ) -> Result<Verdict, EngineError> {
        let balance = self.remaining_credits(&next_move.merchant_id).await?;
        Ok(self.gate.evaluate(
            &next_move.opportunity,
            AuthorizationInput {
                plan,
                readiness,
                balance,
            },
        ))
    }

    /// Record a re-authorization result if it changes the status.
    async fn apply_verdict(
        &self,
        next_move: &mut NextMove,
        verdict: Verdict,
        now: OffsetDateTime,
    ) -> Result<(), EngineError> {
        let from = next_move.status.name();
        if next_move.transition(Transition::Authorized(verdict), now)? {
            persist::save(&*self.storage, next_move, now).await?;
            info!(
                merchant_id = %next_move.merchant_id,
                next_move_id = %next_move.id,
                from,
                to = next_move.status.name(),
                reason = next_move.blocked_reason().unwrap_or(""),
                "next move re-authorized"
            );
        }
        Ok(())
    }
}

fn new_next_move_id() -> String {
    format!("nm-{:016x}", rand::random::<u64>())
}
