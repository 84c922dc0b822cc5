//! Action executor.
//!
//! Ordering for a move entering `executing`:
//!
//! 1. capture the prior storefront state (nothing charged yet)
//! 2. in one snapshot: debit credits, store the rollback snapshot, mark
//!    the move `executing`; commit
//! 3. call the storefront mutation
//! 4. success: mark `monitoring` with a deadline
//! 5. failure: in one snapshot refund credits, drop the rollback snapshot,
//!    block the move with the cause; then report the failure
//!
//! Step 2 is all-or-nothing, so a merchant is never charged for an action
//! that did not start, and no mutation runs without a snapshot behind it.
//!
//! A run that never reports back (cancelled request, crash) leaves the move
//! `executing`. Once `selection.executing_timeout_secs` has passed,
//! [`Executor::abandon`] refunds and blocks it; the storefront is restored
//! from the kept snapshot. A run identifies its own attempt by
//! `execution_attempts`, which every exit from `executing` but `applied`
//! increments, so a late result never settles a move it no longer owns.

use std::sync::Arc;

use nextmove_storage::{EngineStorage, RollbackSnapshotRecord};
use serde_json::Value;
use time::Duration;
use tracing::{debug, info, warn};

use crate::authorization::Verdict;
use crate::clock::{iso8601, Clock};
use crate::connector::{ConnectorError, StorefrontConnector};
use crate::error::EngineError;
use crate::ledger::{CreditLedger, DebitOutcome};
use crate::monitor::MonitoringLoop;
use crate::next_move::NextMove;
use crate::persist::{self, MAX_CONFLICT_RETRIES};
use crate::readiness::ReadyStore;
use crate::status::{NextMoveStatus, Transition};

pub(crate) struct Executor<S: EngineStorage> {
    storage: Arc<S>,
    ledger: CreditLedger<S>,
    connector: Arc<dyn StorefrontConnector>,
    clock: Arc<dyn Clock>,
    monitor: MonitoringLoop,
}

impl<S: EngineStorage> Executor<S> {
    pub(crate) fn new(
        storage: Arc<S>,
        ledger: CreditLedger<S>,
        connector: Arc<dyn StorefrontConnector>,
        clock: Arc<dyn Clock>,
        monitor: MonitoringLoop,
    ) -> Self {
        Self {
            storage,
            ledger,
            connector,
            clock,
            monitor,
        }
    }

    /// Drive an authorized move through `executing` into `monitoring`.
    ///
    /// `start` is [`Transition::AutoExecute`] for a ready move or
    /// [`Transition::Approve`] for an approved one. The caller must have
    /// re-validated authorization just before; `store` proves readiness.
    pub(crate) async fn run(
        &self,
        store: &ReadyStore,
        mut next_move: NextMove,
        start: Transition,
    ) -> Result<NextMove, EngineError> {
        debug_assert_eq!(store.merchant_id(), next_move.merchant_id);
        next_move.status.apply(start.clone())?;

        let merchant_id = next_move.merchant_id.clone();
        let prior_state = match self
            .connector
            .capture(&merchant_id, &next_move.opportunity)
            .await
        {
            Ok(state) => state,
            Err(cause) => return self.fail_before_start(next_move, cause).await,
        };

        let now = self.clock.now();
        let from = next_move.status.name();
        let cost = next_move.opportunity.credit_cost;
        let mut snapshot = self.storage.begin_snapshot().await?;

        match self.ledger.stage_debit(&mut snapshot, &merchant_id, cost).await {
            Ok(DebitOutcome::Debited { remaining }) => {
                debug!(merchant_id = %merchant_id, next_move_id = %next_move.id, credits = cost, remaining, "credits reserved");
            }
            Ok(DebitOutcome::InsufficientBalance {
                remaining,
                required,
            }) => {
                let _ = self.storage.abort_snapshot(snapshot).await;
                let reason = format!(
                    "insufficient credits: {} remaining, {} required",
                    remaining, required
                );
                next_move.transition(Transition::Authorized(Verdict::Blocked { reason }), now)?;
                persist::save(&*self.storage, &mut next_move, now).await?;
                info!(merchant_id = %merchant_id, next_move_id = %next_move.id, from, to = "blocked", "balance changed before debit");
                return Ok(next_move);
            }
            Err(e) => {
                let _ = self.storage.abort_snapshot(snapshot).await;
                return Err(e);
            }
        }

        let rollback = RollbackSnapshotRecord {
            next_move_id: next_move.id.clone(),
            merchant_id: merchant_id.clone(),
            captured_at: iso8601(now),
            prior_state: prior_state.clone(),
            consumed: false,
        };
        if let Err(e) = self
            .storage
            .insert_rollback_snapshot(&mut snapshot, rollback)
            .await
        {
            let _ = self.storage.abort_snapshot(snapshot).await;
            return Err(e.into());
        }

        if let Err(e) = next_move.transition(start, now) {
            let _ = self.storage.abort_snapshot(snapshot).await;
            return Err(e.into());
        }
        let version =
            match persist::stage_update(&*self.storage, &mut snapshot, &next_move, now).await {
                Ok(version) => version,
                Err(e) => {
                    let _ = self.storage.abort_snapshot(snapshot).await;
                    return Err(e);
                }
            };
        self.storage.commit_snapshot(snapshot).await?;
        next_move.version = version;
        let attempt = next_move.execution_attempts;
        info!(
            merchant_id = %merchant_id,
            next_move_id = %next_move.id,
            from,
            to = "executing",
            credits = cost,
            "credits debited and rollback snapshot stored"
        );

        match self
            .connector
            .apply(&merchant_id, &next_move.opportunity)
            .await
        {
            Ok(receipt) => {
                debug!(next_move_id = %next_move.id, %receipt, "storefront change applied");
                self.enter_monitoring(next_move, attempt, &prior_state).await
            }
            Err(cause) => self.compensate(next_move, attempt, cause).await,
        }
    }

    async fn enter_monitoring(
        &self,
        mut current: NextMove,
        attempt: u32,
        prior_state: &Value,
    ) -> Result<NextMove, EngineError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            if !owns_execution(&current, attempt) {
                return self.undo_late_apply(current, prior_state).await;
            }
            let now = self.clock.now();
            let mut updated = current.clone();
            updated.transition(Transition::Applied, now)?;
            updated.monitoring_deadline = Some(self.monitor.deadline_from(now));
            match persist::save(&*self.storage, &mut updated, now).await {
                Ok(()) => {
                    info!(
                        merchant_id = %updated.merchant_id,
                        next_move_id = %updated.id,
                        from = "executing",
                        to = "monitoring",
                        "execution succeeded"
                    );
                    return Ok(updated);
                }
                Err(e) if persist::is_conflict(&e) => {
                    current = persist::load(&*self.storage, &current.id).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(EngineError::Conflict(format!("next_move/{}", current.id)))
    }

    /// The move was abandoned while the mutation was in flight and its
    /// credits were refunded, so the change that just landed must not stay.
    async fn undo_late_apply(
        &self,
        current: NextMove,
        prior_state: &Value,
    ) -> Result<NextMove, EngineError> {
        if let Err(cause) = self
            .connector
            .revert(&current.merchant_id, &current.opportunity, prior_state)
            .await
        {
            warn!(
                merchant_id = %current.merchant_id,
                next_move_id = %current.id,
                error = %cause,
                "late storefront change could not be undone"
            );
            return Err(EngineError::RollbackFailed {
                next_move_id: current.id.clone(),
                cause,
            });
        }
        warn!(
            merchant_id = %current.merchant_id,
            next_move_id = %current.id,
            status = current.status.name(),
            "mutation finished after the move was abandoned; change undone"
        );
        Ok(current)
    }

    /// Undo the debit and snapshot after a failed mutation, then report it.
    async fn compensate(
        &self,
        mut current: NextMove,
        attempt: u32,
        cause: ConnectorError,
    ) -> Result<NextMove, EngineError> {
        let reason = format!("execution failed: {}", cause);
        let cost = current.opportunity.credit_cost;
        for _ in 0..MAX_CONFLICT_RETRIES {
            if !owns_execution(&current, attempt) {
                // Abandoned meanwhile; that already refunded the credits.
                warn!(
                    merchant_id = %current.merchant_id,
                    next_move_id = %current.id,
                    status = current.status.name(),
                    error = %cause,
                    "execution failed after the move was abandoned"
                );
                return Err(execution_failed(current, cause));
            }
            let now = self.clock.now();
            let mut updated = current.clone();
            updated.transition(
                Transition::ApplyFailed {
                    reason: reason.clone(),
                },
                now,
            )?;

            let mut snapshot = self.storage.begin_snapshot().await?;
            if let Err(e) = self
                .ledger
                .stage_refund(&mut snapshot, &current.merchant_id, cost)
                .await
            {
                let _ = self.storage.abort_snapshot(snapshot).await;
                return Err(e);
            }
            if let Err(e) = self
                .storage
                .delete_rollback_snapshot(&mut snapshot, &updated.id)
                .await
            {
                let _ = self.storage.abort_snapshot(snapshot).await;
                return Err(e.into());
            }
            match persist::stage_update(&*self.storage, &mut snapshot, &updated, now).await {
                Ok(version) => updated.version = version,
                Err(e) => {
                    let _ = self.storage.abort_snapshot(snapshot).await;
                    return Err(e);
                }
            }

            match self.storage.commit_snapshot(snapshot).await {
                Ok(()) => {
                    warn!(
                        merchant_id = %updated.merchant_id,
                        next_move_id = %updated.id,
                        from = "executing",
                        to = updated.status.name(),
                        credits = cost,
                        error = %cause,
                        "execution failed; credits refunded"
                    );
                    return Err(execution_failed(updated, cause));
                }
                Err(e) if e.is_conflict() => {
                    current = persist::load(&*self.storage, &current.id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict(format!("next_move/{}", current.id)))
    }

    /// Give up on an execution that never reported back: refund the credits
    /// and block the move in one snapshot. The rollback snapshot is kept so
    /// the storefront can be restored whether or not the mutation landed.
    pub(crate) async fn abandon(
        &self,
        mut current: NextMove,
        timeout: Duration,
    ) -> Result<NextMove, EngineError> {
        let reason = format!(
            "execution interrupted: no result after {} seconds",
            timeout.whole_seconds()
        );
        let cost = current.opportunity.credit_cost;
        for _ in 0..MAX_CONFLICT_RETRIES {
            if current.status != NextMoveStatus::Executing {
                return Ok(current);
            }
            let now = self.clock.now();
            let mut updated = current.clone();
            updated.transition(
                Transition::ApplyFailed {
                    reason: reason.clone(),
                },
                now,
            )?;

            let mut snapshot = self.storage.begin_snapshot().await?;
            if let Err(e) = self
                .ledger
                .stage_refund(&mut snapshot, &updated.merchant_id, cost)
                .await
            {
                let _ = self.storage.abort_snapshot(snapshot).await;
                return Err(e);
            }
            let version =
                match persist::stage_update(&*self.storage, &mut snapshot, &updated, now).await {
                    Ok(version) => version,
                    Err(e) => {
                        let _ = self.storage.abort_snapshot(snapshot).await;
                        return Err(e);
                    }
                };
            match self.storage.commit_snapshot(snapshot).await {
                Ok(()) => {
                    updated.version = version;
                    warn!(
                        merchant_id = %updated.merchant_id,
                        next_move_id = %updated.id,
                        from = "executing",
                        to = updated.status.name(),
                        credits = cost,
                        "execution abandoned; credits refunded"
                    );
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => {
                    current = persist::load(&*self.storage, &current.id).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict(format!("next_move/{}", current.id)))
    }

    /// The prior state could not be captured, so nothing was charged or
    /// changed. The move is blocked with the cause and retried later.
    async fn fail_before_start(
        &self,
        mut next_move: NextMove,
        cause: ConnectorError,
    ) -> Result<NextMove, EngineError> {
        let now = self.clock.now();
        let from = next_move.status.name();
        let reason = format!("execution failed: could not capture prior state: {}", cause);
        next_move.transition(
            Transition::Authorized(Verdict::Blocked {
                reason: reason.clone(),
            }),
            now,
        )?;
        next_move.execution_attempts += 1;
        next_move.last_error = Some(reason);
        persist::save(&*self.storage, &mut next_move, now).await?;
        warn!(
            merchant_id = %next_move.merchant_id,
            next_move_id = %next_move.id,
            from,
            to = "blocked",
            error = %cause,
            "could not capture prior state"
        );
        Err(execution_failed(next_move, cause))
    }
}

/// Still `executing` on the attempt this run started.
fn owns_execution(next_move: &NextMove, attempt: u32) -> bool {
    next_move.status == NextMoveStatus::Executing && next_move.execution_attempts == attempt
}

fn execution_failed(next_move: NextMove, cause: ConnectorError) -> EngineError {
    EngineError::ExecutionFailed {
        next_move_id: next_move.id.clone(),
        retryable: cause.is_retryable(),
        cause,
        next_move: Box::new(next_move),
    }
}
