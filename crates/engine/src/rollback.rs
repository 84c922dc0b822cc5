//! Rollback manager.
//!
//! A revert claims the move's snapshot (compare-and-set on `consumed`)
//! before touching the storefront, so of any number of concurrent or
//! repeated rollback requests exactly one performs the external revert.
//! The snapshot is only deleted after that revert succeeded, or by the
//! retention sweep once a completed move's grace period is over.
//!
//! A move still `executing` cannot be reverted: its mutation may land after
//! the revert. Callers get [`RollbackOutcome::InProgress`] and retry once
//! the move is being monitored.

use std::sync::Arc;

use nextmove_storage::{EngineStorage, StorageError};
use serde::Serialize;
use time::Duration;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::connector::StorefrontConnector;
use crate::error::EngineError;
use crate::next_move::NextMove;
use crate::persist::{self, MAX_CONFLICT_RETRIES};
use crate::status::{NextMoveStatus, RollbackTrigger, Transition};

/// Result of a rollback request. Unavailability is a value, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollbackOutcome {
    /// External state was restored; the move is now `rolled_back`.
    Reverted { next_move: NextMove },
    /// Nothing to restore: the move never executed, or its snapshot is gone.
    NoSnapshot,
    /// A previous request already reverted (or is reverting) the move.
    AlreadyReverted,
    /// The storefront mutation is still in flight; retry later.
    InProgress,
}

pub struct RollbackManager<S: EngineStorage> {
    storage: Arc<S>,
    connector: Arc<dyn StorefrontConnector>,
    clock: Arc<dyn Clock>,
}

impl<S: EngineStorage> RollbackManager<S> {
    pub fn new(
        storage: Arc<S>,
        connector: Arc<dyn StorefrontConnector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            connector,
            clock,
        }
    }

    /// Restore the storefront from the move's snapshot and mark it
    /// `rolled_back`. Credits are not refunded.
    pub async fn revert(
        &self,
        next_move_id: &str,
        trigger: RollbackTrigger,
    ) -> Result<RollbackOutcome, EngineError> {
        let next_move = persist::load(&*self.storage, next_move_id).await?;
        match next_move.status {
            NextMoveStatus::RolledBack { .. } => return Ok(RollbackOutcome::AlreadyReverted),
            NextMoveStatus::Executing => return Ok(RollbackOutcome::InProgress),
            _ => {}
        }
        if !next_move.status.rollback_possible() {
            return Ok(RollbackOutcome::NoSnapshot);
        }

        let claimed = match self.claim(next_move_id).await? {
            Some(claimed) => claimed,
            None => {
                if self
                    .storage
                    .get_rollback_snapshot(next_move_id)
                    .await?
                    .is_some()
                {
                    return Ok(RollbackOutcome::AlreadyReverted);
                }
                // The winner may have finished between our load and claim.
                let latest = persist::load(&*self.storage, next_move_id).await?;
                return Ok(match latest.status {
                    NextMoveStatus::RolledBack { .. } => RollbackOutcome::AlreadyReverted,
                    _ => RollbackOutcome::NoSnapshot,
                });
            }
        };

        if let Err(cause) = self
            .connector
            .revert(
                &next_move.merchant_id,
                &next_move.opportunity,
                &claimed.prior_state,
            )
            .await
        {
            self.release(next_move_id).await?;
            warn!(
                merchant_id = %next_move.merchant_id,
                next_move_id,
                error = %cause,
                "storefront revert failed; snapshot kept"
            );
            return Err(EngineError::RollbackFailed {
                next_move_id: next_move_id.to_string(),
                cause,
            });
        }

        self.finish(next_move_id, trigger).await
    }

    /// Undo the storefront change of a move that left `executing` without
    /// reaching `monitoring`, then delete its snapshot. The move itself is
    /// not touched. `Ok(false)` when the snapshot is claimed elsewhere or
    /// the revert failed; the snapshot is kept for the next attempt.
    pub(crate) async fn restore_orphan(&self, next_move: &NextMove) -> Result<bool, EngineError> {
        let Some(claimed) = self.claim(&next_move.id).await? else {
            return Ok(false);
        };
        if let Err(cause) = self
            .connector
            .revert(
                &next_move.merchant_id,
                &next_move.opportunity,
                &claimed.prior_state,
            )
            .await
        {
            self.release(&next_move.id).await?;
            warn!(
                merchant_id = %next_move.merchant_id,
                next_move_id = %next_move.id,
                error = %cause,
                "storefront restore after abandoned execution failed; snapshot kept"
            );
            return Ok(false);
        }

        let mut snapshot = self.storage.begin_snapshot().await?;
        if let Err(e) = self
            .storage
            .delete_rollback_snapshot(&mut snapshot, &next_move.id)
            .await
        {
            let _ = self.storage.abort_snapshot(snapshot).await;
            return Err(e.into());
        }
        self.storage.commit_snapshot(snapshot).await?;
        info!(
            merchant_id = %next_move.merchant_id,
            next_move_id = %next_move.id,
            "storefront restored after abandoned execution"
        );
        Ok(true)
    }

    /// Claim the snapshot. `None` when it is missing or already claimed.
    async fn claim(
        &self,
        next_move_id: &str,
    ) -> Result<Option<nextmove_storage::RollbackSnapshotRecord>, EngineError> {
        let mut snapshot = self.storage.begin_snapshot().await?;
        let claimed = match self
            .storage
            .claim_rollback_snapshot(&mut snapshot, next_move_id)
            .await
        {
            Ok(claimed) => claimed,
            Err(StorageError::SnapshotConsumed { .. } | StorageError::SnapshotNotFound { .. }) => {
                let _ = self.storage.abort_snapshot(snapshot).await;
                return Ok(None);
            }
            Err(e) => {
                let _ = self.storage.abort_snapshot(snapshot).await;
                return Err(e.into());
            }
        };
        match self.storage.commit_snapshot(snapshot).await {
            Ok(()) => Ok(Some(claimed)),
            // Another request claimed it between our read and commit.
            Err(StorageError::SnapshotConsumed { .. } | StorageError::SnapshotNotFound { .. }) => {
                Ok(None)
            }
            Err(e) if e.is_conflict() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, next_move_id: &str) -> Result<(), EngineError> {
        let mut snapshot = self.storage.begin_snapshot().await?;
        if let Err(e) = self
            .storage
            .release_rollback_snapshot(&mut snapshot, next_move_id)
            .await
        {
            let _ = self.storage.abort_snapshot(snapshot).await;
            return Err(e.into());
        }
        self.storage.commit_snapshot(snapshot).await?;
        Ok(())
    }

    /// Mark the move rolled back and delete the consumed snapshot together.
    async fn finish(
        &self,
        next_move_id: &str,
        trigger: RollbackTrigger,
    ) -> Result<RollbackOutcome, EngineError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut current = persist::load(&*self.storage, next_move_id).await?;
            let from = current.status.name();
            let now = self.clock.now();
            current.transition(Transition::Reverted { trigger }, now)?;

            let mut snapshot = self.storage.begin_snapshot().await?;
            if let Err(e) = self
                .storage
                .delete_rollback_snapshot(&mut snapshot, next_move_id)
                .await
            {
                let _ = self.storage.abort_snapshot(snapshot).await;
                return Err(e.into());
            }
            let version =
                match persist::stage_update(&*self.storage, &mut snapshot, &current, now).await {
                    Ok(version) => version,
                    Err(e) => {
                        let _ = self.storage.abort_snapshot(snapshot).await;
                        return Err(e);
                    }
                };
            match self.storage.commit_snapshot(snapshot).await {
                Ok(()) => {
                    current.version = version;
                    info!(
                        merchant_id = %current.merchant_id,
                        next_move_id,
                        from,
                        to = "rolled_back",
                        ?trigger,
                        "next move rolled back"
                    );
                    return Ok(RollbackOutcome::Reverted { next_move: current });
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Conflict(format!("next_move/{}", next_move_id)))
    }

    /// Drop snapshots of completed moves whose post-completion rollback
    /// window has passed. Returns how many were discarded.
    pub async fn sweep(
        &self,
        merchant_id: &str,
        retention: Duration,
    ) -> Result<usize, EngineError> {
        let now = self.clock.now();
        let mut discarded = 0;
        for mut next_move in persist::history(&*self.storage, merchant_id, 0).await? {
            if next_move.status != NextMoveStatus::Completed || !next_move.rollback_available {
                continue;
            }
            let Some(completed_at) = next_move.completed_at else {
                continue;
            };
            if completed_at + retention > now {
                continue;
            }
            match self.storage.get_rollback_snapshot(&next_move.id).await? {
                // A revert is in flight.
                Some(record) if record.consumed => continue,
                _ => {}
            }
            if self.discard(&mut next_move).await? {
                discarded += 1;
            }
        }
        Ok(discarded)
    }

    /// Delete a completed move's snapshot and clear `rollback_available`.
    /// `Ok(false)` if the move changed concurrently; the next sweep retries.
    pub(crate) async fn discard(&self, next_move: &mut NextMove) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let mut snapshot = self.storage.begin_snapshot().await?;
        match self
            .storage
            .delete_rollback_snapshot(&mut snapshot, &next_move.id)
            .await
        {
            Ok(()) | Err(StorageError::SnapshotNotFound { .. }) => {}
            Err(e) => {
                let _ = self.storage.abort_snapshot(snapshot).await;
                return Err(e.into());
            }
        }
        let mut updated = next_move.clone();
        updated.rollback_available = false;
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
                *next_move = updated;
                info!(
                    merchant_id = %next_move.merchant_id,
                    next_move_id = %next_move.id,
                    "rollback snapshot discarded"
                );
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
