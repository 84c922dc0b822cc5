//! Explicit scheduler.
//!
//! A cycle for one merchant re-reads readiness and balance at every step
//! (through the engine operations it calls) rather than trusting values from
//! an earlier tick. Merchants are cycled concurrently and independently.

use std::sync::Arc;
use std::time::Duration;

use nextmove_storage::EngineStorage;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::{Engine, NextMoveView};
use crate::error::EngineError;
use crate::status::NextMoveStatus;

/// What one cycle did for one merchant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleReport {
    pub merchant_id: String,
    /// The merchant's view after the cycle.
    pub view: NextMoveView,
    /// Whether a move was executed this cycle.
    pub executed: bool,
    /// Rollback snapshots discarded by the retention sweep.
    pub snapshots_discarded: usize,
    /// A non-fatal execution failure, if one occurred.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_error: Option<String>,
}

pub struct Scheduler<S: EngineStorage> {
    engine: Arc<Engine<S>>,
}

impl<S: EngineStorage> Clone for Scheduler<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<S: EngineStorage> Scheduler<S> {
    pub fn new(engine: Arc<Engine<S>>) -> Self {
        Self { engine }
    }

    /// One pass for one merchant: housekeeping and selection, execution of
    /// a ready move, a monitoring step, and the snapshot sweep.
    pub async fn run_cycle(&self, merchant_id: &str) -> Result<CycleReport, EngineError> {
        let mut view = self.engine.get_next_move(merchant_id).await?;
        let mut executed = false;
        let mut execution_error = None;

        if let NextMoveView::Active { next_move } = &view {
            if next_move.status == NextMoveStatus::Ready {
                match self.engine.execute(&next_move.id).await {
                    Ok(after) => {
                        executed = after.status != NextMoveStatus::Ready
                            && after.executed_at.is_some();
                        view = NextMoveView::Active { next_move: after };
                    }
                    Err(EngineError::ExecutionFailed {
                        cause, next_move, ..
                    }) => {
                        execution_error = Some(cause.to_string());
                        view = NextMoveView::Active {
                            next_move: *next_move,
                        };
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(observed) = self.engine.monitor_merchant(merchant_id).await? {
            view = NextMoveView::Active {
                next_move: observed,
            };
        }

        let snapshots_discarded = self.engine.sweep(merchant_id).await?;

        debug!(merchant_id, executed, snapshots_discarded, "cycle finished");
        Ok(CycleReport {
            merchant_id: merchant_id.to_string(),
            view,
            executed,
            snapshots_discarded,
            execution_error,
        })
    }

    /// Cycle every merchant in the directory concurrently. One merchant's
    /// error is logged and does not affect the others.
    pub async fn run_all(&self) -> Vec<CycleReport> {
        let merchants = self.engine.directory().merchants().await;
        let mut tasks = JoinSet::new();
        for merchant_id in merchants {
            let scheduler = self.clone();
            tasks.spawn(async move {
                let result = scheduler.run_cycle(&merchant_id).await;
                (merchant_id, result)
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(report))) => reports.push(report),
                Ok((merchant_id, Err(e))) => {
                    warn!(merchant_id = %merchant_id, error = %e, "cycle failed");
                }
                Err(e) => warn!(error = %e, "cycle task panicked"),
            }
        }
        reports.sort_by(|a, b| a.merchant_id.cmp(&b.merchant_id));
        reports
    }

    /// Run cycles every `interval` until `shutdown` flips to `true`.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reports = self.run_all().await;
                    debug!(merchants = reports.len(), "scheduler tick");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}
