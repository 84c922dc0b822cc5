//! Post-execution monitoring.
//!
//! Regression detection belongs to an external analytics system; the engine
//! only consumes its verdict through [`RegressionSignal`]. The loop itself is
//! a pure decision over (move, observation, now) so the window bound can be
//! tested without waiting.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::next_move::NextMove;

/// What the analytics signal says about an executed move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "observation", rename_all = "snake_case")]
pub enum Observation {
    /// Not enough data yet.
    Pending,
    /// Metrics held up; the move can complete before the window closes.
    Stable,
    /// Metrics regressed; the move should be reverted.
    Regressed { reason: String },
}

#[async_trait]
pub trait RegressionSignal: Send + Sync {
    async fn observe(&self, next_move: &NextMove) -> Observation;

    /// The move left monitoring; anything held for it can be dropped.
    fn settle(&self, _next_move_id: &str) {}
}

/// A signal that never reports anything; moves complete when the window
/// closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRegression;

#[async_trait]
impl RegressionSignal for NoRegression {
    async fn observe(&self, _next_move: &NextMove) -> Observation {
        Observation::Pending
    }
}

/// Observations reported per next move, e.g. by an analytics webhook.
#[derive(Debug, Default)]
pub struct SignalBoard {
    signals: RwLock<HashMap<String, Observation>>,
}

impl SignalBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self, next_move_id: &str, observation: Observation) {
        self.signals
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(next_move_id.to_string(), observation);
    }

    pub fn clear(&self, next_move_id: &str) {
        self.signals
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(next_move_id);
    }

    /// Moves with a recorded observation.
    pub fn tracked(&self) -> usize {
        self.signals.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl RegressionSignal for SignalBoard {
    async fn observe(&self, next_move: &NextMove) -> Observation {
        self.signals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&next_move.id)
            .cloned()
            .unwrap_or(Observation::Pending)
    }

    fn settle(&self, next_move_id: &str) {
        self.clear(next_move_id);
    }
}

/// What to do with a monitoring move right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorDecision {
    KeepWatching { deadline: OffsetDateTime },
    Complete,
    Revert { reason: String },
}

/// Bounded observation window applied to monitoring moves.
#[derive(Debug, Clone, Copy)]
pub struct MonitoringLoop {
    window: Duration,
}

impl MonitoringLoop {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn deadline_from(&self, executed_at: OffsetDateTime) -> OffsetDateTime {
        executed_at + self.window
    }

    /// A regression always wins, even past the deadline; otherwise the move
    /// completes on a stable signal or when the window closes.
    pub fn decide(
        &self,
        next_move: &NextMove,
        observation: &Observation,
        now: OffsetDateTime,
    ) -> MonitorDecision {
        match observation {
            Observation::Regressed { reason } => MonitorDecision::Revert {
                reason: reason.clone(),
            },
            Observation::Stable => MonitorDecision::Complete,
            Observation::Pending => {
                let deadline = next_move.monitoring_deadline.unwrap_or_else(|| {
                    self.deadline_from(next_move.executed_at.unwrap_or(next_move.selected_at))
                });
                if now >= deadline {
                    MonitorDecision::Complete
                } else {
                    MonitorDecision::KeepWatching { deadline }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorization::Verdict;
    use crate::status::Transition;
    use crate::types::tests::opportunity;
    use time::macros::datetime;

    fn monitoring_move() -> NextMove {
        let at = datetime!(2026-10-01 10:00 UTC);
        let mut nm = NextMove::select("nm-1".to_string(), "m1", opportunity("o1"), Verdict::Ready, at);
        nm.transition(Transition::AutoExecute, at).unwrap();
        nm.transition(Transition::Applied, at).unwrap();
        nm.monitoring_deadline = Some(at + Duration::hours(72));
        nm
    }

    #[test]
    fn pending_inside_window_keeps_watching() {
        let monitor = MonitoringLoop::new(Duration::hours(72));
        let nm = monitoring_move();
        let decision = monitor.decide(&nm, &Observation::Pending, datetime!(2026-10-02 10:00 UTC));
        assert_eq!(
            decision,
            MonitorDecision::KeepWatching {
                deadline: datetime!(2026-10-04 10:00 UTC)
            }
        );
    }

    #[test]
    fn pending_past_window_completes() {
        let monitor = MonitoringLoop::new(Duration::hours(72));
        let nm = monitoring_move();
        let decision = monitor.decide(&nm, &Observation::Pending, datetime!(2026-10-04 10:00 UTC));
        assert_eq!(decision, MonitorDecision::Complete);
    }

    #[test]
    fn regression_reverts_even_after_deadline() {
        let monitor = MonitoringLoop::new(Duration::hours(72));
        let nm = monitoring_move();
        let decision = monitor.decide(
            &nm,
            &Observation::Regressed {
                reason: "conversion down 18%".to_string(),
            },
            datetime!(2026-10-09 10:00 UTC),
        );
        assert!(matches!(decision, MonitorDecision::Revert { .. }));
    }

    #[tokio::test]
    async fn signal_board_defaults_to_pending() {
        let board = SignalBoard::new();
        let nm = monitoring_move();
        assert_eq!(board.observe(&nm).await, Observation::Pending);

        board.report("nm-1", Observation::Stable);
        assert_eq!(board.observe(&nm).await, Observation::Stable);

        board.clear("nm-1");
        assert_eq!(board.observe(&nm).await, Observation::Pending);
        assert_eq!(NoRegression.observe(&nm).await, Observation::Pending);
    }
}
