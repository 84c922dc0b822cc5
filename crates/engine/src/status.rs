//! Next move lifecycle as an explicit state machine.
//!
//! Every status change goes through [`NextMoveStatus::apply`]. The match in
//! `apply` is the whole transition table: a (status, event) pair that is not
//! listed there is an [`IllegalTransition`], so paths such as
//! `blocked -> monitoring` cannot be taken by any caller.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::authorization::Verdict;

/// What asked for a rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    /// The merchant (or an operator) asked for it.
    Manual,
    /// The regression signal reported a regression while monitoring.
    Regression,
}

/// Lifecycle status of a next move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NextMoveStatus {
    Ready,
    AwaitingApproval,
    Blocked { reason: String },
    Executing,
    Monitoring,
    Completed,
    RolledBack { trigger: RollbackTrigger },
    Declined,
    Expired,
    Failed { reason: String },
}

/// Events that move a next move through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Result of (re-)running the authorization gate.
    Authorized(Verdict),
    /// The scheduler or UI starts an auto-executable move.
    AutoExecute,
    /// The merchant approved the move.
    Approve,
    /// The merchant declined the move.
    Decline,
    /// The storefront mutation succeeded.
    Applied,
    /// The storefront mutation failed; credits were refunded.
    ApplyFailed { reason: String },
    /// The monitoring window closed without regression.
    Stabilized,
    /// External state was restored from the rollback snapshot.
    Reverted { trigger: RollbackTrigger },
    /// The move sat unexecuted past its time-to-live.
    Expire,
    /// Retries are exhausted.
    GiveUp { reason: String },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Authorized(_) => "authorized",
            Transition::AutoExecute => "auto_execute",
            Transition::Approve => "approve",
            Transition::Decline => "decline",
            Transition::Applied => "applied",
            Transition::ApplyFailed { .. } => "apply_failed",
            Transition::Stabilized => "stabilized",
            Transition::Reverted { .. } => "reverted",
            Transition::Expire => "expire",
            Transition::GiveUp { .. } => "give_up",
        }
    }
}

/// A (status, event) pair outside the transition table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition: {event} is not allowed from {from}")]
pub struct IllegalTransition {
    pub from: &'static str,
    pub event: &'static str,
}

impl NextMoveStatus {
    pub fn name(&self) -> &'static str {
        match self {
            NextMoveStatus::Ready => "ready",
            NextMoveStatus::AwaitingApproval => "awaiting_approval",
            NextMoveStatus::Blocked { .. } => "blocked",
            NextMoveStatus::Executing => "executing",
            NextMoveStatus::Monitoring => "monitoring",
            NextMoveStatus::Completed => "completed",
            NextMoveStatus::RolledBack { .. } => "rolled_back",
            NextMoveStatus::Declined => "declined",
            NextMoveStatus::Expired => "expired",
            NextMoveStatus::Failed { .. } => "failed",
        }
    }

    /// Active moves hold the merchant's single slot; no new selection
    /// happens while one exists.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            NextMoveStatus::Ready
                | NextMoveStatus::AwaitingApproval
                | NextMoveStatus::Blocked { .. }
                | NextMoveStatus::Executing
                | NextMoveStatus::Monitoring
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// States in which the storefront mutation has landed and a snapshot
    /// may still exist. `executing` is excluded: the mutation is in flight.
    pub fn rollback_possible(&self) -> bool {
        matches!(self, NextMoveStatus::Monitoring | NextMoveStatus::Completed)
    }

    pub fn blocked_reason(&self) -> Option<&str> {
        match self {
            NextMoveStatus::Blocked { reason } | NextMoveStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Compute the status that `event` leads to.
    pub fn apply(&self, event: Transition) -> Result<NextMoveStatus, IllegalTransition> {
        use NextMoveStatus as S;
        use Transition as T;

        let next = match (self, event) {
            (S::Blocked { .. }, T::Authorized(verdict)) => verdict.into_status(),
            (S::Ready | S::AwaitingApproval, T::Authorized(Verdict::Blocked { reason })) => {
                S::Blocked { reason }
            }
            (S::Ready, T::Authorized(Verdict::Ready)) => S::Ready,
            (S::Ready | S::AwaitingApproval, T::Authorized(Verdict::AwaitingApproval)) => {
                S::AwaitingApproval
            }
            // An outstanding approval request is never silently dropped.
            (S::AwaitingApproval, T::Authorized(Verdict::Ready)) => S::AwaitingApproval,
            (S::Ready, T::AutoExecute) => S::Executing,
            (S::AwaitingApproval, T::Approve) => S::Executing,
            (S::AwaitingApproval, T::Decline) => S::Declined,
            (S::Executing, T::Applied) => S::Monitoring,
            (S::Executing, T::ApplyFailed { reason }) => S::Blocked { reason },
            (S::Monitoring, T::Stabilized) => S::Completed,
            (S::Monitoring | S::Completed, T::Reverted { trigger }) => {
                S::RolledBack { trigger }
            }
            (S::Ready | S::AwaitingApproval | S::Blocked { .. }, T::Expire) => S::Expired,
            (S::Blocked { .. }, T::GiveUp { reason }) => S::Failed { reason },
            (from, event) => {
                return Err(IllegalTransition {
                    from: from.name(),
                    event: event.name(),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for NextMoveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NextMoveStatus::Blocked { reason } => write!(f, "blocked ({})", reason),
            NextMoveStatus::Failed { reason } => write!(f, "failed ({})", reason),
            other => f.write_str(other.name()),
        }
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn blocked(reason: &str) -> NextMoveStatus {
        NextMoveStatus::Blocked {
            reason: reason.to_string(),
        }
    }

    #[test]
    fn happy_path_auto_execute() {
        let s = NextMoveStatus::Ready;
        let s = s.apply(Transition::AutoExecute).unwrap();
        assert_eq!(s, NextMoveStatus::Executing);
        let s = s.apply(Transition::Applied).unwrap();
        assert_eq!(s, NextMoveStatus::Monitoring);
        let s = s.apply(Transition::Stabilized).unwrap();
        assert_eq!(s, NextMoveStatus::Completed);
    }

    #[test]
    fn approval_path() {
        let s = NextMoveStatus::AwaitingApproval;
        assert_eq!(
            s.apply(Transition::Approve).unwrap(),
            NextMoveStatus::Executing
        );
        assert_eq!(
            s.apply(Transition::Decline).unwrap(),
            NextMoveStatus::Declined
        );
    }

    #[test]
    fn blocked_cannot_jump_to_monitoring() {
        let err = blocked("insufficient credits")
            .apply(Transition::Applied)
            .unwrap_err();
        assert_eq!(err.from, "blocked");
        assert_eq!(err.event, "applied");
        assert_eq!(
            err.to_string(),
            "illegal transition: applied is not allowed from blocked"
        );
    }

    #[test]
    fn ready_cannot_be_approved_and_awaiting_cannot_auto_execute() {
        assert!(NextMoveStatus::Ready.apply(Transition::Approve).is_err());
        assert!(NextMoveStatus::AwaitingApproval
            .apply(Transition::AutoExecute)
            .is_err());
    }

    #[test]
    fn reauthorization_unblocks_and_blocks() {
        let s = blocked("store not ready: warming_up");
        assert_eq!(
            s.apply(Transition::Authorized(Verdict::Ready)).unwrap(),
            NextMoveStatus::Ready
        );
        let s = NextMoveStatus::Ready.apply(Transition::Authorized(Verdict::Blocked {
            reason: "insufficient credits: 0 remaining, 5 required".to_string(),
        }));
        assert_eq!(s.unwrap().name(), "blocked");
    }

    #[test]
    fn awaiting_approval_is_not_promoted_to_ready() {
        let s = NextMoveStatus::AwaitingApproval
            .apply(Transition::Authorized(Verdict::Ready))
            .unwrap();
        assert_eq!(s, NextMoveStatus::AwaitingApproval);
    }

    #[test]
    fn execution_failure_blocks_with_reason() {
        let s = NextMoveStatus::Executing
            .apply(Transition::ApplyFailed {
                reason: "execution failed: storefront unavailable: timeout".to_string(),
            })
            .unwrap();
        assert_eq!(
            s.blocked_reason(),
            Some("execution failed: storefront unavailable: timeout")
        );
        assert!(s.is_active());
    }

    #[test]
    fn rollback_only_after_execution_started() {
        let trigger = RollbackTrigger::Manual;
        for s in [NextMoveStatus::Monitoring, NextMoveStatus::Completed] {
            assert!(s.rollback_possible());
            assert_eq!(
                s.apply(Transition::Reverted { trigger }).unwrap(),
                NextMoveStatus::RolledBack { trigger }
            );
        }
        assert!(NextMoveStatus::AwaitingApproval
            .apply(Transition::Reverted { trigger })
            .is_err());
        assert!(!NextMoveStatus::Executing.rollback_possible());
        assert!(NextMoveStatus::Executing
            .apply(Transition::Reverted { trigger })
            .is_err());
        assert!(NextMoveStatus::RolledBack { trigger }
            .apply(Transition::Reverted { trigger })
            .is_err());
    }

    #[test]
    fn terminal_states_accept_nothing() {
        let terminal = [
            NextMoveStatus::Completed,
            NextMoveStatus::Declined,
            NextMoveStatus::Expired,
            NextMoveStatus::Failed {
                reason: "x".to_string(),
            },
        ];
        for s in terminal {
            assert!(s.is_terminal());
            assert!(s.apply(Transition::Expire).is_err());
            assert!(s.apply(Transition::Approve).is_err());
            assert!(s.apply(Transition::Authorized(Verdict::Ready)).is_err());
        }
    }

    #[test]
    fn expiry_and_give_up() {
        assert_eq!(
            NextMoveStatus::AwaitingApproval
                .apply(Transition::Expire)
                .unwrap(),
            NextMoveStatus::Expired
        );
        assert!(NextMoveStatus::Monitoring.apply(Transition::Expire).is_err());
        let s = blocked("execution failed")
            .apply(Transition::GiveUp {
                reason: "gave up after 3 attempts".to_string(),
            })
            .unwrap();
        assert_eq!(s.name(), "failed");
    }

    #[test]
    fn serializes_as_tagged_object() {
        let json = serde_json::to_value(blocked("insufficient credits")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "blocked", "reason": "insufficient credits"})
        );
        let json = serde_json::to_value(NextMoveStatus::RolledBack {
            trigger: RollbackTrigger::Regression,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "rolled_back", "trigger": "regression"})
        );
    }
}
