//! Authorization gate: decides whether a selected opportunity may run on
//! its own, needs the merchant's sign-off, or is blocked.
//!
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. store readiness
//! 2. plan tier includes the action
//! 3. risk within the plan's ceiling
//! 4. credit balance covers the cost
//!
//! A move that passes all four is `ready` when the plan auto-executes at
//! that risk level, `awaiting_approval` otherwise. High-risk actions always
//! need sign-off.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::readiness::Readiness;
use crate::status::NextMoveStatus;
use crate::types::{Opportunity, PlanTier, RiskLevel};

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Verdict {
    Ready,
    AwaitingApproval,
    Blocked { reason: String },
}

impl Verdict {
    pub(crate) fn into_status(self) -> NextMoveStatus {
        match self {
            Verdict::Ready => NextMoveStatus::Ready,
            Verdict::AwaitingApproval => NextMoveStatus::AwaitingApproval,
            Verdict::Blocked { reason } => NextMoveStatus::Blocked { reason },
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Verdict::Blocked { .. })
    }
}

/// What a plan tier allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanPolicy {
    /// Whether the plan runs actions without a merchant click at all.
    pub auto_execute: bool,
    /// Highest risk the plan auto-executes. Ignored when `auto_execute` is off.
    pub auto_execute_max_risk: RiskLevel,
    /// Highest risk the plan permits, approved or not.
    pub max_risk: RiskLevel,
}

impl PlanPolicy {
    pub fn defaults_for(tier: PlanTier) -> Self {
        match tier {
            PlanTier::Starter => PlanPolicy {
                auto_execute: false,
                auto_execute_max_risk: RiskLevel::Low,
                max_risk: RiskLevel::Medium,
            },
            PlanTier::Growth => PlanPolicy {
                auto_execute: true,
                auto_execute_max_risk: RiskLevel::Low,
                max_risk: RiskLevel::High,
            },
            PlanTier::Pro | PlanTier::Enterprise => PlanPolicy {
                auto_execute: true,
                auto_execute_max_risk: RiskLevel::Medium,
                max_risk: RiskLevel::High,
            },
        }
    }

    fn auto_executes(&self, risk: RiskLevel) -> bool {
        self.auto_execute && risk != RiskLevel::High && risk <= self.auto_execute_max_risk
    }
}

/// Facts the gate decides on, gathered fresh for every check.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationInput {
    pub plan: PlanTier,
    pub readiness: Readiness,
    /// Remaining credits.
    pub balance: u32,
}

/// Evaluates opportunities against per-tier policies.
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    policies: BTreeMap<PlanTier, PlanPolicy>,
}

impl Default for AuthorizationGate {
    fn default() -> Self {
        Self::new(&BTreeMap::new())
    }
}

impl AuthorizationGate {
    /// Build a gate from configured policies; tiers missing from `policies`
    /// use [`PlanPolicy::defaults_for`].
    pub fn new(policies: &BTreeMap<PlanTier, PlanPolicy>) -> Self {
        let policies = PlanTier::ALL
            .iter()
            .map(|tier| {
                let policy = policies
                    .get(tier)
                    .copied()
                    .unwrap_or_else(|| PlanPolicy::defaults_for(*tier));
                (*tier, policy)
            })
            .collect();
        Self { policies }
    }

    pub fn policy(&self, tier: PlanTier) -> PlanPolicy {
        self.policies
            .get(&tier)
            .copied()
            .unwrap_or_else(|| PlanPolicy::defaults_for(tier))
    }

    pub fn evaluate(&self, opportunity: &Opportunity, input: AuthorizationInput) -> Verdict {
        if input.readiness != Readiness::Ready {
            return Verdict::Blocked {
                reason: format!("store not ready: {}", input.readiness),
            };
        }

        if input.plan < opportunity.required_plan {
            return Verdict::Blocked {
                reason: format!(
                    "plan tier {} does not include {} (requires {})",
                    input.plan, opportunity.action_type, opportunity.required_plan
                ),
            };
        }

        let policy = self.policy(input.plan);
        if opportunity.risk > policy.max_risk {
            return Verdict::Blocked {
                reason: format!(
                    "risk level {} exceeds what the {} plan permits (max {})",
                    opportunity.risk, input.plan, policy.max_risk
                ),
            };
        }

        if input.balance < opportunity.credit_cost {
            return Verdict::Blocked {
                reason: format!(
                    "insufficient credits: {} remaining, {} required",
                    input.balance, opportunity.credit_cost
                ),
            };
        }

        if policy.auto_executes(opportunity.risk) {
            Verdict::Ready
        } else {
            Verdict::AwaitingApproval
        }
    }
}

// ──────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────
