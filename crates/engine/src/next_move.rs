//! The next move record and its persistence mapping.

use nextmove_storage::NextMoveRecord;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::authorization::Verdict;
use crate::clock::iso8601;
use crate::error::EngineError;
use crate::status::{IllegalTransition, NextMoveStatus, Transition};
use crate::types::Opportunity;

/// The single opportunity chosen for a merchant's current cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextMove {
    pub id: String,
    pub merchant_id: String,
    pub opportunity: Opportunity,
    #[serde(flatten)]
    pub status: NextMoveStatus,
    /// Expected monthly revenue per credit.
    pub credit_value_ratio: Option<Decimal>,
    /// True while a rollback snapshot is retained and not consumed.
    pub rollback_available: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub selected_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub authorized_at: Option<OffsetDateTime>,
    /// When the current execution attempt entered `executing`.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub execution_started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub executed_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub monitoring_deadline: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub rolled_back_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub declined_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expired_at: Option<OffsetDateTime>,
    /// Set once the gate asked for merchant approval; cleared by `approve`.
    /// A blocked move that needed approval returns to `awaiting_approval`.
    #[serde(default)]
    pub approval_pending: bool,
    /// Failed or abandoned storefront mutations so far.
    #[serde(default)]
    pub execution_attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Storage version, for optimistic concurrency.
    #[serde(default)]
    pub version: i64,
}

impl NextMove {
    /// A freshly selected move whose initial status is the gate's verdict.
    pub(crate) fn select(
        id: String,
        merchant_id: &str,
        opportunity: Opportunity,
        verdict: Verdict,
        now: OffsetDateTime,
    ) -> Self {
        let authorized_at = (!verdict.is_blocked()).then_some(now);
        let approval_pending = verdict == Verdict::AwaitingApproval;
        Self {
            id,
            merchant_id: merchant_id.to_string(),
            credit_value_ratio: opportunity.credit_value_ratio(),
            opportunity,
            status: verdict.into_status(),
            rollback_available: false,
            selected_at: now,
            authorized_at,
            execution_started_at: None,
            executed_at: None,
            monitoring_deadline: None,
            completed_at: None,
            rolled_back_at: None,
            declined_at: None,
            expired_at: None,
            approval_pending,
            execution_attempts: 0,
            last_error: None,
            version: 0,
        }
    }

    /// Apply a lifecycle event and stamp the matching timestamp.
    ///
    /// Returns whether the status changed.
    pub fn transition(
        &mut self,
        event: Transition,
        now: OffsetDateTime,
    ) -> Result<bool, IllegalTransition> {
        let failure = match &event {
            Transition::ApplyFailed { reason } => Some(reason.clone()),
            _ => None,
        };
        let approved = event == Transition::Approve;
        let event = match event {
            Transition::Authorized(Verdict::Ready) if self.approval_pending => {
                Transition::Authorized(Verdict::AwaitingApproval)
            }
            other => other,
        };
        let next = self.status.apply(event)?;
        if next == self.status {
            return Ok(false);
        }

        match &next {
            NextMoveStatus::Ready => {
                self.authorized_at = Some(now);
            }
            NextMoveStatus::AwaitingApproval => {
                self.authorized_at = Some(now);
                self.approval_pending = true;
            }
            NextMoveStatus::Executing => {
                self.rollback_available = true;
                self.execution_started_at = Some(now);
                if approved {
                    self.approval_pending = false;
                }
            }
            NextMoveStatus::Monitoring => {
                self.executed_at = Some(now);
            }
            NextMoveStatus::Completed => {
                self.completed_at = Some(now);
            }
            NextMoveStatus::RolledBack { .. } => {
                self.rolled_back_at = Some(now);
                self.rollback_available = false;
            }
            NextMoveStatus::Declined => {
                self.declined_at = Some(now);
            }
            NextMoveStatus::Expired => {
                self.expired_at = Some(now);
            }
            NextMoveStatus::Blocked { .. } | NextMoveStatus::Failed { .. } => {}
        }
        if let Some(reason) = failure {
            self.execution_attempts += 1;
            self.last_error = Some(reason);
            self.rollback_available = false;
            self.monitoring_deadline = None;
        }
        self.status = next;
        Ok(true)
    }

    pub fn blocked_reason(&self) -> Option<&str> {
        self.status.blocked_reason()
    }

    pub(crate) fn to_record(&self, now: OffsetDateTime) -> Result<NextMoveRecord, EngineError> {
        let body = serde_json::to_value(self).map_err(|e| EngineError::Corrupt {
            id: self.id.clone(),
            message: e.to_string(),
        })?;
        Ok(NextMoveRecord {
            id: self.id.clone(),
            merchant_id: self.merchant_id.clone(),
            opportunity_id: self.opportunity.id.clone(),
            status: self.status.name().to_string(),
            version: self.version,
            updated_at: iso8601(now),
            body,
        })
    }

    pub(crate) fn from_record(record: NextMoveRecord) -> Result<Self, EngineError> {
        let mut next_move: NextMove =
            serde_json::from_value(record.body).map_err(|e| EngineError::Corrupt {
                id: record.id.clone(),
                message: e.to_string(),
            })?;
        next_move.version = record.version;
        Ok(next_move)
    }
}
