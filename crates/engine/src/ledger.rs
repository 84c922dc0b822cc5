//! Credit ledger.
//!
//! One row per merchant: monthly limit, remaining balance, last reset. The
//! balance stays within `[0, limit]`: a debit larger than the balance is
//! refused with [`DebitOutcome::InsufficientBalance`], and a refund never
//! raises it above the limit.
//!
//! Every write is version-checked. Standalone operations retry a bounded
//! number of times on conflict; `stage_*` variants write into a caller's
//! snapshot so a debit can commit together with other records.

use std::sync::Arc;

use nextmove_storage::{EngineStorage, LedgerRecord};
use serde::Serialize;
use tracing::{debug, info};

use crate::clock::{iso8601, Clock};
use crate::error::EngineError;
use crate::persist::MAX_CONFLICT_RETRIES;

/// A merchant's credit position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub merchant_id: String,
    pub remaining: u32,
    pub limit: u32,
    pub last_reset_at: String,
}

impl From<&LedgerRecord> for Balance {
    fn from(row: &LedgerRecord) -> Self {
        Balance {
            merchant_id: row.merchant_id.clone(),
            remaining: credits(row.remaining),
            limit: credits(row.monthly_limit),
            last_reset_at: row.last_reset_at.clone(),
        }
    }
}

/// Result of a debit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DebitOutcome {
    Debited { remaining: u32 },
    InsufficientBalance { remaining: u32, required: u32 },
}

fn credits(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// Per-merchant credit balances over an [`EngineStorage`] backend.
pub struct CreditLedger<S: EngineStorage> {
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: EngineStorage> Clone for CreditLedger<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: EngineStorage> CreditLedger<S> {
    pub fn new(storage: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Create a merchant's ledger at full balance.
    pub async fn open(&self, merchant_id: &str, monthly_limit: u32) -> Result<Balance, EngineError> {
        let record = LedgerRecord {
            merchant_id: merchant_id.to_string(),
            monthly_limit: i64::from(monthly_limit),
            remaining: i64::from(monthly_limit),
            last_reset_at: iso8601(self.clock.now()),
            version: 0,
        };
        let mut snapshot = self.storage.begin_snapshot().await?;
        if let Err(e) = self
            .storage
            .initialize_ledger(&mut snapshot, record.clone())
            .await
        {
            let _ = self.storage.abort_snapshot(snapshot).await;
            return Err(e.into());
        }
        self.storage.commit_snapshot(snapshot).await?;
        info!(merchant_id, limit = monthly_limit, "credit ledger opened");
        Ok(Balance::from(&record))
    }

    pub async fn balance(&self, merchant_id: &str) -> Result<Balance, EngineError> {
        let row = self.storage.get_ledger(merchant_id).await?;
        Ok(Balance::from(&row))
    }

    /// Take `amount` credits, or report that the balance is too low.
    pub async fn debit(&self, merchant_id: &str, amount: u32) -> Result<DebitOutcome, EngineError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut snapshot = self.storage.begin_snapshot().await?;
            let outcome = match self.stage_debit(&mut snapshot, merchant_id, amount).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let _ = self.storage.abort_snapshot(snapshot).await;
                    return Err(e);
                }
            };
            if self.commit(snapshot).await? {
                return Ok(outcome);
            }
        }
        Err(conflict(merchant_id))
    }

    /// Return `amount` credits, clamped to the monthly limit.
    pub async fn refund(&self, merchant_id: &str, amount: u32) -> Result<Balance, EngineError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut snapshot = self.storage.begin_snapshot().await?;
            let balance = match self.stage_refund(&mut snapshot, merchant_id, amount).await {
                Ok(balance) => balance,
                Err(e) => {
                    let _ = self.storage.abort_snapshot(snapshot).await;
                    return Err(e);
                }
            };
            if self.commit(snapshot).await? {
                return Ok(balance);
            }
        }
        Err(conflict(merchant_id))
    }

    /// Restore the full monthly limit. Called by the billing cycle.
    pub async fn reset(&self, merchant_id: &str) -> Result<Balance, EngineError> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let mut snapshot = self.storage.begin_snapshot().await?;
            let balance = match self.stage_reset(&mut snapshot, merchant_id).await {
                Ok(balance) => balance,
                Err(e) => {
                    let _ = self.storage.abort_snapshot(snapshot).await;
                    return Err(e);
                }
            };
            if self.commit(snapshot).await? {
                info!(merchant_id, limit = balance.limit, "credit ledger reset");
                return Ok(balance);
            }
        }
        Err(conflict(merchant_id))
    }

    /// Stage a debit in `snapshot`. Nothing is written when the balance is
    /// too low.
    pub(crate) async fn stage_debit(
        &self,
        snapshot: &mut S::Snapshot,
        merchant_id: &str,
        amount: u32,
    ) -> Result<DebitOutcome, EngineError> {
        let row = self
            .storage
            .get_ledger_for_update(snapshot, merchant_id)
            .await?;
        let remaining = credits(row.remaining);
        if remaining < amount {
            return Ok(DebitOutcome::InsufficientBalance {
                remaining,
                required: amount,
            });
        }
        let after = remaining - amount;
        self.storage
            .update_ledger(snapshot, merchant_id, row.version, i64::from(after), None)
            .await?;
        debug!(merchant_id, credits = amount, remaining = after, "debit staged");
        Ok(DebitOutcome::Debited { remaining: after })
    }

    /// Stage a refund in `snapshot`.
    pub(crate) async fn stage_refund(
        &self,
        snapshot: &mut S::Snapshot,
        merchant_id: &str,
        amount: u32,
    ) -> Result<Balance, EngineError> {
        let row = self
            .storage
            .get_ledger_for_update(snapshot, merchant_id)
            .await?;
        let after = row
            .remaining
            .saturating_add(i64::from(amount))
            .min(row.monthly_limit);
        self.storage
            .update_ledger(snapshot, merchant_id, row.version, after, None)
            .await?;
        debug!(merchant_id, credits = amount, remaining = after, "refund staged");
        Ok(Balance {
            merchant_id: merchant_id.to_string(),
            remaining: credits(after),
            limit: credits(row.monthly_limit),
            last_reset_at: row.last_reset_at,
        })
    }

    async fn stage_reset(
        &self,
        snapshot: &mut S::Snapshot,
        merchant_id: &str,
    ) -> Result<Balance, EngineError> {
        let row = self
            .storage
            .get_ledger_for_update(snapshot, merchant_id)
            .await?;
        let stamp = iso8601(self.clock.now());
        self.storage
            .update_ledger(
                snapshot,
                merchant_id,
                row.version,
                row.monthly_limit,
                Some(&stamp),
            )
            .await?;
        Ok(Balance {
            merchant_id: merchant_id.to_string(),
            remaining: credits(row.monthly_limit),
            limit: credits(row.monthly_limit),
            last_reset_at: stamp,
        })
    }

    /// Commit a ledger snapshot. `Ok(false)` means another writer got there
    /// first and the caller should start over.
    async fn commit(&self, snapshot: S::Snapshot) -> Result<bool, EngineError> {
        match self.storage.commit_snapshot(snapshot).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

fn conflict(merchant_id: &str) -> EngineError {
    EngineError::Conflict(format!("ledger/{}", merchant_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use nextmove_storage::{InMemoryStorage, StorageError};
    use time::macros::datetime;

    fn ledger() -> CreditLedger<InMemoryStorage> {
        let clock = Arc::new(ManualClock::new(datetime!(2026-10-01 00:00 UTC)));
        CreditLedger::new(Arc::new(InMemoryStorage::new()), clock)
    }

    #[tokio::test]
    async fn open_starts_at_full_balance() {
        let ledger = ledger();
        let balance = ledger.open("m1", 100).await.unwrap();
        assert_eq!(balance.remaining, 100);
        assert_eq!(balance.limit, 100);
        assert_eq!(balance.last_reset_at, "2026-10-01T00:00:00Z");

        let err = ledger.open("m1", 50).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Storage(StorageError::AlreadyInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn debit_subtracts_exact_cost() {
        let ledger = ledger();
        ledger.open("m1", 20).await.unwrap();
        assert_eq!(
            ledger.debit("m1", 15).await.unwrap(),
            DebitOutcome::Debited { remaining: 5 }
        );
        assert_eq!(ledger.balance("m1").await.unwrap().remaining, 5);
    }

    #[tokio::test]
    async fn debit_never_goes_negative() {
        let ledger = ledger();
        ledger.open("m1", 10).await.unwrap();
        assert_eq!(
            ledger.debit("m1", 15).await.unwrap(),
            DebitOutcome::InsufficientBalance {
                remaining: 10,
                required: 15
            }
        );
        assert_eq!(ledger.balance("m1").await.unwrap().remaining, 10);
    }

    #[tokio::test]
    async fn refund_is_clamped_to_limit() {
        let ledger = ledger();
        ledger.open("m1", 10).await.unwrap();
        ledger.debit("m1", 4).await.unwrap();
        assert_eq!(ledger.refund("m1", 9).await.unwrap().remaining, 10);
    }

    #[tokio::test]
    async fn reset_restores_limit() {
        let ledger = ledger();
        ledger.open("m1", 30).await.unwrap();
        ledger.debit("m1", 30).await.unwrap();
        let balance = ledger.reset("m1").await.unwrap();
        assert_eq!(balance.remaining, 30);
        assert_eq!(ledger.balance("m1").await.unwrap().remaining, 30);
    }

    #[tokio::test]
    async fn unknown_merchant_has_no_ledger() {
        let ledger = ledger();
        let err = ledger.balance("nobody").await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Storage(StorageError::LedgerNotFound { .. })
        ));
    }
}
