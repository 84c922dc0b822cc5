use serde::{Deserialize, Serialize};

/// A merchant's credit ledger row.
///
/// Invariant maintained by writers: `0 <= remaining <= monthly_limit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub merchant_id: String,
    pub monthly_limit: i64,
    pub remaining: i64,
    /// RFC 3339 timestamp string.
    pub last_reset_at: String,
    pub version: i64,
}

/// A persisted next move.
///
/// The indexed columns (`merchant_id`, `opportunity_id`, `status`) are
/// duplicated out of `body`, which holds the full serialized next move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextMoveRecord {
    pub id: String,
    pub merchant_id: String,
    pub opportunity_id: String,
    pub status: String,
    pub version: i64,
    /// RFC 3339 timestamp string.
    pub updated_at: String,
    pub body: serde_json::Value,
}

/// Pre-execution state captured so an executed action can be undone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackSnapshotRecord {
    pub next_move_id: String,
    pub merchant_id: String,
    /// RFC 3339 timestamp string.
    pub captured_at: String,
    pub prior_state: serde_json::Value,
    /// Set once a revert has claimed the snapshot.
    pub consumed: bool,
}
