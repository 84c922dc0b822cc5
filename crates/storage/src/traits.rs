use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{LedgerRecord, NextMoveRecord, RollbackSnapshotRecord};

/// The storage trait for next-move engine backends.
///
/// An `EngineStorage` implementation provides durable, transactional storage
/// for credit ledgers, next move records, and rollback snapshots.
///
/// ## Snapshot Semantics
///
/// All mutating operations take `&mut Self::Snapshot`, a type representing an
/// in-progress transaction. The lifecycle is:
///
/// 1. `begin_snapshot()`: start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)`: commit and consume the transaction
///    OR `abort_snapshot(snapshot)`: roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, its writes MUST be
/// discarded. Commit is all-or-nothing.
///
/// ## OCC Conflict Detection
///
/// `update_ledger` and `update_next_move` are conditional on
/// `version = expected_version`. A mismatch, whether detected when the write
/// is staged or when the snapshot commits, returns
/// `Err(StorageError::ConcurrentConflict { .. })` and nothing in the snapshot
/// becomes visible.
///
/// `insert_next_move` is conditional on the merchant's current head next move
/// (compare-and-set), which is what keeps at most one active next move per
/// merchant without a global lock.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be used in axum
/// application state and across async task boundaries.
#[async_trait]
pub trait EngineStorage: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all mutations durable.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all mutations.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Credit ledger ─────────────────────────────────────────────────────────

    /// Create a merchant's ledger row. The record's `version` is ignored and
    /// stored as 0.
    ///
    /// Returns `Err(StorageError::AlreadyInitialized)` if the row exists.
    async fn initialize_ledger(
        &self,
        snapshot: &mut Self::Snapshot,
        record: LedgerRecord,
    ) -> Result<(), StorageError>;

    /// Read a ledger row as seen by the snapshot (including its own writes).
    async fn get_ledger_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        merchant_id: &str,
    ) -> Result<LedgerRecord, StorageError>;

    /// Version-validated update of a ledger row. `last_reset_at` is left
    /// unchanged when `None`.
    ///
    /// Returns the new version number on success.
    async fn update_ledger(
        &self,
        snapshot: &mut Self::Snapshot,
        merchant_id: &str,
        expected_version: i64,
        remaining: i64,
        last_reset_at: Option<&str>,
    ) -> Result<i64, StorageError>;

    // ── Next moves ────────────────────────────────────────────────────────────

    /// Insert a new next move and make it the merchant's head.
    ///
    /// Fails with `HeadMoved` unless the merchant's current head id equals
    /// `expected_head` (`None` = merchant has no next moves yet).
    async fn insert_next_move(
        &self,
        snapshot: &mut Self::Snapshot,
        record: NextMoveRecord,
        expected_head: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Version-validated replacement of a next move record.
    ///
    /// Returns the new version number on success.
    async fn update_next_move(
        &self,
        snapshot: &mut Self::Snapshot,
        record: NextMoveRecord,
        expected_version: i64,
    ) -> Result<i64, StorageError>;

    /// Drop the oldest next moves of a merchant beyond the newest `keep`.
    /// The head is never pruned. Returns the number of records removed.
    async fn prune_next_moves(
        &self,
        snapshot: &mut Self::Snapshot,
        merchant_id: &str,
        keep: usize,
    ) -> Result<usize, StorageError>;

    // ── Rollback snapshots ────────────────────────────────────────────────────

    /// Store the pre-execution state of a next move.
    async fn insert_rollback_snapshot(
        &self,
        snapshot: &mut Self::Snapshot,
        record: RollbackSnapshotRecord,
    ) -> Result<(), StorageError>;

    /// Mark a rollback snapshot consumed (compare-and-set).
    ///
    /// Returns `SnapshotConsumed` if a revert already claimed it.
    async fn claim_rollback_snapshot(
        &self,
        snapshot: &mut Self::Snapshot,
        next_move_id: &str,
    ) -> Result<RollbackSnapshotRecord, StorageError>;

    /// Undo a claim after the external revert failed.
    async fn release_rollback_snapshot(
        &self,
        snapshot: &mut Self::Snapshot,
        next_move_id: &str,
    ) -> Result<(), StorageError>;

    /// Discard a rollback snapshot.
    async fn delete_rollback_snapshot(
        &self,
        snapshot: &mut Self::Snapshot,
        next_move_id: &str,
    ) -> Result<(), StorageError>;

    // ── Query operations (outside snapshot, committed state only) ─────────────

    /// Read a merchant's ledger row.
    ///
    /// Returns `Err(StorageError::LedgerNotFound)` if the row does not exist.
    async fn get_ledger(&self, merchant_id: &str) -> Result<LedgerRecord, StorageError>;

    /// Read a next move by id.
    ///
    /// Returns `Err(StorageError::NextMoveNotFound)` if not found.
    async fn get_next_move(&self, next_move_id: &str) -> Result<NextMoveRecord, StorageError>;

    /// The merchant's most recently inserted next move, if any.
    async fn head_next_move(
        &self,
        merchant_id: &str,
    ) -> Result<Option<NextMoveRecord>, StorageError>;

    /// A merchant's next moves, newest first (`limit` 0 = no limit).
    async fn list_next_moves(
        &self,
        merchant_id: &str,
        limit: usize,
    ) -> Result<Vec<NextMoveRecord>, StorageError>;

    /// Every merchant that has at least one next move, sorted.
    async fn list_merchants(&self) -> Result<Vec<String>, StorageError>;

    /// Read the rollback snapshot for a next move, if one is retained.
    async fn get_rollback_snapshot(
        &self,
        next_move_id: &str,
    ) -> Result<Option<RollbackSnapshotRecord>, StorageError>;
}
