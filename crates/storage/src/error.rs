/// All errors that can be returned by an `EngineStorage` implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: another snapshot modified the
    /// row first. The expected version was not found.
    #[error("concurrent conflict on {resource}: expected version {expected_version}")]
    ConcurrentConflict {
        resource: String,
        expected_version: i64,
    },

    /// The merchant's head next move changed since it was read.
    #[error(
        "head next move for merchant {merchant_id} moved: expected {expected:?}, found {found:?}"
    )]
    HeadMoved {
        merchant_id: String,
        expected: Option<String>,
        found: Option<String>,
    },

    /// No credit ledger row exists for the merchant.
    #[error("credit ledger not found: {merchant_id}")]
    LedgerNotFound { merchant_id: String },

    /// A credit ledger row already exists for the merchant.
    #[error("credit ledger already initialized: {merchant_id}")]
    AlreadyInitialized { merchant_id: String },

    /// No next move record with the given id.
    #[error("next move not found: {next_move_id}")]
    NextMoveNotFound { next_move_id: String },

    /// A next move record with this id already exists.
    #[error("next move already exists: {next_move_id}")]
    DuplicateNextMove { next_move_id: String },

    /// No rollback snapshot stored for the next move.
    #[error("rollback snapshot not found for next move {next_move_id}")]
    SnapshotNotFound { next_move_id: String },

    /// The rollback snapshot was already claimed by a revert.
    #[error("rollback snapshot for next move {next_move_id} already consumed")]
    SnapshotConsumed { next_move_id: String },

    /// A rollback snapshot for this next move already exists.
    #[error("rollback snapshot for next move {next_move_id} already exists")]
    DuplicateSnapshot { next_move_id: String },

    /// A backend-specific storage error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// True for errors a caller may resolve by re-reading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::ConcurrentConflict { .. } | StorageError::HeadMoved { .. }
        )
    }
}
