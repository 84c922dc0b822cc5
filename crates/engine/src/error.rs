use nextmove_storage::StorageError;

use crate::config::ConfigError;
use crate::connector::ConnectorError;
use crate::next_move::NextMove;
use crate::source::SourceError;
use crate::status::IllegalTransition;

/// Errors returned by engine operations.
///
/// Authorization and readiness failures are not errors: they surface as a
/// `blocked` next move or a `StoreNotReady` view.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("next move not found: {0}")]
    NotFound(String),

    #[error("unknown merchant: {0}")]
    UnknownMerchant(String),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    /// The storefront mutation failed. Credits were refunded and the
    /// snapshot discarded before this was returned; `next_move` is the
    /// persisted, blocked move.
    #[error("execution of next move {next_move_id} failed: {cause}")]
    ExecutionFailed {
        next_move_id: String,
        cause: ConnectorError,
        retryable: bool,
        next_move: Box<NextMove>,
    },

    /// Restoring the snapshot failed; the snapshot is retained and rollback
    /// stays available.
    #[error("rollback of next move {next_move_id} failed: {cause}")]
    RollbackFailed {
        next_move_id: String,
        cause: ConnectorError,
    },

    /// Optimistic concurrency retries were exhausted.
    #[error("concurrent modification of {0}; retry the request")]
    Conflict(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("corrupt next move record {id}: {message}")]
    Corrupt { id: String, message: String },
}

impl EngineError {
    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::ExecutionFailed { retryable, .. } => *retryable,
            EngineError::RollbackFailed { cause, .. } => cause.is_retryable(),
            EngineError::Conflict(_) | EngineError::Source(_) => true,
            EngineError::Storage(e) => e.is_conflict(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_conflicts_are_retryable() {
        let err = EngineError::from(StorageError::ConcurrentConflict {
            resource: "ledger/m1".to_string(),
            expected_version: 3,
        });
        assert!(err.is_retryable());
        assert!(!EngineError::NotFound("nm-1".to_string()).is_retryable());
    }

    #[test]
    fn illegal_transition_message_passes_through() {
        let err = EngineError::from(IllegalTransition {
            from: "declined",
            event: "approve",
        });
        assert_eq!(
            err.to_string(),
            "illegal transition: approve is not allowed from declined"
        );
    }
}
