//! Next move reads and version-checked writes.

use nextmove_storage::{EngineStorage, StorageError};
use time::OffsetDateTime;

use crate::error::EngineError;
use crate::next_move::NextMove;

pub(crate) const MAX_CONFLICT_RETRIES: usize = 5;

pub(crate) async fn load<S: EngineStorage>(
    storage: &S,
    next_move_id: &str,
) -> Result<NextMove, EngineError> {
    match storage.get_next_move(next_move_id).await {
        Ok(record) => NextMove::from_record(record),
        Err(StorageError::NextMoveNotFound { .. }) => {
            Err(EngineError::NotFound(next_move_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn head<S: EngineStorage>(
    storage: &S,
    merchant_id: &str,
) -> Result<Option<NextMove>, EngineError> {
    storage
        .head_next_move(merchant_id)
        .await?
        .map(NextMove::from_record)
        .transpose()
}

pub(crate) async fn history<S: EngineStorage>(
    storage: &S,
    merchant_id: &str,
    limit: usize,
) -> Result<Vec<NextMove>, EngineError> {
    storage
        .list_next_moves(merchant_id, limit)
        .await?
        .into_iter()
        .map(NextMove::from_record)
        .collect()
}

/// Stage a version-checked update of `next_move`. Returns the new version.
pub(crate) async fn stage_update<S: EngineStorage>(
    storage: &S,
    snapshot: &mut S::Snapshot,
    next_move: &NextMove,
    now: OffsetDateTime,
) -> Result<i64, EngineError> {
    let record = next_move.to_record(now)?;
    Ok(storage
        .update_next_move(snapshot, record, next_move.version)
        .await?)
}

/// Write `next_move` in its own snapshot and bump its version.
pub(crate) async fn save<S: EngineStorage>(
    storage: &S,
    next_move: &mut NextMove,
    now: OffsetDateTime,
) -> Result<(), EngineError> {
    let mut snapshot = storage.begin_snapshot().await?;
    let version = match stage_update(storage, &mut snapshot, next_move, now).await {
        Ok(version) => version,
        Err(e) => {
            let _ = storage.abort_snapshot(snapshot).await;
            return Err(e);
        }
    };
    storage.commit_snapshot(snapshot).await?;
    next_move.version = version;
    Ok(())
}

pub(crate) fn is_conflict(err: &EngineError) -> bool {
    matches!(err, EngineError::Storage(e) if e.is_conflict())
}
