//! In-memory `EngineStorage` backend.
//!
//! Each snapshot works on a private copy of the tables taken at
//! `begin_snapshot` and records every write it stages. `commit_snapshot`
//! replays the recorded writes against the committed tables under a single
//! lock, re-checking every version and head precondition, and publishes the
//! result only if all of them still hold. That gives the same observable
//! behavior as `UPDATE ... WHERE version = ?` inside a SQL transaction:
//! of two snapshots racing on the same row, exactly one commits.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{LedgerRecord, NextMoveRecord, RollbackSnapshotRecord};
use crate::traits::EngineStorage;

#[derive(Debug, Clone, Default)]
struct Tables {
    ledgers: BTreeMap<String, LedgerRecord>,
    next_moves: BTreeMap<String, NextMoveRecord>,
    /// merchant_id -> next move ids, oldest first. The last id is the head.
    order: BTreeMap<String, Vec<String>>,
    rollback_snapshots: BTreeMap<String, RollbackSnapshotRecord>,
}

#[derive(Debug, Clone)]
enum Write {
    InitializeLedger(LedgerRecord),
    UpdateLedger {
        merchant_id: String,
        expected_version: i64,
        remaining: i64,
        last_reset_at: Option<String>,
    },
    InsertNextMove {
        record: NextMoveRecord,
        expected_head: Option<String>,
    },
    UpdateNextMove {
        record: NextMoveRecord,
        expected_version: i64,
    },
    PruneNextMoves {
        merchant_id: String,
        keep: usize,
    },
    InsertSnapshot(RollbackSnapshotRecord),
    ClaimSnapshot(String),
    ReleaseSnapshot(String),
    DeleteSnapshot(String),
}

impl Tables {
    fn apply(&mut self, write: &Write) -> Result<(), StorageError> {
        match write {
            Write::InitializeLedger(record) => {
                if self.ledgers.contains_key(&record.merchant_id) {
                    return Err(StorageError::AlreadyInitialized {
                        merchant_id: record.merchant_id.clone(),
                    });
                }
                let mut record = record.clone();
                record.version = 0;
                self.ledgers.insert(record.merchant_id.clone(), record);
            }
            Write::UpdateLedger {
                merchant_id,
                expected_version,
                remaining,
                last_reset_at,
            } => {
                let row = self.ledgers.get_mut(merchant_id).ok_or_else(|| {
                    StorageError::LedgerNotFound {
                        merchant_id: merchant_id.clone(),
                    }
                })?;
                if row.version != *expected_version {
                    return Err(StorageError::ConcurrentConflict {
                        resource: format!("ledger/{}", merchant_id),
                        expected_version: *expected_version,
                    });
                }
                row.remaining = *remaining;
                if let Some(at) = last_reset_at {
                    row.last_reset_at = at.clone();
                }
                row.version += 1;
            }
            Write::InsertNextMove {
                record,
                expected_head,
            } => {
                if self.next_moves.contains_key(&record.id) {
                    return Err(StorageError::DuplicateNextMove {
                        next_move_id: record.id.clone(),
                    });
                }
                let order = self.order.entry(record.merchant_id.clone()).or_default();
                let found = order.last().cloned();
                if found.as_deref() != expected_head.as_deref() {
                    return Err(StorageError::HeadMoved {
                        merchant_id: record.merchant_id.clone(),
                        expected: expected_head.clone(),
                        found,
                    });
                }
                order.push(record.id.clone());
                let mut record = record.clone();
                record.version = 0;
                self.next_moves.insert(record.id.clone(), record);
            }
            Write::UpdateNextMove {
                record,
                expected_version,
            } => {
                let row = self.next_moves.get_mut(&record.id).ok_or_else(|| {
                    StorageError::NextMoveNotFound {
                        next_move_id: record.id.clone(),
                    }
                })?;
                if row.version != *expected_version {
                    return Err(StorageError::ConcurrentConflict {
                        resource: format!("next_move/{}", record.id),
                        expected_version: *expected_version,
                    });
                }
                let mut record = record.clone();
                record.version = expected_version + 1;
                *row = record;
            }
            Write::PruneNextMoves { merchant_id, keep } => {
                self.prune(merchant_id, *keep);
            }
            Write::InsertSnapshot(record) => {
                if self.rollback_snapshots.contains_key(&record.next_move_id) {
                    return Err(StorageError::DuplicateSnapshot {
                        next_move_id: record.next_move_id.clone(),
                    });
                }
                self.rollback_snapshots
                    .insert(record.next_move_id.clone(), record.clone());
            }
            Write::ClaimSnapshot(id) => {
                let snap = self.snapshot_mut(id)?;
                if snap.consumed {
                    return Err(StorageError::SnapshotConsumed {
                        next_move_id: id.clone(),
                    });
                }
                snap.consumed = true;
            }
            Write::ReleaseSnapshot(id) => {
                self.snapshot_mut(id)?.consumed = false;
            }
            Write::DeleteSnapshot(id) => {
                if self.rollback_snapshots.remove(id).is_none() {
                    return Err(StorageError::SnapshotNotFound {
                        next_move_id: id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn snapshot_mut(&mut self, id: &str) -> Result<&mut RollbackSnapshotRecord, StorageError> {
        self.rollback_snapshots
            .get_mut(id)
            .ok_or_else(|| StorageError::SnapshotNotFound {
                next_move_id: id.to_string(),
            })
    }

    fn prune(&mut self, merchant_id: &str, keep: usize) -> usize {
        let Some(order) = self.order.get_mut(merchant_id) else {
            return 0;
        };
        // The head always survives.
        let keep = keep.max(1);
        if order.len() <= keep {
            return 0;
        }
        let excess = order.len() - keep;
        let removed: Vec<String> = order.drain(..excess).collect();
        for id in &removed {
            self.next_moves.remove(id);
            self.rollback_snapshots.remove(id);
        }
        removed.len()
    }
}

/// Snapshot (transaction) handle for [`InMemoryStorage`].
#[derive(Debug)]
pub struct MemorySnapshot {
    working: Tables,
    writes: Vec<Write>,
}

impl MemorySnapshot {
    fn stage(&mut self, write: Write) -> Result<(), StorageError> {
        self.working.apply(&write)?;
        self.writes.push(write);
        Ok(())
    }
}

/// Process-local storage backend, used by tests, the CLI `cycle` command,
/// and single-node deployments that do not need durability.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables
            .lock()
            .map_err(|_| StorageError::Backend("in-memory tables poisoned".to_string()))
    }
}

#[async_trait]
impl EngineStorage for InMemoryStorage {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        let working = self.lock()?.clone();
        Ok(MemorySnapshot {
            working,
            writes: Vec::new(),
        })
    }

    async fn commit_snapshot(&self, snapshot: MemorySnapshot) -> Result<(), StorageError> {
        let mut committed = self.lock()?;
        let mut next = committed.clone();
        for write in &snapshot.writes {
            next.apply(write)?;
        }
        *committed = next;
        Ok(())
    }

    async fn abort_snapshot(&self, _snapshot: MemorySnapshot) -> Result<(), StorageError> {
        Ok(())
    }

    async fn initialize_ledger(
        &self,
        snapshot: &mut MemorySnapshot,
        record: LedgerRecord,
    ) -> Result<(), StorageError> {
        snapshot.stage(Write::InitializeLedger(record))
    }

    async fn get_ledger_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        merchant_id: &str,
    ) -> Result<LedgerRecord, StorageError> {
        snapshot
            .working
            .ledgers
            .get(merchant_id)
            .cloned()
            .ok_or_else(|| StorageError::LedgerNotFound {
                merchant_id: merchant_id.to_string(),
            })
    }

    async fn update_ledger(
        &self,
        snapshot: &mut MemorySnapshot,
        merchant_id: &str,
        expected_version: i64,
        remaining: i64,
        last_reset_at: Option<&str>,
    ) -> Result<i64, StorageError> {
        snapshot.stage(Write::UpdateLedger {
            merchant_id: merchant_id.to_string(),
            expected_version,
            remaining,
            last_reset_at: last_reset_at.map(str::to_string),
        })?;
        Ok(expected_version + 1)
    }

    async fn insert_next_move(
        &self,
        snapshot: &mut MemorySnapshot,
        record: NextMoveRecord,
        expected_head: Option<&str>,
    ) -> Result<(), StorageError> {
        snapshot.stage(Write::InsertNextMove {
            record,
            expected_head: expected_head.map(str::to_string),
        })
    }

    async fn update_next_move(
        &self,
        snapshot: &mut MemorySnapshot,
        record: NextMoveRecord,
        expected_version: i64,
    ) -> Result<i64, StorageError> {
        snapshot.stage(Write::UpdateNextMove {
            record,
            expected_version,
        })?;
        Ok(expected_version + 1)
    }

    async fn prune_next_moves(
        &self,
        snapshot: &mut MemorySnapshot,
        merchant_id: &str,
        keep: usize,
    ) -> Result<usize, StorageError> {
        let removed = snapshot.working.clone().prune(merchant_id, keep);
        snapshot.stage(Write::PruneNextMoves {
            merchant_id: merchant_id.to_string(),
            keep,
        })?;
        Ok(removed)
    }

    async fn insert_rollback_snapshot(
        &self,
        snapshot: &mut MemorySnapshot,
        record: RollbackSnapshotRecord,
    ) -> Result<(), StorageError> {
        snapshot.stage(Write::InsertSnapshot(record))
    }

    async fn claim_rollback_snapshot(
        &self,
        snapshot: &mut MemorySnapshot,
        next_move_id: &str,
    ) -> Result<RollbackSnapshotRecord, StorageError> {
        snapshot.stage(Write::ClaimSnapshot(next_move_id.to_string()))?;
        snapshot.working.snapshot_mut(next_move_id).map(|s| s.clone())
    }

    async fn release_rollback_snapshot(
        &self,
        snapshot: &mut MemorySnapshot,
        next_move_id: &str,
    ) -> Result<(), StorageError> {
        snapshot.stage(Write::ReleaseSnapshot(next_move_id.to_string()))
    }

    async fn delete_rollback_snapshot(
        &self,
        snapshot: &mut MemorySnapshot,
        next_move_id: &str,
    ) -> Result<(), StorageError> {
        snapshot.stage(Write::DeleteSnapshot(next_move_id.to_string()))
    }

    async fn get_ledger(&self, merchant_id: &str) -> Result<LedgerRecord, StorageError> {
        self.lock()?
            .ledgers
            .get(merchant_id)
            .cloned()
            .ok_or_else(|| StorageError::LedgerNotFound {
                merchant_id: merchant_id.to_string(),
            })
    }

    async fn get_next_move(&self, next_move_id: &str) -> Result<NextMoveRecord, StorageError> {
        self.lock()?
            .next_moves
            .get(next_move_id)
            .cloned()
            .ok_or_else(|| StorageError::NextMoveNotFound {
                next_move_id: next_move_id.to_string(),
            })
    }

    async fn head_next_move(
        &self,
        merchant_id: &str,
    ) -> Result<Option<NextMoveRecord>, StorageError> {
        let tables = self.lock()?;
        Ok(tables
            .order
            .get(merchant_id)
            .and_then(|ids| ids.last())
            .and_then(|id| tables.next_moves.get(id))
            .cloned())
    }

    async fn list_next_moves(
        &self,
        merchant_id: &str,
        limit: usize,
    ) -> Result<Vec<NextMoveRecord>, StorageError> {
        let tables = self.lock()?;
        let Some(ids) = tables.order.get(merchant_id) else {
            return Ok(Vec::new());
        };
        let limit = if limit == 0 { ids.len() } else { limit };
        Ok(ids
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| tables.next_moves.get(id).cloned())
            .collect())
    }

    async fn list_merchants(&self) -> Result<Vec<String>, StorageError> {
        let tables = self.lock()?;
        Ok(tables
            .order
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(merchant, _)| merchant.clone())
            .collect())
    }

    async fn get_rollback_snapshot(
        &self,
        next_move_id: &str,
    ) -> Result<Option<RollbackSnapshotRecord>, StorageError> {
        Ok(self.lock()?.rollback_snapshots.get(next_move_id).cloned())
    }
}
