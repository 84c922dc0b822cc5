pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::{InMemoryStorage, MemorySnapshot};
pub use record::{LedgerRecord, NextMoveRecord, RollbackSnapshotRecord};
pub use traits::EngineStorage;
