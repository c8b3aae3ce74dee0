//! Boundary to the storage engine collaborator: the durable key/value store that owns
//! the partition's data. The engine drives its write path but never reaches around it.

mod in_memory;

pub use in_memory::InMemorySnapshot;
pub use in_memory::InMemoryStorage;

use crate::consensus::Index;
use bytes::Bytes;

/// StorageEngine is the handle the engine holds onto one storage partition.
///
/// Writes only ever flow through the log applier, one apply at a time. Reads may happen
/// concurrently from any task. `Snapshot` is the engine's own durable representation of
/// a point-in-time capture; this crate treats it as opaque and only carries it.
pub trait StorageEngine: Send + Sync + 'static {
    type Snapshot: Clone + Send + Sync + 'static;

    fn put(&self, key: Bytes, value: Bytes) -> Result<(), StorageError>;

    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, StorageError>;

    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;

    /// Capture a self-consistent point-in-time view of the partition. Must not block
    /// concurrent readers for the duration of the capture.
    fn consistent_snapshot_read(&self) -> Result<Self::Snapshot, StorageError>;

    /// Replace the partition's content wholesale. Concurrent readers observe either the
    /// fully-pre-snapshot or fully-post-snapshot state, never a mix.
    fn restore_from_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Durably note that everything up to `index` has been applied to this partition.
    /// Written as part of the same apply step as the data it covers, and captured by
    /// snapshots, so the watermark can never claim more than the data shows.
    fn record_applied(&self, index: Index) -> Result<(), StorageError>;

    /// The watermark last recorded, surviving restart. `None` on a blank partition.
    fn applied_watermark(&self) -> Result<Option<Index>, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage engine I/O failure: {0}")]
    Io(String),
}
