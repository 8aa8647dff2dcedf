//! Core traits for storage abstraction
//!
//! The concurrency layer validates and applies transactions against the
//! `Storage` trait, so the in-memory version store can be swapped without
//! touching commit logic.

use crate::error::Result;
use crate::types::{Key, SequenceNumber};
use crate::value::{VersionedValue, WriteOp};

/// Multi-version storage abstraction
///
/// Implementations keep every version a live snapshot may still need.
/// All methods must be safe to call concurrently from multiple threads.
///
/// The storage layer does not allocate sequence numbers; callers apply
/// batches with a sequence they obtained from the sequence authority.
pub trait Storage: Send + Sync {
    /// Newest version of `key` with sequence <= `max_sequence`
    ///
    /// Returns tombstones as-is; callers decide how a delete reads.
    fn get_at(&self, key: &Key, max_sequence: SequenceNumber) -> Result<Option<VersionedValue>>;

    /// Sequence of the most recent commit that touched `key`, tombstones included
    ///
    /// Used by commit-time validation. Returns None if the key was never written.
    fn latest_sequence(&self, key: &Key) -> Result<Option<SequenceNumber>>;

    /// Apply a batch of writes at a single sequence number
    ///
    /// The batch must not become visible to readers until the caller
    /// publishes `sequence` as visible.
    fn apply_batch(&self, ops: &[WriteOp], sequence: SequenceNumber) -> Result<()>;

    /// All live (non-deleted) key/value pairs visible at `max_sequence`, in key order
    fn scan_at(&self, max_sequence: SequenceNumber) -> Result<Vec<(Key, Vec<u8>)>>;
}
