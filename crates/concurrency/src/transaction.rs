//! Transaction context for OCC
//!
//! TransactionContext tracks everything a transaction needs for commit-time
//! validation:
//! - read-set: keys read with `get_for_update`, each with its anchor sequence
//! - observed-set: keys read with plain `get`
//! - write buffer: ordered puts and deletes, applied as one batch at commit
//!
//! A plain read does not protect a key by itself. If the transaction later
//! writes a key it observed, the observation is promoted into the read-set
//! with its original anchor: the write was derived from a value that may be
//! stale. Keys written without any prior read are never validated, so blind
//! writes do not conflict.
//!
//! Every recorded anchor stays covered by a snapshot the context holds. A
//! snapshot replaced by `set_snapshot`, or an explicit read snapshot, is
//! kept until the transaction finishes, so garbage collection never prunes
//! a version that commit-time validation still compares against.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use cumulus_core::{Error, Key, SequenceNumber, WriteOp};
use cumulus_storage::Snapshot;

use crate::validation::ValidationResult;

/// Error type for commit failures
#[derive(Debug, Clone)]
pub enum CommitError {
    /// Transaction aborted because a read-set key changed after its anchor
    ValidationFailed(ValidationResult),

    /// Transaction was not Active
    InvalidState(String),

    /// Applying the write batch to the store failed
    StorageError(String),
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitError::ValidationFailed(result) => {
                write!(f, "Commit failed: {} conflict(s)", result.conflict_count())?;
                if let Some(first) = result.conflicts.first() {
                    write!(f, ", first on {}", first.key())?;
                }
                Ok(())
            }
            CommitError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            CommitError::StorageError(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for CommitError {}

impl From<CommitError> for Error {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::ValidationFailed(_) => Error::Busy(e.to_string()),
            CommitError::InvalidState(msg) => Error::InvalidOperation(msg),
            CommitError::StorageError(msg) => {
                Error::Io(std::io::Error::new(std::io::ErrorKind::Other, msg))
            }
        }
    }
}

/// Transaction lifecycle
///
/// ```text
/// Active -> Committed
///        -> Aborted     (rollback, or commit failed to apply)
///        -> Conflicted  (validation failed, commit returned Busy)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Transaction is executing, can read/write
    Active,
    /// Transaction committed successfully
    Committed,
    /// Transaction was rolled back or failed to apply
    Aborted {
        /// Human-readable reason for abort
        reason: String,
    },
    /// Commit-time validation found a conflict
    Conflicted,
}

/// State of one optimistic transaction
///
/// Owned by a single caller thread. The context never touches shared state
/// itself; the transaction manager reads its buffers at commit.
#[derive(Debug)]
pub struct TransactionContext {
    /// Unique transaction id, for logging
    pub txn_id: u64,

    /// Current lifecycle state
    pub status: TransactionStatus,

    snapshot: Option<Snapshot>,
    held: Vec<Snapshot>,
    read_set: BTreeMap<Key, SequenceNumber>,
    observed: BTreeMap<Key, SequenceNumber>,
    writes: Vec<WriteOp>,
    latest_write: HashMap<Key, usize>,
}

impl TransactionContext {
    /// New Active transaction, optionally pinned to `snapshot`
    pub fn new(txn_id: u64, snapshot: Option<Snapshot>) -> Self {
        TransactionContext {
            txn_id,
            status: TransactionStatus::Active,
            snapshot,
            held: Vec::new(),
            read_set: BTreeMap::new(),
            observed: BTreeMap::new(),
            writes: Vec::new(),
            latest_write: HashMap::new(),
        }
    }

    /// True while reads and writes are allowed
    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }

    /// Fail with `InvalidOperation` unless the transaction is Active
    pub fn ensure_active(&self) -> cumulus_core::Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "transaction {} is {:?}",
                self.txn_id, self.status
            )))
        }
    }

    /// The snapshot currently anchoring this transaction, if pinned
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Replace the anchoring snapshot
    ///
    /// Only affects anchors recorded from now on; existing read-set and
    /// observed-set entries keep their sequences. The replaced snapshot
    /// stays pinned while any entry may still refer to it.
    pub fn set_snapshot(&mut self, snapshot: Snapshot) {
        if let Some(previous) = self.snapshot.replace(snapshot) {
            if !self.read_set.is_empty() || !self.observed.is_empty() {
                self.hold(previous);
            }
        }
    }

    /// Keep `snapshot` pinned until commit or rollback
    pub fn hold(&mut self, snapshot: Snapshot) {
        let sequence = snapshot.sequence();
        let pinned = self.snapshot.as_ref().map(Snapshot::sequence) == Some(sequence)
            || self.held.iter().any(|s| s.sequence() == sequence);
        if !pinned {
            self.held.push(snapshot);
        }
    }

    /// Oldest sequence this transaction keeps pinned
    pub fn oldest_pinned(&self) -> Option<SequenceNumber> {
        self.held
            .iter()
            .chain(self.snapshot.as_ref())
            .map(Snapshot::sequence)
            .min()
    }

    /// Anchor sequence for a read, pinning a snapshot on first use
    pub fn anchor_with(&mut self, pin: impl FnOnce() -> Snapshot) -> SequenceNumber {
        self.snapshot.get_or_insert_with(pin).sequence()
    }

    /// Buffered state of `key`
    ///
    /// `None` if the transaction has not written the key, `Some(None)` if
    /// its last write was a delete, `Some(Some(value))` for a put.
    pub fn buffered(&self, key: &Key) -> Option<Option<&[u8]>> {
        self.latest_write.get(key).map(|&i| match &self.writes[i] {
            WriteOp::Put { value, .. } => Some(value.as_slice()),
            WriteOp::Delete { .. } => None,
        })
    }

    /// Record a `get_for_update`; the first anchor for a key wins
    pub fn record_read(&mut self, key: Key, anchor: SequenceNumber) {
        self.read_set.entry(key).or_insert(anchor);
    }

    /// Record a plain `get`; the first anchor for a key wins
    pub fn record_observed(&mut self, key: Key, anchor: SequenceNumber) {
        self.observed.entry(key).or_insert(anchor);
    }

    /// Buffer a put
    pub fn put(&mut self, key: Key, value: Vec<u8>) -> cumulus_core::Result<()> {
        self.ensure_active()?;
        self.buffer(WriteOp::Put { key, value });
        Ok(())
    }

    /// Buffer a delete
    pub fn delete(&mut self, key: Key) -> cumulus_core::Result<()> {
        self.ensure_active()?;
        self.buffer(WriteOp::Delete { key });
        Ok(())
    }

    fn buffer(&mut self, op: WriteOp) {
        let key = op.key().clone();
        if let Some(&anchor) = self.observed.get(&key) {
            self.read_set.entry(key.clone()).or_insert(anchor);
        }
        self.latest_write.insert(key, self.writes.len());
        self.writes.push(op);
    }

    /// Keys validated at commit, with their anchors
    pub fn read_set(&self) -> &BTreeMap<Key, SequenceNumber> {
        &self.read_set
    }

    /// Keys read with plain `get`, with the sequence they were observed at
    pub fn observed_set(&self) -> &BTreeMap<Key, SequenceNumber> {
        &self.observed
    }

    /// Buffered writes in program order
    pub fn write_ops(&self) -> &[WriteOp] {
        &self.writes
    }

    /// True if nothing was written
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Drop all buffers and release the snapshot
    pub fn clear(&mut self) {
        self.read_set.clear();
        self.observed.clear();
        self.writes.clear();
        self.latest_write.clear();
        self.snapshot = None;
        self.held.clear();
    }

    /// Transition to Committed and release buffers
    pub fn mark_committed(&mut self) {
        self.status = TransactionStatus::Committed;
        self.clear();
    }

    /// Transition to Conflicted and release buffers
    pub fn mark_conflicted(&mut self) {
        self.status = TransactionStatus::Conflicted;
        self.clear();
    }

    /// Transition to Aborted and release buffers
    pub fn mark_aborted(&mut self, reason: impl Into<String>) {
        self.status = TransactionStatus::Aborted {
            reason: reason.into(),
        };
        self.clear();
    }
}
