//! Transaction manager for coordinating commit operations
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. Check the transaction is Active
//! 2. Read-only: mark Committed, no sequence allocated
//! 3. Acquire the commit lock
//! 4. validate_transaction() - check read-set against latest commits
//! 5. IF conflicts: mark Conflicted, return ValidationFailed (Busy)
//! 6. allocate() the commit sequence
//! 7. apply_batch() - write buffer into the store at that sequence
//! 8. publish() - make the sequence visible to readers
//! 9. Release the commit lock, mark Committed
//! ```
//!
//! The commit lock is the single serialization point for writers. Readers
//! never take it: they resolve against the published visible sequence, and
//! a batch applied in step 7 stays invisible until step 8.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cumulus_core::{Result, SequenceNumber, Storage, WriteOp};
use cumulus_storage::{SequenceAuthority, Snapshot, SnapshotList};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::transaction::{CommitError, TransactionContext};
use crate::validation::validate_transaction;

/// Manages transaction lifecycle and atomic commits
pub struct TransactionManager {
    authority: Arc<SequenceAuthority>,
    snapshots: Arc<SnapshotList>,
    commit_lock: Mutex<()>,
    next_txn_id: AtomicU64,
}

impl TransactionManager {
    /// Create a manager over a sequence authority and snapshot registry
    pub fn new(authority: Arc<SequenceAuthority>, snapshots: Arc<SnapshotList>) -> Self {
        TransactionManager {
            authority,
            snapshots,
            commit_lock: Mutex::new(()),
            next_txn_id: AtomicU64::new(1),
        }
    }

    /// The sequence authority commits allocate from
    pub fn authority(&self) -> &Arc<SequenceAuthority> {
        &self.authority
    }

    /// The live snapshot registry
    pub fn snapshots(&self) -> &Arc<SnapshotList> {
        &self.snapshots
    }

    /// Highest visible sequence
    pub fn visible_sequence(&self) -> SequenceNumber {
        self.authority.visible()
    }

    /// Allocate next transaction ID
    pub fn next_txn_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Pin a snapshot at the current visible sequence
    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.acquire(&self.authority)
    }

    /// Pin a snapshot at a commit boundary
    ///
    /// Takes the commit lock so the cut cannot land between another
    /// commit's apply and publish. Used by savepoints; no I/O happens
    /// under the lock.
    pub fn cut(&self) -> Snapshot {
        let _guard = self.commit_lock.lock();
        self.snapshot()
    }

    /// Start a transaction
    ///
    /// With `set_snapshot` the transaction is anchored immediately;
    /// otherwise its snapshot is pinned at the first read.
    pub fn begin(&self, set_snapshot: bool) -> TransactionContext {
        let snapshot = set_snapshot.then(|| self.snapshot());
        TransactionContext::new(self.next_txn_id(), snapshot)
    }

    /// Commit a transaction atomically
    ///
    /// # Returns
    /// - Ok(Some(sequence)) when a write batch was applied
    /// - Ok(None) for a read-only transaction
    /// - Err(CommitError::ValidationFailed) on conflict; nothing applied
    pub fn commit<S: Storage>(
        &self,
        txn: &mut TransactionContext,
        store: &S,
    ) -> std::result::Result<Option<SequenceNumber>, CommitError> {
        if !txn.is_active() {
            return Err(CommitError::InvalidState(format!(
                "transaction {} is {:?}",
                txn.txn_id, txn.status
            )));
        }

        if txn.is_read_only() {
            txn.mark_committed();
            return Ok(None);
        }

        let guard = self.commit_lock.lock();

        let validation = match validate_transaction(txn, store) {
            Ok(v) => v,
            Err(e) => {
                drop(guard);
                txn.mark_aborted(format!("validation failed: {}", e));
                return Err(CommitError::StorageError(e.to_string()));
            }
        };
        if !validation.is_valid() {
            drop(guard);
            debug!(
                txn_id = txn.txn_id,
                conflicts = validation.conflict_count(),
                first_key = %validation.conflicts[0].key(),
                "Commit conflict"
            );
            txn.mark_conflicted();
            return Err(CommitError::ValidationFailed(validation));
        }

        let sequence = self.authority.allocate();
        let applied = store.apply_batch(txn.write_ops(), sequence);
        // Publish even on failure so later commits are not stuck behind a hole
        self.authority.publish(sequence);
        drop(guard);

        match applied {
            Ok(()) => {
                txn.mark_committed();
                Ok(Some(sequence))
            }
            Err(e) => {
                error!(
                    txn_id = txn.txn_id,
                    sequence = sequence.as_u64(),
                    error = %e,
                    "Failed to apply write batch"
                );
                txn.mark_aborted(format!("apply failed: {}", e));
                Err(CommitError::StorageError(e.to_string()))
            }
        }
    }

    /// Apply a batch outside any transaction
    ///
    /// Used by the database's plain `put`/`delete`. Never conflicts.
    pub fn write<S: Storage>(&self, ops: &[WriteOp], store: &S) -> Result<SequenceNumber> {
        let _guard = self.commit_lock.lock();
        let sequence = self.authority.allocate();
        let applied = store.apply_batch(ops, sequence);
        self.authority.publish(sequence);
        applied.map(|()| sequence)
    }

    /// Explicitly abort a transaction
    ///
    /// Discards all buffers. Aborting a transaction that already reached a
    /// terminal state is a no-op.
    pub fn abort(&self, txn: &mut TransactionContext, reason: impl Into<String>) {
        if txn.is_active() {
            txn.mark_aborted(reason);
        }
    }
}
