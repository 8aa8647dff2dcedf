//! Transaction coordinator for managing transaction lifecycle
//!
//! The TransactionCoordinator wraps TransactionManager and adds:
//! - Active transaction tracking
//! - Transaction metrics (started, committed, conflicted, aborted)
//! - Conversion of commit failures into `cumulus_core::Error`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cumulus_concurrency::{CommitError, TransactionContext, TransactionManager};
use cumulus_core::{Error, Result, SequenceNumber, Storage, WriteOp};
use cumulus_storage::{SequenceAuthority, Snapshot, SnapshotList};
use tracing::debug;

/// Transaction coordinator for the database
///
/// The metric counters use Relaxed ordering; they are observational only
/// and never synchronize other memory.
pub struct TransactionCoordinator {
    manager: TransactionManager,
    active_count: AtomicU64,
    total_started: AtomicU64,
    total_committed: AtomicU64,
    total_conflicted: AtomicU64,
    total_aborted: AtomicU64,
}

impl TransactionCoordinator {
    /// Coordinator over a sequence authority and snapshot registry
    pub fn new(authority: Arc<SequenceAuthority>, snapshots: Arc<SnapshotList>) -> Self {
        TransactionCoordinator {
            manager: TransactionManager::new(authority, snapshots),
            active_count: AtomicU64::new(0),
            total_started: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_conflicted: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
        }
    }

    /// The wrapped transaction manager
    pub fn manager(&self) -> &TransactionManager {
        &self.manager
    }

    /// Start a new transaction
    pub fn begin(&self, set_snapshot: bool) -> TransactionContext {
        let txn = self.manager.begin(set_snapshot);
        self.active_count.fetch_add(1, Ordering::Relaxed);
        self.total_started.fetch_add(1, Ordering::Relaxed);
        debug!(target: "cumulus::txn", txn_id = txn.txn_id, set_snapshot, "Transaction started");
        txn
    }

    /// Commit a transaction through the concurrency layer
    ///
    /// # Returns
    /// * `Ok(Some(sequence))` - write batch applied at `sequence`
    /// * `Ok(None)` - read-only transaction, nothing applied
    /// * `Err(Error::Busy)` - validation conflict, nothing applied
    pub fn commit<S: Storage>(
        &self,
        txn: &mut TransactionContext,
        store: &S,
    ) -> Result<Option<SequenceNumber>> {
        match self.manager.commit(txn, store) {
            Ok(sequence) => {
                self.finish(&self.total_committed);
                debug!(
                    target: "cumulus::txn",
                    txn_id = txn.txn_id,
                    sequence = sequence.map(|s| s.as_u64()),
                    "Transaction committed"
                );
                Ok(sequence)
            }
            Err(e @ CommitError::ValidationFailed(_)) => {
                self.finish(&self.total_conflicted);
                Err(Error::from(e))
            }
            Err(e @ CommitError::InvalidState(_)) => Err(Error::from(e)),
            Err(e) => {
                self.finish(&self.total_aborted);
                Err(Error::from(e))
            }
        }
    }

    /// Abort an active transaction; no-op once it has finished
    pub fn abort(&self, txn: &mut TransactionContext, reason: &str) {
        if txn.is_active() {
            self.manager.abort(txn, reason);
            self.finish(&self.total_aborted);
            debug!(target: "cumulus::txn", txn_id = txn.txn_id, reason, "Transaction aborted");
        }
    }

    /// Apply a batch outside any transaction
    pub fn write<S: Storage>(&self, ops: &[WriteOp], store: &S) -> Result<SequenceNumber> {
        self.manager.write(ops, store)
    }

    /// Pin a snapshot at the current visible sequence
    pub fn snapshot(&self) -> Snapshot {
        self.manager.snapshot()
    }

    /// Pin a snapshot at a commit boundary
    pub fn cut(&self) -> Snapshot {
        self.manager.cut()
    }

    /// Highest visible sequence
    pub fn visible_sequence(&self) -> SequenceNumber {
        self.manager.visible_sequence()
    }

    /// Get current active transaction count
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::Relaxed)
    }

    /// Get transaction metrics
    pub fn metrics(&self) -> TransactionMetrics {
        let started = self.total_started.load(Ordering::Relaxed);
        let committed = self.total_committed.load(Ordering::Relaxed);

        TransactionMetrics {
            active_count: self.active_count.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_conflicted: self.total_conflicted.load(Ordering::Relaxed),
            total_aborted: self.total_aborted.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }

    fn finish(&self, outcome: &AtomicU64) {
        // Saturating so a stray double-finish cannot underflow
        let _ = self
            .active_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
        outcome.fetch_add(1, Ordering::Relaxed);
    }
}

/// Transaction metrics
#[derive(Debug, Clone)]
pub struct TransactionMetrics {
    /// Number of currently active transactions
    pub active_count: u64,
    /// Total number of transactions started
    pub total_started: u64,
    /// Total number of transactions committed
    pub total_committed: u64,
    /// Total number of commits rejected with Busy
    pub total_conflicted: u64,
    /// Total number of transactions rolled back or failed to apply
    pub total_aborted: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Total transactions that finished in any state
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_conflicted + self.total_aborted
    }

    /// Conflict rate (conflicted / started)
    pub fn conflict_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_conflicted as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}
