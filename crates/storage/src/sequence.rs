//! Sequence authority
//!
//! Two counters define the global commit order:
//! - `last_allocated`: highest sequence handed to a committing batch
//! - `visible`: highest sequence whose batch is fully applied to the store
//!
//! Allocation only happens under the commit lock, so allocated sequences
//! are published in order and `visible` never skips a hole. Readers load
//! `visible` without any lock.

use std::sync::atomic::{AtomicU64, Ordering};

use cumulus_core::SequenceNumber;

/// Allocates commit sequence numbers and publishes visibility
#[derive(Debug, Default)]
pub struct SequenceAuthority {
    last_allocated: AtomicU64,
    visible: AtomicU64,
}

impl SequenceAuthority {
    /// Fresh authority for an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Authority resuming after `last_sequence`, which is treated as visible
    pub fn resume_from(last_sequence: SequenceNumber) -> Self {
        SequenceAuthority {
            last_allocated: AtomicU64::new(last_sequence.as_u64()),
            visible: AtomicU64::new(last_sequence.as_u64()),
        }
    }

    /// Allocate the next commit sequence
    ///
    /// Callers must hold the commit lock and must publish the returned
    /// sequence once its batch is applied.
    pub fn allocate(&self) -> SequenceNumber {
        SequenceNumber::new(self.last_allocated.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Highest sequence whose batch is fully applied
    #[inline]
    pub fn visible(&self) -> SequenceNumber {
        SequenceNumber::new(self.visible.load(Ordering::Acquire))
    }

    /// Highest sequence handed out so far
    pub fn last_allocated(&self) -> SequenceNumber {
        SequenceNumber::new(self.last_allocated.load(Ordering::Acquire))
    }

    /// Make every batch up to and including `sequence` visible to readers
    pub fn publish(&self, sequence: SequenceNumber) {
        debug_assert!(sequence <= self.last_allocated());
        self.visible.fetch_max(sequence.as_u64(), Ordering::AcqRel);
    }
}
