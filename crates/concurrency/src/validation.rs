//! Transaction validation for OCC
//!
//! Key rules:
//! - First-committer-wins based on READ-SET, not write-set
//! - Blind writes (write without read) do NOT conflict
//! - Tombstones count as commits: a delete after the anchor conflicts
//! - Write skew is ALLOWED (do not try to prevent it)

use std::collections::BTreeMap;

use cumulus_core::{Key, Result, SequenceNumber, Storage};

use crate::transaction::TransactionContext;

/// Types of conflicts that can occur during transaction validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// Read-write conflict: key was committed to after the transaction's anchor
    ReadWriteConflict {
        /// The key that has a conflict
        key: Key,
        /// Anchor recorded in the read-set
        read_sequence: SequenceNumber,
        /// Sequence of the newest commit to the key at validation time
        current_sequence: SequenceNumber,
    },
}

impl ConflictType {
    /// The conflicting key
    pub fn key(&self) -> &Key {
        match self {
            ConflictType::ReadWriteConflict { key, .. } => key,
        }
    }
}

/// Result of transaction validation
///
/// Accumulates all conflicts found during validation.
/// A transaction commits only if is_valid() returns true.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// All conflicts detected during validation
    pub conflicts: Vec<ConflictType>,
}

impl ValidationResult {
    /// Create a successful validation result (no conflicts)
    pub fn ok() -> Self {
        ValidationResult {
            conflicts: Vec::new(),
        }
    }

    /// Create a validation result with a single conflict
    pub fn conflict(conflict: ConflictType) -> Self {
        ValidationResult {
            conflicts: vec![conflict],
        }
    }

    /// Merge another validation result into this one
    pub fn merge(&mut self, other: ValidationResult) {
        self.conflicts.extend(other.conflicts);
    }

    /// Check if validation passed (no conflicts)
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Get the number of conflicts
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }
}

/// Validate a read-set against committed state
///
/// Each `(key, anchor)` passes iff the newest commit to `key` has a
/// sequence <= `anchor`. A key that was never written always passes.
///
/// Must run inside the commit critical section so no commit can land
/// between validation and apply.
pub fn validate_read_set<S: Storage>(
    read_set: &BTreeMap<Key, SequenceNumber>,
    store: &S,
) -> Result<ValidationResult> {
    let mut result = ValidationResult::ok();
    for (key, &anchor) in read_set {
        if let Some(current) = store.latest_sequence(key)? {
            if current > anchor {
                result.conflicts.push(ConflictType::ReadWriteConflict {
                    key: key.clone(),
                    read_sequence: anchor,
                    current_sequence: current,
                });
            }
        }
    }
    Ok(result)
}

/// Validate a whole transaction
///
/// Read-only transactions are never validated: they cannot publish
/// anything derived from a stale read.
pub fn validate_transaction<S: Storage>(
    txn: &TransactionContext,
    store: &S,
) -> Result<ValidationResult> {
    if txn.is_read_only() {
        return Ok(ValidationResult::ok());
    }
    validate_read_set(txn.read_set(), store)
}
