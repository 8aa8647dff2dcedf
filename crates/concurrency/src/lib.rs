//! Concurrency layer for Cumulus
//!
//! This crate implements optimistic concurrency control (OCC) with:
//! - TransactionContext: read-set, observed-set and write buffer tracking
//! - Conflict detection at commit time (first-committer-wins on the read-set)
//! - TransactionManager: the commit critical section

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod manager;
pub mod transaction;
pub mod validation;

pub use manager::TransactionManager;
pub use transaction::{CommitError, TransactionContext, TransactionStatus};
pub use validation::{validate_read_set, validate_transaction, ConflictType, ValidationResult};
