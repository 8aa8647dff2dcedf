//! Database engine for Cumulus
//!
//! This crate orchestrates all lower layers:
//! - Database: `CloudTxnDb` with open/recovery and the `TransactionalStore` API
//! - Transaction coordination and metrics
//! - Savepoints and cloud checkpoints through the retrying client
//! - Restore of a checkpoint into a fresh directory
//!
//! The engine is the only component that knows about:
//! - Cross-layer coordination (storage + manifest + object store)
//! - Lock ordering between the flush lock and the commit lock

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checkpoint;
pub mod coordinator;
pub mod database;
pub mod transaction;

pub use checkpoint::{
    CheckpointArtifact, CheckpointCoordinator, CheckpointMarker, CheckpointObject,
    CheckpointReader, CHECKPOINT_FORMAT_VERSION, CHECKPOINT_MARKER,
};
pub use coordinator::{TransactionCoordinator, TransactionMetrics};
pub use database::{
    CloudTxnDb, DbConfig, ReadOptions, TransactionOptions, TransactionalStore, WriteOptions,
};
pub use cumulus_concurrency::TransactionStatus;
pub use transaction::Transaction;
