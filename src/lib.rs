//! Cumulus - embedded key-value store with optimistic transactions and cloud checkpoints
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use cumulus::{
//!     CloudConfig, CloudTxnDb, DbConfig, LocalObjectStore, ReadOptions, TransactionOptions,
//!     TransactionalStore, WriteOptions,
//! };
//!
//! let store = Arc::new(LocalObjectStore::new("/tmp/buckets")?);
//! let db = CloudTxnDb::open(DbConfig::new("/tmp/db"), CloudConfig::default(), store)?;
//!
//! let mut txn = db.begin_transaction(&WriteOptions::default(), &TransactionOptions::default());
//! txn.get_for_update(&ReadOptions::default(), b"counter")?;
//! txn.put(b"counter", b"1")?;
//! txn.commit()?; // Err(Error::Busy) if someone else wrote "counter" first
//! ```
//!
//! # Architecture
//!
//! [`CloudTxnDb`] is the public entry point. Transactions validate their
//! read-set at commit; savepoints flush to local table files; checkpoints
//! copy a manifest generation to an [`ObjectStore`] through the retrying
//! client.

pub use cumulus_cloud::{
    AccessType, BackoffPolicy, BucketOptions, CheckpointToCloudOptions, ClientConfig, CloudConfig,
    CloudError, CloudErrorCode, CloudRetryStrategy, Credentials, ExponentialBackoff,
    LocalObjectStore, MemoryObjectStore, ObjectMeta, ObjectStore, RetryingClient,
};
pub use cumulus_core::{Error, ErrorClass, Result, SequenceNumber};
pub use cumulus_engine::*;
