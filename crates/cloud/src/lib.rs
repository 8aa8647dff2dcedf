//! Remote storage layer for Cumulus
//!
//! This crate provides everything the engine needs to talk to an object
//! store without depending on any particular transport:
//! - `ObjectStore`: minimal bucket/object interface, with local-directory and
//!   in-memory implementations
//! - `CloudRetryStrategy`: classifies remote errors and decides retries
//! - `RetryingClient`: runs object operations under a retry strategy
//! - Bucket, credential and client configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod object_store;
pub mod retry;

pub use client::RetryingClient;
pub use config::{
    AccessType, BucketOptions, CheckpointToCloudOptions, ClientConfig, CloudConfig, Credentials,
    DEFAULT_REGION,
};
pub use error::{CloudError, CloudErrorCode};
pub use object_store::{LocalObjectStore, MemoryObjectStore, ObjectMeta, ObjectStore};
pub use retry::{classify, BackoffPolicy, CloudRetryStrategy, ExponentialBackoff};
