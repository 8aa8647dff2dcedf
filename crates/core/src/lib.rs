//! Core types and traits for Cumulus
//!
//! This crate defines the foundational types used throughout the system:
//! - Key: Opaque byte-string key, ordered lexicographically
//! - SequenceNumber: Position in the global commit order
//! - DatabaseId: Unique identifier persisted in the manifest
//! - WriteOp / VersionedValue: Mutations and the versions they produce
//! - Error: Error type hierarchy shared by every layer
//! - Traits: Storage abstraction consumed by the concurrency layer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;
pub mod value;

pub use error::{Error, ErrorClass, Result};
pub use traits::Storage;
pub use types::{DatabaseId, Key, SequenceNumber};
pub use value::{VersionedValue, WriteOp};
