//! Storage layer for Cumulus
//!
//! This crate implements the in-memory multi-version store and the
//! sequence/snapshot authority that every other layer synchronizes on:
//! - MemStore: DashMap of per-key version chains (lock-free reads)
//! - SequenceAuthority: allocates commit sequence numbers and publishes visibility
//! - SnapshotList / Snapshot: reference-counted snapshot registry with RAII handles

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod mem_store;
pub mod sequence;
pub mod snapshot;

pub use mem_store::{MemStore, VersionChain};
pub use sequence::SequenceAuthority;
pub use snapshot::{RegistryGuard, Snapshot, SnapshotList};
