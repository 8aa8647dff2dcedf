//! Core types for Cumulus
//!
//! This module defines the foundational types:
//! - Key: Opaque byte-string key
//! - SequenceNumber: Global commit order, anchor for snapshots and checkpoints
//! - DatabaseId: Unique identifier for a database instance

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a database instance
///
/// A DatabaseId wraps a UUID v4. It is generated when a database is created,
/// persisted in the manifest and recorded in every checkpoint marker so a
/// restored copy can be traced back to its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId(Uuid);

impl DatabaseId {
    /// Create a new random DatabaseId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a DatabaseId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse a DatabaseId from its string form
    ///
    /// Returns None if the string is not a valid UUID.
    pub fn from_string(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get the raw bytes of this DatabaseId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for DatabaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position in the global commit order
///
/// Every accepted mutation batch is assigned a sequence number strictly
/// greater than all previously assigned ones. `SequenceNumber::ZERO` means
/// "before any write" and is never assigned to a commit.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    /// The sequence number preceding every commit
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    /// Wrap a raw value
    pub const fn new(value: u64) -> Self {
        SequenceNumber(value)
    }

    /// Raw value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The number immediately after this one
    pub fn next(self) -> Self {
        SequenceNumber(self.0 + 1)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        SequenceNumber(value)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Storage key
///
/// Keys are opaque byte strings ordered lexicographically, so iteration
/// order matches the byte order of the user keys.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Create a key from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Key(bytes.into())
    }

    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume the key, returning its bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Key length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the empty key
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if this key begins with `prefix`
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.0.starts_with(prefix)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key(s.into_bytes())
    }
}

impl From<&[u8]> for Key {
    fn from(b: &[u8]) -> Self {
        Key(b.to_vec())
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Key(b)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({:?})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_id_roundtrip_string() {
        let id = DatabaseId::new();
        let parsed = DatabaseId::from_string(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(DatabaseId::from_string("not-a-uuid").is_none());
    }

    #[test]
    fn test_database_ids_unique() {
        assert_ne!(DatabaseId::new(), DatabaseId::new());
    }

    #[test]
    fn test_sequence_ordering() {
        let a = SequenceNumber::new(5);
        assert!(a.next() > a);
        assert_eq!(a.next().as_u64(), 6);
        assert!(SequenceNumber::ZERO < a);
        assert_eq!(SequenceNumber::default(), SequenceNumber::ZERO);
    }

    #[test]
    fn test_key_ordering_is_bytewise() {
        let mut keys = vec![Key::from("b"), Key::from("ab"), Key::from("a")];
        keys.sort();
        assert_eq!(keys, vec![Key::from("a"), Key::from("ab"), Key::from("b")]);
    }

    #[test]
    fn test_key_display_and_prefix() {
        let key = Key::from("user:42");
        assert_eq!(key.to_string(), "user:42");
        assert!(key.starts_with(b"user:"));
        assert!(!key.starts_with(b"order:"));
        assert_eq!(key.len(), 7);
    }

    #[test]
    fn test_key_serde() {
        let key = Key::from("abc");
        let json = serde_json::to_string(&key).unwrap();
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }
}
