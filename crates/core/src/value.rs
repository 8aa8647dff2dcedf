//! Values, versions and mutations
//!
//! Values are raw bytes. A version of a key is either a value or a
//! tombstone, tagged with the sequence number of the commit that produced it.

use serde::{Deserialize, Serialize};

use crate::types::{Key, SequenceNumber};

/// One version of a key
///
/// `value == None` is a tombstone: the key was deleted at `sequence`.
/// Tombstones still count as writes for conflict detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Value bytes, or None for a delete
    pub value: Option<Vec<u8>>,
    /// Sequence number of the commit that wrote this version
    pub sequence: SequenceNumber,
}

impl VersionedValue {
    /// A live value written at `sequence`
    pub fn new(value: Vec<u8>, sequence: SequenceNumber) -> Self {
        VersionedValue {
            value: Some(value),
            sequence,
        }
    }

    /// A tombstone written at `sequence`
    pub fn tombstone(sequence: SequenceNumber) -> Self {
        VersionedValue {
            value: None,
            sequence,
        }
    }

    /// True if this version deletes the key
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A buffered mutation
///
/// Transactions accumulate these in order; the store applies them as one
/// batch under a single sequence number. Later operations on the same key
/// win.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Write `value` to `key`
    Put {
        /// Target key
        key: Key,
        /// New value
        value: Vec<u8>,
    },
    /// Delete `key`
    Delete {
        /// Target key
        key: Key,
    },
}

impl WriteOp {
    /// The key this operation touches
    pub fn key(&self) -> &Key {
        match self {
            WriteOp::Put { key, .. } | WriteOp::Delete { key } => key,
        }
    }

    /// Convert into the version this operation produces at `sequence`
    pub fn to_version(&self, sequence: SequenceNumber) -> VersionedValue {
        match self {
            WriteOp::Put { value, .. } => VersionedValue::new(value.clone(), sequence),
            WriteOp::Delete { .. } => VersionedValue::tombstone(sequence),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstone() {
        let v = VersionedValue::tombstone(SequenceNumber::new(3));
        assert!(v.is_tombstone());
        assert_eq!(v.sequence.as_u64(), 3);
        assert!(!VersionedValue::new(b"x".to_vec(), SequenceNumber::new(1)).is_tombstone());
    }

    #[test]
    fn test_write_op_to_version() {
        let put = WriteOp::Put {
            key: Key::from("k"),
            value: b"v".to_vec(),
        };
        let del = WriteOp::Delete { key: Key::from("k") };
        let seq = SequenceNumber::new(9);

        assert_eq!(put.key(), &Key::from("k"));
        assert_eq!(put.to_version(seq), VersionedValue::new(b"v".to_vec(), seq));
        assert_eq!(del.to_version(seq), VersionedValue::tombstone(seq));
    }
}
