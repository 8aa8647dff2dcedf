//! Table file format
//!
//! A table file is an immutable, sorted dump of the newest version of each
//! key changed in one savepoint range. Tombstones are stored so deletes
//! survive a reopen.
//!
//! # Format
//!
//! ```text
//! [Magic: "CMLT"]
//! [Format Version: u32 LE]
//! [Entry Count: u32 LE]
//! For each entry (in key order):
//!   [Entry Length: u32 LE]
//!   [Entry: MessagePack TableEntry]
//! [CRC32 of everything above: u32 LE]
//! ```

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use cumulus_core::{Error, Key, SequenceNumber, VersionedValue};
use serde::{Deserialize, Serialize};

use crate::file::write_file_atomic;
use crate::manifest::TableFileMeta;

/// Table magic bytes: "CMLT"
pub const TABLE_MAGIC: [u8; 4] = *b"CMLT";

const TABLE_FORMAT_VERSION: u32 = 1;

/// File name for table number `number`
pub fn table_file_name(number: u64) -> String {
    format!("{:06}.tbl", number)
}

#[derive(Debug, Serialize, Deserialize)]
struct TableEntry {
    key: Key,
    value: VersionedValue,
}

/// Writes table files into a database directory
pub struct TableWriter {
    dir: PathBuf,
}

impl TableWriter {
    /// Writer for tables under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        TableWriter { dir: dir.into() }
    }

    /// Encode `entries` into table bytes
    ///
    /// Entries must already be sorted by key.
    pub fn encode(entries: &[(Key, VersionedValue)]) -> Result<Vec<u8>, TableError> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&TABLE_MAGIC);
        bytes.write_u32::<LittleEndian>(TABLE_FORMAT_VERSION)?;
        bytes.write_u32::<LittleEndian>(entries.len() as u32)?;

        for (key, value) in entries {
            let entry = TableEntry {
                key: key.clone(),
                value: value.clone(),
            };
            let encoded =
                rmp_serde::to_vec(&entry).map_err(|e| TableError::Encode(e.to_string()))?;
            bytes.write_u32::<LittleEndian>(encoded.len() as u32)?;
            bytes.extend_from_slice(&encoded);
        }

        let crc = crc32fast::hash(&bytes);
        bytes.write_u32::<LittleEndian>(crc)?;
        Ok(bytes)
    }

    /// Write table `number` and return its manifest entry
    pub fn write(
        &self,
        number: u64,
        entries: &[(Key, VersionedValue)],
    ) -> Result<TableFileMeta, TableError> {
        let bytes = Self::encode(entries)?;
        let path = self.dir.join(table_file_name(number));
        write_file_atomic(&path, &bytes)?;

        let largest_sequence = entries
            .iter()
            .map(|(_, v)| v.sequence)
            .max()
            .unwrap_or(SequenceNumber::ZERO);

        Ok(TableFileMeta {
            number,
            size: bytes.len() as u64,
            crc32: crc32fast::hash(&bytes),
            largest_sequence,
        })
    }
}

/// Reads and verifies table files
pub struct TableReader;

impl TableReader {
    /// Decode table bytes, verifying magic and CRC
    pub fn decode(bytes: &[u8]) -> Result<Vec<(Key, VersionedValue)>, TableError> {
        if bytes.len() < 4 + 4 + 4 + 4 {
            return Err(TableError::TooShort);
        }
        if bytes[0..4] != TABLE_MAGIC {
            return Err(TableError::InvalidMagic);
        }
        let (data, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored = Cursor::new(crc_bytes).read_u32::<LittleEndian>()?;
        let computed = crc32fast::hash(data);
        if stored != computed {
            return Err(TableError::ChecksumMismatch {
                expected: stored,
                computed,
            });
        }

        let mut cursor = Cursor::new(&data[4..]);
        let version = cursor.read_u32::<LittleEndian>()?;
        if version != TABLE_FORMAT_VERSION {
            return Err(TableError::UnsupportedVersion(version));
        }
        let count = cursor.read_u32::<LittleEndian>()? as usize;

        let mut entries = Vec::with_capacity(count);
        let mut buf = Vec::new();
        for _ in 0..count {
            let len = cursor.read_u32::<LittleEndian>()? as usize;
            buf.resize(len, 0);
            cursor.read_exact(&mut buf)?;
            let entry: TableEntry =
                rmp_serde::from_slice(&buf).map_err(|e| TableError::Decode(e.to_string()))?;
            entries.push((entry.key, entry.value));
        }
        Ok(entries)
    }

    /// Read a table file and check it against its manifest entry
    pub fn read(dir: &Path, meta: &TableFileMeta) -> Result<Vec<(Key, VersionedValue)>, TableError> {
        let path = dir.join(meta.file_name());
        let bytes = std::fs::read(&path)?;
        if bytes.len() as u64 != meta.size {
            return Err(TableError::SizeMismatch {
                file: meta.file_name(),
                expected: meta.size,
                actual: bytes.len() as u64,
            });
        }
        let crc = crc32fast::hash(&bytes);
        if crc != meta.crc32 {
            return Err(TableError::ChecksumMismatch {
                expected: meta.crc32,
                computed: crc,
            });
        }
        Self::decode(&bytes)
    }
}

/// Errors that can occur reading or writing table files
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// File shorter than its fixed header and trailer
    #[error("table file too short")]
    TooShort,

    /// Invalid magic bytes
    #[error("Invalid magic bytes")]
    InvalidMagic,

    /// Format version this build cannot read
    #[error("Unsupported table version {0}")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected CRC32 value
        expected: u32,
        /// Computed CRC32 value
        computed: u32,
    },

    /// File size differs from the manifest
    #[error("{file}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        /// Table file name
        file: String,
        /// Size recorded in the manifest
        expected: u64,
        /// Size on disk
        actual: u64,
    },

    /// Entry serialization failed
    #[error("Encode error: {0}")]
    Encode(String),

    /// Entry deserialization failed
    #[error("Decode error: {0}")]
    Decode(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TableError> for Error {
    fn from(e: TableError) -> Self {
        match e {
            // A file listed in the manifest that is gone is corruption, not absence
            TableError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                Error::Corruption(format!("table file missing: {}", io))
            }
            TableError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                Error::Corruption(format!("table file truncated: {}", io))
            }
            TableError::Io(io) => Error::Io(io),
            TableError::Encode(msg) => Error::Serialization(msg),
            other => Error::Corruption(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries() -> Vec<(Key, VersionedValue)> {
        vec![
            (
                Key::from("a"),
                VersionedValue::new(b"1".to_vec(), SequenceNumber::new(3)),
            ),
            (Key::from("b"), VersionedValue::tombstone(SequenceNumber::new(5))),
            (
                Key::from("c"),
                VersionedValue::new(Vec::new(), SequenceNumber::new(4)),
            ),
        ]
    }

    #[test]
    fn test_table_file_name() {
        assert_eq!(table_file_name(7), "000007.tbl");
        assert_eq!(table_file_name(1234567), "1234567.tbl");
    }

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let writer = TableWriter::new(dir.path());
        let meta = writer.write(1, &entries()).unwrap();

        assert_eq!(meta.number, 1);
        assert_eq!(meta.largest_sequence, SequenceNumber::new(5));
        assert_eq!(
            meta.size,
            std::fs::metadata(dir.path().join("000001.tbl")).unwrap().len()
        );

        let read = TableReader::read(dir.path(), &meta).unwrap();
        assert_eq!(read, entries());
    }

    #[test]
    fn test_empty_table() {
        let bytes = TableWriter::encode(&[]).unwrap();
        assert!(TableReader::decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_corrupted_byte_detected() {
        let mut bytes = TableWriter::encode(&entries()).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        assert!(matches!(
            TableReader::decode(&bytes),
            Err(TableError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_size_mismatch_against_manifest() {
        let dir = TempDir::new().unwrap();
        let mut meta = TableWriter::new(dir.path()).write(2, &entries()).unwrap();
        meta.size += 1;
        let err = TableReader::read(dir.path(), &meta).unwrap_err();
        assert!(matches!(err, TableError::SizeMismatch { .. }));
        assert!(Error::from(err).is_corruption());
    }

    #[test]
    fn test_missing_file_is_corruption() {
        let dir = TempDir::new().unwrap();
        let meta = TableFileMeta {
            number: 9,
            size: 10,
            crc32: 0,
            largest_sequence: SequenceNumber::new(1),
        };
        let err: Error = TableReader::read(dir.path(), &meta).unwrap_err().into();
        assert!(err.is_corruption());
    }
}
