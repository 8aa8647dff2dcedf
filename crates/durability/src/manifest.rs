//! MANIFEST file format
//!
//! The MANIFEST names every table file that makes up the durable state and
//! the highest sequence they cover. Each savepoint appends one file and
//! bumps the generation; files are never removed.
//!
//! # Format
//!
//! ```text
//! +--------------------+
//! | Magic: "CMLM"      | 4 bytes
//! | Format Version     | 4 bytes (u32 LE)
//! | Database UUID      | 16 bytes
//! | Generation         | 8 bytes (u64 LE)
//! | Last Sequence      | 8 bytes (u64 LE)
//! | Next File Number   | 8 bytes (u64 LE)
//! | File Count         | 4 bytes (u32 LE)
//! | Files              | File Count * 28 bytes
//! |   Number           |   8 bytes (u64 LE)
//! |   Size             |   8 bytes (u64 LE)
//! |   CRC32 of file    |   4 bytes (u32 LE)
//! |   Largest Sequence |   8 bytes (u64 LE)
//! | CRC32              | 4 bytes
//! +--------------------+
//! ```

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use cumulus_core::{DatabaseId, Error, SequenceNumber};
use tracing::debug;

use crate::file::write_file_atomic;
use crate::table::table_file_name;

/// MANIFEST magic bytes: "CMLM"
pub const MANIFEST_MAGIC: [u8; 4] = *b"CMLM";

/// Current MANIFEST format version
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// File name of the MANIFEST inside a database directory
pub const MANIFEST_FILE_NAME: &str = "MANIFEST";

const HEADER_LEN: usize = 4 + 4 + 16 + 8 + 8 + 8 + 4;
const FILE_ENTRY_LEN: usize = 8 + 8 + 4 + 8;

/// One table file referenced by the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFileMeta {
    /// File number; the file name is `table_file_name(number)`
    pub number: u64,
    /// Size in bytes
    pub size: u64,
    /// CRC32 of the whole file
    pub crc32: u32,
    /// Highest sequence stored in the file
    pub largest_sequence: SequenceNumber,
}

impl TableFileMeta {
    /// File name of this table
    pub fn file_name(&self) -> String {
        table_file_name(self.number)
    }
}

/// MANIFEST file structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Format version for forward compatibility
    pub format_version: u32,
    /// Unique database identifier (generated on creation)
    pub database_id: DatabaseId,
    /// Bumped on every persisted change
    pub generation: u64,
    /// Highest sequence covered by the listed files
    pub last_sequence: SequenceNumber,
    /// Number the next table file will get
    pub next_file_number: u64,
    /// Table files, oldest first
    pub files: Vec<TableFileMeta>,
}

impl Manifest {
    /// Create a new MANIFEST for a fresh database
    pub fn new(database_id: DatabaseId) -> Self {
        Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            database_id,
            generation: 1,
            last_sequence: SequenceNumber::ZERO,
            next_file_number: 1,
            files: Vec::new(),
        }
    }

    /// Name this generation is published under in remote storage
    pub fn generation_file_name(&self) -> String {
        format!("MANIFEST-{:06}", self.generation)
    }

    /// Serialize MANIFEST to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.files.len() * FILE_ENTRY_LEN + 4);

        // Writes into a Vec cannot fail
        let _ = self.write_body(&mut bytes);

        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_le_bytes());
        bytes
    }

    fn write_body(&self, bytes: &mut Vec<u8>) -> std::io::Result<()> {
        bytes.extend_from_slice(&MANIFEST_MAGIC);
        bytes.write_u32::<LittleEndian>(self.format_version)?;
        bytes.extend_from_slice(self.database_id.as_bytes());
        bytes.write_u64::<LittleEndian>(self.generation)?;
        bytes.write_u64::<LittleEndian>(self.last_sequence.as_u64())?;
        bytes.write_u64::<LittleEndian>(self.next_file_number)?;
        bytes.write_u32::<LittleEndian>(self.files.len() as u32)?;
        for file in &self.files {
            bytes.write_u64::<LittleEndian>(file.number)?;
            bytes.write_u64::<LittleEndian>(file.size)?;
            bytes.write_u32::<LittleEndian>(file.crc32)?;
            bytes.write_u64::<LittleEndian>(file.largest_sequence.as_u64())?;
        }
        Ok(())
    }

    /// Deserialize MANIFEST from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ManifestError> {
        if bytes.len() < HEADER_LEN + 4 {
            return Err(ManifestError::TooShort);
        }
        if bytes[0..4] != MANIFEST_MAGIC {
            return Err(ManifestError::InvalidMagic);
        }

        let (data, crc_bytes) = bytes.split_at(bytes.len() - 4);
        let stored_crc = Cursor::new(crc_bytes).read_u32::<LittleEndian>()?;
        let computed_crc = crc32fast::hash(data);
        if stored_crc != computed_crc {
            return Err(ManifestError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        let mut cursor = Cursor::new(&data[4..]);
        let format_version = cursor.read_u32::<LittleEndian>()?;
        if format_version != MANIFEST_FORMAT_VERSION {
            return Err(ManifestError::UnsupportedVersion(format_version));
        }
        let mut uuid = [0u8; 16];
        cursor.read_exact(&mut uuid)?;
        let generation = cursor.read_u64::<LittleEndian>()?;
        let last_sequence = SequenceNumber::new(cursor.read_u64::<LittleEndian>()?);
        let next_file_number = cursor.read_u64::<LittleEndian>()?;
        let count = cursor.read_u32::<LittleEndian>()? as usize;

        if data.len() != HEADER_LEN + count * FILE_ENTRY_LEN {
            return Err(ManifestError::TooShort);
        }

        let mut files = Vec::with_capacity(count);
        for _ in 0..count {
            files.push(TableFileMeta {
                number: cursor.read_u64::<LittleEndian>()?,
                size: cursor.read_u64::<LittleEndian>()?,
                crc32: cursor.read_u32::<LittleEndian>()?,
                largest_sequence: SequenceNumber::new(cursor.read_u64::<LittleEndian>()?),
            });
        }

        Ok(Manifest {
            format_version,
            database_id: DatabaseId::from_bytes(uuid),
            generation,
            last_sequence,
            next_file_number,
            files,
        })
    }
}

/// MANIFEST persistence manager
///
/// Handles atomic MANIFEST persistence using write-fsync-rename pattern.
pub struct ManifestManager {
    path: PathBuf,
    manifest: Manifest,
}

impl ManifestManager {
    /// Create and persist a MANIFEST for a new database in `dir`
    pub fn create(dir: &Path, database_id: DatabaseId) -> Result<Self, ManifestError> {
        let manager = ManifestManager {
            path: dir.join(MANIFEST_FILE_NAME),
            manifest: Manifest::new(database_id),
        };
        manager.persist()?;
        Ok(manager)
    }

    /// Load the MANIFEST of the database in `dir`
    pub fn load(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE_NAME);
        let bytes = std::fs::read(&path)?;
        let manifest = Manifest::from_bytes(&bytes)?;
        Ok(ManifestManager { path, manifest })
    }

    /// Check if a database directory already has a MANIFEST
    pub fn exists(dir: &Path) -> bool {
        dir.join(MANIFEST_FILE_NAME).exists()
    }

    /// Persist MANIFEST atomically (write-fsync-rename)
    pub fn persist(&self) -> Result<(), ManifestError> {
        write_file_atomic(&self.path, &self.manifest.to_bytes())?;
        Ok(())
    }

    /// Get the MANIFEST path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the current manifest
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Reserve the number for the next table file
    ///
    /// Persisted with the next `record_flush`; a reserved number whose file
    /// never made it into the manifest is simply skipped.
    pub fn next_file_number(&mut self) -> u64 {
        let number = self.manifest.next_file_number;
        self.manifest.next_file_number += 1;
        number
    }

    /// Record a flushed table file and persist a new generation
    ///
    /// On failure the in-memory manifest is left unchanged.
    pub fn record_flush(
        &mut self,
        file: TableFileMeta,
        last_sequence: SequenceNumber,
    ) -> Result<(), ManifestError> {
        let mut next = self.manifest.clone();
        next.files.push(file);
        next.last_sequence = last_sequence;
        next.generation += 1;
        next.next_file_number = next.next_file_number.max(file.number + 1);

        write_file_atomic(&self.path, &next.to_bytes())?;
        debug!(
            generation = next.generation,
            last_sequence = last_sequence.as_u64(),
            files = next.files.len(),
            "Persisted manifest"
        );
        self.manifest = next;
        Ok(())
    }

    /// Advance the recorded sequence without adding a file
    ///
    /// Used when a savepoint finds nothing new to write but the cut moved.
    pub fn record_sequence(&mut self, last_sequence: SequenceNumber) -> Result<(), ManifestError> {
        if last_sequence <= self.manifest.last_sequence {
            return Ok(());
        }
        let mut next = self.manifest.clone();
        next.last_sequence = last_sequence;
        next.generation += 1;
        write_file_atomic(&self.path, &next.to_bytes())?;
        self.manifest = next;
        Ok(())
    }
}

/// Errors that can occur with MANIFEST operations
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// MANIFEST file too short
    #[error("MANIFEST too short")]
    TooShort,

    /// Invalid magic bytes
    #[error("Invalid magic bytes")]
    InvalidMagic,

    /// Format version this build cannot read
    #[error("Unsupported MANIFEST version {0}")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected CRC32 value (from file)
        expected: u32,
        /// Computed CRC32 value
        computed: u32,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ManifestError> for Error {
    fn from(e: ManifestError) -> Self {
        match e {
            ManifestError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                Error::NotFound(format!("MANIFEST: {}", io))
            }
            ManifestError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                Error::Corruption(format!("MANIFEST truncated: {}", io))
            }
            ManifestError::Io(io) => Error::Io(io),
            other => Error::Corruption(format!("MANIFEST: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_file(number: u64, largest: u64) -> TableFileMeta {
        TableFileMeta {
            number,
            size: 100 * number,
            crc32: 0xDEAD_0000 + number as u32,
            largest_sequence: SequenceNumber::new(largest),
        }
    }

    #[test]
    fn test_manifest_magic() {
        assert_eq!(MANIFEST_MAGIC, *b"CMLM");
    }

    #[test]
    fn test_manifest_new() {
        let id = DatabaseId::new();
        let manifest = Manifest::new(id);
        assert_eq!(manifest.format_version, MANIFEST_FORMAT_VERSION);
        assert_eq!(manifest.database_id, id);
        assert_eq!(manifest.generation, 1);
        assert_eq!(manifest.last_sequence, SequenceNumber::ZERO);
        assert!(manifest.files.is_empty());
    }

    #[test]
    fn test_manifest_bytes_roundtrip_with_files() {
        let mut manifest = Manifest::new(DatabaseId::new());
        manifest.generation = 7;
        manifest.last_sequence = SequenceNumber::new(42);
        manifest.next_file_number = 3;
        manifest.files = vec![sample_file(1, 10), sample_file(2, 42)];

        let parsed = Manifest::from_bytes(&manifest.to_bytes()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_manifest_crc_detects_flip() {
        let manifest = Manifest::new(DatabaseId::new());
        let mut bytes = manifest.to_bytes();
        bytes[10] ^= 0xFF;
        assert!(matches!(
            Manifest::from_bytes(&bytes),
            Err(ManifestError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_manifest_rejects_bad_magic_and_short_input() {
        let mut bytes = Manifest::new(DatabaseId::new()).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(Manifest::from_bytes(&bytes), Err(ManifestError::InvalidMagic)));
        assert!(matches!(Manifest::from_bytes(&[0u8; 8]), Err(ManifestError::TooShort)));
    }

    #[test]
    fn test_generation_file_name() {
        let mut manifest = Manifest::new(DatabaseId::new());
        manifest.generation = 12;
        assert_eq!(manifest.generation_file_name(), "MANIFEST-000012");
    }

    #[test]
    fn test_manager_create_load() {
        let dir = TempDir::new().unwrap();
        assert!(!ManifestManager::exists(dir.path()));

        let id = DatabaseId::new();
        ManifestManager::create(dir.path(), id).unwrap();
        assert!(ManifestManager::exists(dir.path()));

        let loaded = ManifestManager::load(dir.path()).unwrap();
        assert_eq!(loaded.manifest().database_id, id);
    }

    #[test]
    fn test_record_flush_bumps_generation_and_persists() {
        let dir = TempDir::new().unwrap();
        let mut mgr = ManifestManager::create(dir.path(), DatabaseId::new()).unwrap();

        let number = mgr.next_file_number();
        mgr.record_flush(sample_file(number, 5), SequenceNumber::new(5)).unwrap();

        let loaded = ManifestManager::load(dir.path()).unwrap();
        let m = loaded.manifest();
        assert_eq!(m.generation, 2);
        assert_eq!(m.last_sequence, SequenceNumber::new(5));
        assert_eq!(m.files.len(), 1);
        assert_eq!(m.next_file_number, number + 1);
    }

    #[test]
    fn test_record_sequence_ignores_regression() {
        let dir = TempDir::new().unwrap();
        let mut mgr = ManifestManager::create(dir.path(), DatabaseId::new()).unwrap();
        mgr.record_sequence(SequenceNumber::new(9)).unwrap();
        mgr.record_sequence(SequenceNumber::new(3)).unwrap();
        assert_eq!(mgr.manifest().last_sequence, SequenceNumber::new(9));
        assert_eq!(mgr.manifest().generation, 2);
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = ManifestError::InvalidMagic.into();
        assert!(err.is_corruption());

        let missing = ManifestManager::load(std::path::Path::new("/nonexistent/cumulus"));
        let err: Error = missing.err().unwrap().into();
        assert!(err.is_not_found());
    }
}
