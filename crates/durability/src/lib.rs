//! Durability layer for Cumulus
//!
//! Local on-disk state is a directory holding:
//! - `NNNNNN.tbl`: immutable table files, one per savepoint
//! - `MANIFEST`: the current file list, last flushed sequence and database id
//!
//! Every file is written with the write-fsync-rename pattern, so a crash
//! leaves either the old or the new version, never a torn one. There is no
//! write-ahead log: commits after the last savepoint are lost on crash.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod file;
pub mod manifest;
pub mod table;

pub use file::write_file_atomic;
pub use manifest::{
    Manifest, ManifestError, ManifestManager, TableFileMeta, MANIFEST_FILE_NAME,
    MANIFEST_FORMAT_VERSION, MANIFEST_MAGIC,
};
pub use table::{table_file_name, TableError, TableReader, TableWriter, TABLE_MAGIC};
