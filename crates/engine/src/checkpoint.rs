//! Savepoints and cloud checkpoints
//!
//! A savepoint flushes every version newer than the last flushed sequence
//! into a new table file and persists a new manifest generation. A cloud
//! checkpoint copies one manifest generation and its table files to an
//! object store:
//!
//! ```text
//! <path_prefix>/000001.tbl ... NNNNNN.tbl    table files (parallel upload)
//! <path_prefix>/MANIFEST-<generation>         manifest copy
//! <path_prefix>/CHECKPOINT                    marker, written last
//! ```
//!
//! The marker is removed before an upload starts and written only after
//! every other object landed, so a reader that finds it can trust the
//! whole set.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use cumulus_cloud::{BucketOptions, CheckpointToCloudOptions, RetryingClient};
use cumulus_core::{DatabaseId, Error, Result, SequenceNumber};
use cumulus_durability::{
    write_file_atomic, Manifest, ManifestManager, TableFileMeta, TableWriter, MANIFEST_FILE_NAME,
};
use cumulus_storage::MemStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::coordinator::TransactionCoordinator;

/// Name of the terminal marker object
pub const CHECKPOINT_MARKER: &str = "CHECKPOINT";

/// Marker format this build writes and reads
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// One uploaded object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointObject {
    /// File name, relative to the path prefix
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// XXH3-64 of the contents
    pub checksum: u64,
}

impl CheckpointObject {
    fn of(name: String, bytes: &[u8]) -> Self {
        CheckpointObject {
            name,
            size: bytes.len() as u64,
            checksum: xxh3_64(bytes),
        }
    }

    fn verify(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() as u64 != self.size {
            return Err(Error::Corruption(format!(
                "{}: size {} does not match recorded {}",
                self.name,
                bytes.len(),
                self.size
            )));
        }
        let checksum = xxh3_64(bytes);
        if checksum != self.checksum {
            return Err(Error::Corruption(format!(
                "{}: checksum {:016x} does not match recorded {:016x}",
                self.name, checksum, self.checksum
            )));
        }
        Ok(())
    }
}

/// Contents of the `CHECKPOINT` marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMarker {
    /// Marker format version
    pub format_version: u32,
    /// Identity of the checkpointed database
    pub database_id: DatabaseId,
    /// Sequence cut the manifest records
    pub sequence: SequenceNumber,
    /// Manifest generation
    pub generation: u64,
    /// Manifest copy
    pub manifest: CheckpointObject,
    /// Table files, in manifest order
    pub files: Vec<CheckpointObject>,
    /// When the marker was written
    pub created_at: DateTime<Utc>,
}

impl CheckpointMarker {
    /// Encode as JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode a marker, rejecting unknown formats
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let marker: CheckpointMarker = serde_json::from_slice(bytes)
            .map_err(|e| Error::Corruption(format!("unreadable checkpoint marker: {}", e)))?;
        if marker.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(Error::NotSupported(format!(
                "checkpoint marker version {}",
                marker.format_version
            )));
        }
        Ok(marker)
    }
}

/// Result of a completed `checkpoint_to_cloud`
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointArtifact {
    /// Where the checkpoint was written
    pub destination: BucketOptions,
    /// Sequence cut the checkpoint covers
    pub sequence: SequenceNumber,
    /// Manifest generation every object belongs to
    pub generation: u64,
    /// Table files in manifest order, then the manifest copy
    pub objects: Vec<CheckpointObject>,
    /// Object key of the marker
    pub marker_key: String,
}

/// Serializes savepoints and checkpoints of one database
///
/// The flush lock guards the manifest. It is never taken while the commit
/// lock is held, so commits proceed during table writes and uploads.
pub struct CheckpointCoordinator {
    dir: PathBuf,
    store: Arc<MemStore>,
    txns: Arc<TransactionCoordinator>,
    manifest: Mutex<ManifestManager>,
    client: RetryingClient,
}

impl CheckpointCoordinator {
    /// Coordinator for the database in `dir`
    pub fn new(
        dir: impl Into<PathBuf>,
        store: Arc<MemStore>,
        txns: Arc<TransactionCoordinator>,
        manifest: ManifestManager,
        client: RetryingClient,
    ) -> Self {
        CheckpointCoordinator {
            dir: dir.into(),
            store,
            txns,
            manifest: Mutex::new(manifest),
            client,
        }
    }

    /// Highest sequence persisted locally
    pub fn durable_sequence(&self) -> SequenceNumber {
        self.manifest.lock().manifest().last_sequence
    }

    /// Copy of the current manifest
    pub fn manifest(&self) -> Manifest {
        self.manifest.lock().manifest().clone()
    }

    /// Flush everything committed so far and persist a new manifest generation
    ///
    /// Returns the sequence the manifest now covers. A savepoint with nothing
    /// new to flush leaves the manifest untouched.
    pub fn savepoint(&self) -> Result<SequenceNumber> {
        let mut manifest = self.manifest.lock();
        let cut = self.txns.cut();
        let after = manifest.manifest().last_sequence;
        let upto = cut.sequence();
        if upto <= after {
            return Ok(after);
        }

        let changes = self.store.changes_between(after, upto);
        if changes.is_empty() {
            manifest.record_sequence(upto)?;
        } else {
            let number = manifest.next_file_number();
            let meta = TableWriter::new(&self.dir).write(number, &changes)?;
            manifest.record_flush(meta, upto)?;
            debug!(
                target: "cumulus::checkpoint",
                file = %meta.file_name(),
                size = meta.size,
                entries = changes.len(),
                "Wrote table file"
            );
        }

        info!(
            target: "cumulus::checkpoint",
            from = after.as_u64(),
            to = upto.as_u64(),
            generation = manifest.manifest().generation,
            "Savepoint complete"
        );
        Ok(upto)
    }

    /// Copy the current manifest generation and its files to `destination`
    pub fn checkpoint_to_cloud(
        &self,
        destination: &BucketOptions,
        options: &CheckpointToCloudOptions,
    ) -> Result<CheckpointArtifact> {
        options.validate()?;
        if !destination.is_valid() {
            return Err(Error::InvalidArgument(
                "checkpoint destination names no bucket".to_string(),
            ));
        }
        if options.flush_before_checkpoint {
            self.savepoint()?;
        }

        let manifest = self.manifest();
        match self.upload(&manifest, destination, options.thread_count) {
            Ok(artifact) => {
                info!(
                    target: "cumulus::checkpoint",
                    destination = %destination,
                    sequence = artifact.sequence.as_u64(),
                    generation = artifact.generation,
                    objects = artifact.objects.len(),
                    "Checkpoint to cloud complete"
                );
                Ok(artifact)
            }
            Err(e) => {
                error!(
                    target: "cumulus::checkpoint",
                    destination = %destination,
                    generation = manifest.generation,
                    error = %e,
                    "Checkpoint to cloud failed"
                );
                Err(e)
            }
        }
    }

    fn upload(
        &self,
        manifest: &Manifest,
        destination: &BucketOptions,
        thread_count: usize,
    ) -> Result<CheckpointArtifact> {
        let bucket = &destination.bucket_name;
        let marker_key = destination.object_key(CHECKPOINT_MARKER);

        self.client.create_bucket(bucket)?;
        self.client.delete_object(bucket, &marker_key)?;

        let files = self.upload_tables(&manifest.files, destination, thread_count)?;

        let manifest_bytes = manifest.to_bytes();
        let manifest_object = CheckpointObject::of(manifest.generation_file_name(), &manifest_bytes);
        self.client.put_object(
            bucket,
            &destination.object_key(&manifest_object.name),
            &manifest_bytes,
        )?;

        let marker = CheckpointMarker {
            format_version: CHECKPOINT_FORMAT_VERSION,
            database_id: manifest.database_id,
            sequence: manifest.last_sequence,
            generation: manifest.generation,
            manifest: manifest_object.clone(),
            files: files.clone(),
            created_at: Utc::now(),
        };
        self.client.put_object(bucket, &marker_key, &marker.to_json()?)?;

        let mut objects = files;
        objects.push(manifest_object);
        Ok(CheckpointArtifact {
            destination: destination.clone(),
            sequence: manifest.last_sequence,
            generation: manifest.generation,
            objects,
            marker_key,
        })
    }

    /// Upload table files with up to `thread_count` workers
    ///
    /// Workers pull the next file index from a shared counter and stop
    /// claiming work once any upload has failed.
    fn upload_tables(
        &self,
        files: &[TableFileMeta],
        destination: &BucketOptions,
        thread_count: usize,
    ) -> Result<Vec<CheckpointObject>> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let next = &AtomicUsize::new(0);
        let failed = &AtomicBool::new(false);
        let workers = thread_count.clamp(1, files.len());

        let results: Vec<Result<Vec<(usize, CheckpointObject)>>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    scope.spawn(move || {
                        let mut uploaded = Vec::new();
                        while !failed.load(Ordering::Relaxed) {
                            let index = next.fetch_add(1, Ordering::Relaxed);
                            let Some(meta) = files.get(index) else {
                                break;
                            };
                            match self.upload_table(meta, destination) {
                                Ok(object) => uploaded.push((index, object)),
                                Err(e) => {
                                    failed.store(true, Ordering::Relaxed);
                                    return Err(e);
                                }
                            }
                        }
                        Ok(uploaded)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(Error::Io(io::Error::new(
                            io::ErrorKind::Other,
                            "upload worker panicked",
                        )))
                    })
                })
                .collect()
        });

        let mut objects: Vec<Option<CheckpointObject>> = vec![None; files.len()];
        for result in results {
            for (index, object) in result? {
                objects[index] = Some(object);
            }
        }
        objects
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::Corruption("table upload left a file unaccounted".to_string()))
    }

    fn upload_table(
        &self,
        meta: &TableFileMeta,
        destination: &BucketOptions,
    ) -> Result<CheckpointObject> {
        let name = meta.file_name();
        let bytes = fs::read(self.dir.join(&name)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::Corruption(format!("table file {} missing", name)),
            _ => Error::Io(e),
        })?;
        if bytes.len() as u64 != meta.size || crc32fast::hash(&bytes) != meta.crc32 {
            return Err(Error::Corruption(format!(
                "table file {} does not match its manifest entry",
                name
            )));
        }

        let object = CheckpointObject::of(name, &bytes);
        self.client.put_object(
            &destination.bucket_name,
            &destination.object_key(&object.name),
            &bytes,
        )?;
        debug!(
            target: "cumulus::checkpoint",
            file = %object.name,
            size = object.size,
            "Uploaded table file"
        );
        Ok(object)
    }
}

/// Reads a checkpoint back out of an object store
pub struct CheckpointReader {
    client: RetryingClient,
    source: BucketOptions,
}

impl CheckpointReader {
    /// Reader for the checkpoint under `source`
    pub fn new(client: RetryingClient, source: BucketOptions) -> Self {
        CheckpointReader { client, source }
    }

    /// Where this reader looks
    pub fn source(&self) -> &BucketOptions {
        &self.source
    }

    /// Fetch and decode the marker
    ///
    /// A missing marker (or bucket) is `Error::CheckpointIncomplete`.
    pub fn read_marker(&self) -> Result<CheckpointMarker> {
        let key = self.source.object_key(CHECKPOINT_MARKER);
        match self.client.get_object(&self.source.bucket_name, &key) {
            Ok(bytes) => CheckpointMarker::from_json(&bytes),
            Err(e) if e.is_not_found() => Err(Error::CheckpointIncomplete(format!(
                "no {} marker under {}",
                CHECKPOINT_MARKER, self.source
            ))),
            Err(e) => Err(e),
        }
    }

    /// True if a marker is present
    pub fn is_complete(&self) -> Result<bool> {
        match self.read_marker() {
            Ok(_) => Ok(true),
            Err(Error::CheckpointIncomplete(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Download the checkpoint into `dir`
    ///
    /// Every object is checked against the size and checksum in the marker.
    /// The local MANIFEST is written last, so an interrupted restore leaves
    /// a directory `CloudTxnDb::open` does not mistake for a database.
    pub fn restore_into(&self, dir: &Path) -> Result<CheckpointMarker> {
        if ManifestManager::exists(dir) {
            return Err(Error::InvalidArgument(format!(
                "{} already holds a database",
                dir.display()
            )));
        }
        let marker = self.read_marker()?;
        fs::create_dir_all(dir)?;

        for object in &marker.files {
            let bytes = self.fetch(object)?;
            write_file_atomic(&dir.join(&object.name), &bytes)?;
        }

        let bytes = self.fetch(&marker.manifest)?;
        let manifest = Manifest::from_bytes(&bytes).map_err(Error::from)?;
        if manifest.database_id != marker.database_id
            || manifest.generation != marker.generation
            || manifest.last_sequence != marker.sequence
        {
            return Err(Error::Corruption(format!(
                "{} does not match the checkpoint marker",
                marker.manifest.name
            )));
        }
        write_file_atomic(&dir.join(MANIFEST_FILE_NAME), &bytes)?;

        info!(
            target: "cumulus::checkpoint",
            source = %self.source,
            dir = %dir.display(),
            sequence = marker.sequence.as_u64(),
            files = marker.files.len(),
            "Restored checkpoint"
        );
        Ok(marker)
    }

    fn fetch(&self, object: &CheckpointObject) -> Result<Vec<u8>> {
        let plain = Path::new(&object.name).file_name().and_then(|n| n.to_str());
        if plain != Some(object.name.as_str()) {
            return Err(Error::Corruption(format!(
                "checkpoint object name {:?} is not a plain file name",
                object.name
            )));
        }
        let key = self.source.object_key(&object.name);
        let bytes = match self.client.get_object(&self.source.bucket_name, &key) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => {
                return Err(Error::Corruption(format!(
                    "checkpoint object {} is missing",
                    key
                )))
            }
            Err(e) => return Err(e),
        };
        object.verify(&bytes)?;
        Ok(bytes)
    }
}
