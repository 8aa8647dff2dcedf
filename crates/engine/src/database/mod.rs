//! Database struct and open logic
//!
//! `CloudTxnDb` ties the layers together:
//! - Storage: version chains in a `MemStore`
//! - Transactions: a `TransactionCoordinator` over the sequence authority
//! - Durability: a `CheckpointCoordinator` owning the MANIFEST and table files
//! - Cloud: a `RetryingClient` for checkpoints and restores
//!
//! ## Opening
//!
//! `open` loads the MANIFEST, replays every table file it lists into the
//! memory store and resumes the sequence authority at the manifest's last
//! sequence. A directory without a MANIFEST is first restored from the
//! configured source bucket if a complete checkpoint is there, and
//! otherwise created (unless `create_if_missing` is off).

pub mod config;

pub use config::{DbConfig, ReadOptions, TransactionOptions, WriteOptions};

use std::path::Path;
use std::sync::Arc;

use cumulus_cloud::{
    BucketOptions, CheckpointToCloudOptions, ClientConfig, CloudConfig, ObjectStore,
    RetryingClient,
};
use cumulus_core::{DatabaseId, Error, Key, Result, SequenceNumber, Storage, WriteOp};
use cumulus_durability::{Manifest, ManifestManager, TableReader};
use cumulus_storage::{MemStore, SequenceAuthority, Snapshot, SnapshotList};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointArtifact, CheckpointCoordinator, CheckpointReader};
use crate::coordinator::{TransactionCoordinator, TransactionMetrics};
use crate::transaction::Transaction;

/// Key-value store with optimistic transactions and cloud checkpoints
pub trait TransactionalStore {
    /// Start a transaction
    fn begin_transaction(
        &self,
        write_options: &WriteOptions,
        txn_options: &TransactionOptions,
    ) -> Transaction<'_>;

    /// Committed value of `key` at `read_options.snapshot`, or the latest
    fn get(&self, read_options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write `key` outside any transaction
    fn put(&self, write_options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete `key` outside any transaction
    fn delete(&self, write_options: &WriteOptions, key: &[u8]) -> Result<()>;

    /// Pin the latest committed state
    fn get_snapshot(&self) -> Snapshot;

    /// Flush committed writes to a new table file and manifest generation
    fn savepoint(&self) -> Result<()>;

    /// Copy the durable state to `destination`
    fn checkpoint_to_cloud(
        &self,
        destination: &BucketOptions,
        options: &CheckpointToCloudOptions,
    ) -> Result<CheckpointArtifact>;
}

/// The database
pub struct CloudTxnDb {
    config: DbConfig,
    cloud: CloudConfig,
    database_id: DatabaseId,
    store: Arc<MemStore>,
    txns: Arc<TransactionCoordinator>,
    checkpoints: CheckpointCoordinator,
    client: RetryingClient,
}

impl CloudTxnDb {
    /// Open the database described by `config`
    ///
    /// Remote requests go to `object_store` under the retry strategy
    /// configured in `cloud`.
    pub fn open(
        config: DbConfig,
        cloud: CloudConfig,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let client = RetryingClient::from_config(object_store, &cloud);
        Self::open_with_client(config, cloud, client)
    }

    /// Open with an explicitly built client
    pub fn open_with_client(
        config: DbConfig,
        cloud: CloudConfig,
        client: RetryingClient,
    ) -> Result<Self> {
        config.validate()?;
        let cloud = cloud.prepare();
        if cloud.source.is_valid() || cloud.destination.is_valid() {
            cloud.validate()?;
        } else {
            cloud.credentials.check()?;
        }

        let dir = config.dir();
        let exists = ManifestManager::exists(dir);
        if exists && config.error_if_exists {
            return Err(Error::InvalidArgument(format!(
                "database {} already exists",
                dir.display()
            )));
        }

        let manifest = if exists {
            ManifestManager::load(dir)?
        } else if Self::restore_from_source(dir, &cloud, &client)? {
            ManifestManager::load(dir)?
        } else if config.create_if_missing {
            std::fs::create_dir_all(dir)?;
            ManifestManager::create(dir, DatabaseId::new())?
        } else {
            return Err(Error::InvalidArgument(format!(
                "database {} does not exist and create_if_missing is false",
                dir.display()
            )));
        };

        let store = Arc::new(MemStore::new());
        let loaded = load_tables(dir, manifest.manifest(), &store)?;

        let authority = Arc::new(SequenceAuthority::resume_from(
            manifest.manifest().last_sequence,
        ));
        let txns = Arc::new(TransactionCoordinator::new(
            authority,
            Arc::new(SnapshotList::new()),
        ));
        let database_id = manifest.manifest().database_id;

        info!(
            dir = %dir.display(),
            database_id = %database_id,
            sequence = manifest.manifest().last_sequence.as_u64(),
            generation = manifest.manifest().generation,
            files = manifest.manifest().files.len(),
            versions = loaded,
            "Opened database"
        );

        let checkpoints = CheckpointCoordinator::new(
            dir,
            Arc::clone(&store),
            Arc::clone(&txns),
            manifest,
            client.clone(),
        );

        Ok(CloudTxnDb {
            config,
            cloud,
            database_id,
            store,
            txns,
            checkpoints,
            client,
        })
    }

    fn restore_from_source(
        dir: &Path,
        cloud: &CloudConfig,
        client: &RetryingClient,
    ) -> Result<bool> {
        if !cloud.source.is_valid() {
            return Ok(false);
        }
        let reader = CheckpointReader::new(client.clone(), cloud.source.clone());
        match reader.restore_into(dir) {
            Ok(_) => Ok(true),
            Err(Error::CheckpointIncomplete(reason)) => {
                debug!(source = %cloud.source, reason = %reason, "Nothing to restore");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Database directory
    pub fn path(&self) -> &Path {
        self.config.dir()
    }

    /// Identity persisted in the manifest
    pub fn database_id(&self) -> DatabaseId {
        self.database_id
    }

    /// Cloud configuration, regions resolved
    pub fn cloud_config(&self) -> &CloudConfig {
        &self.cloud
    }

    /// Transport settings for the destination bucket
    pub fn client_config(&self) -> ClientConfig {
        self.cloud.client_config(&self.cloud.destination)
    }

    /// The retrying object store client
    pub fn client(&self) -> &RetryingClient {
        &self.client
    }

    /// Reader for a checkpoint under `source`, using this database's client
    pub fn checkpoint_reader(&self, source: BucketOptions) -> CheckpointReader {
        CheckpointReader::new(self.client.clone(), source)
    }

    pub(crate) fn coordinator(&self) -> &TransactionCoordinator {
        &self.txns
    }

    pub(crate) fn store(&self) -> &MemStore {
        &self.store
    }

    /// Highest committed sequence
    pub fn latest_sequence(&self) -> SequenceNumber {
        self.txns.visible_sequence()
    }

    /// Highest sequence persisted in the local manifest
    pub fn durable_sequence(&self) -> SequenceNumber {
        self.checkpoints.durable_sequence()
    }

    /// Copy of the current local manifest
    pub fn manifest(&self) -> Manifest {
        self.checkpoints.manifest()
    }

    /// Transaction statistics
    pub fn metrics(&self) -> TransactionMetrics {
        self.txns.metrics()
    }

    /// Apply `ops` atomically at one sequence, outside any transaction
    ///
    /// With `sync`, a savepoint follows. If it fails the batch stays applied
    /// and the error is `Error::NotDurable` carrying its sequence.
    pub fn write(&self, write_options: &WriteOptions, ops: &[WriteOp]) -> Result<SequenceNumber> {
        let sequence = self.txns.write(ops, self.store.as_ref())?;
        if write_options.sync {
            self.sync_savepoint(sequence)?;
        }
        Ok(sequence)
    }

    /// Savepoint after a sync write that was applied at `sequence`
    pub(crate) fn sync_savepoint(&self, sequence: SequenceNumber) -> Result<()> {
        self.checkpoints.savepoint().map(|_| ()).map_err(|e| {
            warn!(
                sequence = sequence.as_u64(),
                error = %e,
                "Sync savepoint failed after apply"
            );
            Error::NotDurable {
                sequence,
                source: Box::new(e),
            }
        })
    }

    /// Every live key/value pair at the read point, in key order
    pub fn scan(&self, read_options: &ReadOptions) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.store.scan_at(self.read_point(read_options))?;
        Ok(entries
            .into_iter()
            .map(|(key, value)| (key.into_bytes(), value))
            .collect())
    }

    /// Run `f` in a transaction, committing on `Ok` and rolling back on `Err`
    ///
    /// A commit conflict is returned as `Error::Busy`; the closure is not
    /// re-run.
    pub fn transaction<F, T>(&self, txn_options: &TransactionOptions, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut txn = self.begin_transaction(&WriteOptions::default(), txn_options);
        match f(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                txn.rollback();
                Err(e)
            }
        }
    }

    /// Prune versions no live snapshot can see
    ///
    /// Returns the number of versions removed. Deletes are forgotten only
    /// once a savepoint has persisted them.
    pub fn collect_garbage(&self) -> usize {
        let durable = self.checkpoints.durable_sequence();
        let authority = self.txns.manager().authority();
        let (watermark, _registry) = self.txns.manager().snapshots().watermark(authority);
        self.store.gc(watermark, durable)
    }

    fn read_point(&self, read_options: &ReadOptions) -> SequenceNumber {
        match &read_options.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => self.txns.visible_sequence(),
        }
    }
}

impl TransactionalStore for CloudTxnDb {
    fn begin_transaction(
        &self,
        write_options: &WriteOptions,
        txn_options: &TransactionOptions,
    ) -> Transaction<'_> {
        let ctx = self.txns.begin(txn_options.set_snapshot);
        Transaction::new(self, ctx, *write_options)
    }

    fn get(&self, read_options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let version = self
            .store
            .get_at(&Key::from(key), self.read_point(read_options))?;
        Ok(version.and_then(|v| v.value))
    }

    fn put(&self, write_options: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        let op = WriteOp::Put {
            key: Key::from(key),
            value: value.to_vec(),
        };
        self.write(write_options, &[op]).map(|_| ())
    }

    fn delete(&self, write_options: &WriteOptions, key: &[u8]) -> Result<()> {
        let op = WriteOp::Delete {
            key: Key::from(key),
        };
        self.write(write_options, &[op]).map(|_| ())
    }

    fn get_snapshot(&self) -> Snapshot {
        self.txns.snapshot()
    }

    fn savepoint(&self) -> Result<()> {
        self.checkpoints.savepoint().map(|_| ())
    }

    fn checkpoint_to_cloud(
        &self,
        destination: &BucketOptions,
        options: &CheckpointToCloudOptions,
    ) -> Result<CheckpointArtifact> {
        self.checkpoints.checkpoint_to_cloud(destination, options)
    }
}

/// Replay every table file listed in `manifest`, oldest first
fn load_tables(dir: &Path, manifest: &Manifest, store: &MemStore) -> Result<usize> {
    let mut loaded = 0;
    for meta in &manifest.files {
        if meta.largest_sequence > manifest.last_sequence {
            return Err(Error::Corruption(format!(
                "{} holds sequence {} beyond the manifest's {}",
                meta.file_name(),
                meta.largest_sequence,
                manifest.last_sequence
            )));
        }
        for (key, value) in TableReader::read(dir, meta)? {
            store.load(key, value);
            loaded += 1;
        }
        debug!(file = %meta.file_name(), "Loaded table file");
    }
    Ok(loaded)
}
