//! Optimistic transaction handle
//!
//! Reads go straight to the version chains; writes are buffered in the
//! `TransactionContext` until `commit`, which validates the read-set and
//! applies the buffer as one batch under the commit lock.

use cumulus_concurrency::{TransactionContext, TransactionStatus};
use cumulus_core::{Key, Result, SequenceNumber, Storage};
use cumulus_storage::Snapshot;

use crate::database::{CloudTxnDb, ReadOptions, WriteOptions};

/// A transaction against a `CloudTxnDb`
///
/// Owned by one thread at a time. Dropping an active transaction rolls it
/// back.
pub struct Transaction<'db> {
    db: &'db CloudTxnDb,
    ctx: TransactionContext,
    write_options: WriteOptions,
}

impl<'db> Transaction<'db> {
    pub(crate) fn new(
        db: &'db CloudTxnDb,
        ctx: TransactionContext,
        write_options: WriteOptions,
    ) -> Self {
        Transaction {
            db,
            ctx,
            write_options,
        }
    }

    /// Transaction id
    pub fn id(&self) -> u64 {
        self.ctx.txn_id
    }

    /// Current status
    pub fn status(&self) -> &TransactionStatus {
        &self.ctx.status
    }

    /// True until commit or rollback
    pub fn is_active(&self) -> bool {
        self.ctx.is_active()
    }

    /// Read `key`
    ///
    /// Sees this transaction's own writes first, then the committed value as
    /// of `read_options.snapshot`, or the latest committed value. The key is
    /// not validated at commit unless this transaction later writes it.
    pub fn get(&mut self, read_options: &ReadOptions, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.ctx.ensure_active()?;
        let key = Key::from(key);
        if let Some(buffered) = self.ctx.buffered(&key) {
            return Ok(buffered.map(<[u8]>::to_vec));
        }

        self.pin();
        let read_at = self.read_point(read_options);
        let value = self.read_at(&key, read_at)?;
        if let Some(snapshot) = &read_options.snapshot {
            self.ctx.hold(snapshot.clone());
        }
        self.ctx.record_observed(key, read_at);
        Ok(value)
    }

    /// Read `key` and validate it at commit
    ///
    /// The key is anchored at the transaction's snapshot; commit fails with
    /// `Busy` if anything committed to it after that point.
    pub fn get_for_update(
        &mut self,
        read_options: &ReadOptions,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.ctx.ensure_active()?;
        let key = Key::from(key);
        let anchor = self.pin();
        self.ctx.record_read(key.clone(), anchor);

        if let Some(buffered) = self.ctx.buffered(&key) {
            return Ok(buffered.map(<[u8]>::to_vec));
        }
        let read_at = self.read_point(read_options);
        self.read_at(&key, read_at)
    }

    /// Buffer a put
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ctx.put(Key::from(key), value.to_vec())
    }

    /// Buffer a delete
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.ctx.delete(Key::from(key))
    }

    /// Re-pin the snapshot at the latest committed state
    ///
    /// Keys already read for update keep their original anchors.
    pub fn set_snapshot(&mut self) -> Result<()> {
        self.ctx.ensure_active()?;
        self.ctx.set_snapshot(self.db.coordinator().snapshot());
        Ok(())
    }

    /// The snapshot anchoring this transaction, if pinned
    pub fn snapshot(&self) -> Option<Snapshot> {
        self.ctx.snapshot().cloned()
    }

    /// Validate and apply
    ///
    /// Returns the sequence the batch was applied at, or `None` for a
    /// transaction that wrote nothing. Fails with `Error::Busy` when a key
    /// read for update changed after its anchor.
    ///
    /// A sync commit whose savepoint fails returns `Error::NotDurable`: the
    /// transaction is Committed and must not be re-run.
    pub fn commit(&mut self) -> Result<Option<SequenceNumber>> {
        let sequence = self.db.coordinator().commit(&mut self.ctx, self.db.store())?;
        if let Some(sequence) = sequence.filter(|_| self.write_options.sync) {
            self.db.sync_savepoint(sequence)?;
        }
        Ok(sequence)
    }

    /// Discard buffered writes and the read-set
    pub fn rollback(&mut self) {
        self.db.coordinator().abort(&mut self.ctx, "rollback");
    }

    fn pin(&mut self) -> SequenceNumber {
        let db = self.db;
        self.ctx.anchor_with(|| db.coordinator().snapshot())
    }

    fn read_point(&self, read_options: &ReadOptions) -> SequenceNumber {
        match &read_options.snapshot {
            Some(snapshot) => snapshot.sequence(),
            None => self.db.coordinator().visible_sequence(),
        }
    }

    fn read_at(&self, key: &Key, sequence: SequenceNumber) -> Result<Option<Vec<u8>>> {
        Ok(self
            .db
            .store()
            .get_at(key, sequence)?
            .and_then(|version| version.value))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.db.coordinator().abort(&mut self.ctx, "dropped");
    }
}
