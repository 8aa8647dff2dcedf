//! In-memory multi-version store
//!
//! # Design
//!
//! - DashMap: sharded map keyed by user key, lock-free reads per shard
//! - VersionChain: versions of one key, newest first
//!
//! Visibility is not enforced here. Writers apply a batch at a sequence
//! that has not been published yet, and readers never ask for a sequence
//! above the published one, so a half-applied batch is never observed.

use std::collections::VecDeque;

use cumulus_core::{Key, Result, SequenceNumber, Storage, VersionedValue, WriteOp};
use dashmap::DashMap;
use tracing::debug;

/// Versions of a single key, newest first
#[derive(Debug, Clone, Default)]
pub struct VersionChain {
    versions: VecDeque<VersionedValue>,
}

impl VersionChain {
    /// Chain holding a single version
    pub fn new(value: VersionedValue) -> Self {
        let mut versions = VecDeque::with_capacity(4);
        versions.push_front(value);
        Self { versions }
    }

    /// Add a version
    ///
    /// A version at the same sequence as the newest one replaces it, so the
    /// last operation on a key within one batch wins. Out-of-order versions
    /// (only seen while loading table files) are inserted at their position.
    pub fn push(&mut self, value: VersionedValue) {
        match self.versions.front() {
            None => self.versions.push_front(value),
            Some(front) if value.sequence > front.sequence => self.versions.push_front(value),
            Some(front) if value.sequence == front.sequence => self.versions[0] = value,
            Some(_) => {
                let pos = self
                    .versions
                    .iter()
                    .position(|v| v.sequence <= value.sequence)
                    .unwrap_or(self.versions.len());
                match self.versions.get(pos) {
                    Some(existing) if existing.sequence == value.sequence => {
                        self.versions[pos] = value
                    }
                    _ => self.versions.insert(pos, value),
                }
            }
        }
    }

    /// Newest version with sequence <= `max_sequence`
    pub fn get_at(&self, max_sequence: SequenceNumber) -> Option<&VersionedValue> {
        self.versions.iter().find(|v| v.sequence <= max_sequence)
    }

    /// Newest version
    #[inline]
    pub fn latest(&self) -> Option<&VersionedValue> {
        self.versions.front()
    }

    /// Number of retained versions
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// True if no versions are retained
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Drop versions no snapshot at or above `watermark` can read
    ///
    /// Keeps every version newer than `watermark` plus the newest version at
    /// or below it. Returns the number of versions removed.
    pub fn gc(&mut self, watermark: SequenceNumber) -> usize {
        match self.versions.iter().position(|v| v.sequence <= watermark) {
            Some(pos) => {
                let before = self.versions.len();
                self.versions.truncate(pos + 1);
                before - self.versions.len()
            }
            None => 0,
        }
    }
}

/// Concurrent multi-version key/value store
#[derive(Debug, Default)]
pub struct MemStore {
    data: DashMap<Key, VersionChain>,
}

impl MemStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with at least one retained version
    pub fn key_count(&self) -> usize {
        self.data.len()
    }

    /// Total number of retained versions across all keys
    pub fn version_count(&self) -> usize {
        self.data.iter().map(|e| e.value().len()).sum()
    }

    /// Insert a recovered version without going through a batch
    pub fn load(&self, key: Key, value: VersionedValue) {
        self.data
            .entry(key)
            .and_modify(|chain| chain.push(value.clone()))
            .or_insert_with(|| VersionChain::new(value));
    }

    /// Newest version of every key written in `(after, upto]`, in key order
    ///
    /// Tombstones are included so a flush can persist deletes.
    pub fn changes_between(
        &self,
        after: SequenceNumber,
        upto: SequenceNumber,
    ) -> Vec<(Key, VersionedValue)> {
        let mut out: Vec<(Key, VersionedValue)> = self
            .data
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .get_at(upto)
                    .filter(|v| v.sequence > after)
                    .map(|v| (entry.key().clone(), v.clone()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Prune versions below `watermark`
    ///
    /// A key whose only remaining version is a tombstone at or below both
    /// `watermark` and `durable` is removed entirely; `durable` is the
    /// highest sequence already persisted, so an unflushed delete is never
    /// forgotten. Returns the number of versions removed.
    pub fn gc(&self, watermark: SequenceNumber, durable: SequenceNumber) -> usize {
        let drop_below = watermark.min(durable);
        let mut removed = 0;
        self.data.retain(|_, chain| {
            removed += chain.gc(watermark);
            let dead = chain.len() == 1
                && chain
                    .latest()
                    .is_some_and(|v| v.is_tombstone() && v.sequence <= drop_below);
            if dead {
                removed += 1;
            }
            !dead
        });
        debug!(
            watermark = watermark.as_u64(),
            durable = durable.as_u64(),
            removed,
            "Pruned version chains"
        );
        removed
    }
}

impl Storage for MemStore {
    fn get_at(&self, key: &Key, max_sequence: SequenceNumber) -> Result<Option<VersionedValue>> {
        Ok(self
            .data
            .get(key)
            .and_then(|chain| chain.get_at(max_sequence).cloned()))
    }

    fn latest_sequence(&self, key: &Key) -> Result<Option<SequenceNumber>> {
        Ok(self
            .data
            .get(key)
            .and_then(|chain| chain.latest().map(|v| v.sequence)))
    }

    fn apply_batch(&self, ops: &[WriteOp], sequence: SequenceNumber) -> Result<()> {
        for op in ops {
            let version = op.to_version(sequence);
            match self.data.get_mut(op.key()) {
                Some(mut chain) => chain.push(version),
                None => {
                    self.data.insert(op.key().clone(), VersionChain::new(version));
                }
            }
        }
        Ok(())
    }

    fn scan_at(&self, max_sequence: SequenceNumber) -> Result<Vec<(Key, Vec<u8>)>> {
        let mut out: Vec<(Key, Vec<u8>)> = self
            .data
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .get_at(max_sequence)
                    .and_then(|v| v.value.clone())
                    .map(|value| (entry.key().clone(), value))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(MemStore: Send, Sync);

    fn seq(n: u64) -> SequenceNumber {
        SequenceNumber::new(n)
    }

    fn put(key: &str, value: &str) -> WriteOp {
        WriteOp::Put {
            key: Key::from(key),
            value: value.as_bytes().to_vec(),
        }
    }

    fn del(key: &str) -> WriteOp {
        WriteOp::Delete { key: Key::from(key) }
    }

    // ========================================================================
    // VersionChain
    // ========================================================================

    #[test]
    fn test_chain_get_at_picks_newest_not_after() {
        let mut chain = VersionChain::new(VersionedValue::new(b"1".to_vec(), seq(1)));
        chain.push(VersionedValue::new(b"3".to_vec(), seq(3)));
        chain.push(VersionedValue::new(b"5".to_vec(), seq(5)));

        assert!(chain.get_at(seq(0)).is_none());
        assert_eq!(chain.get_at(seq(2)).unwrap().sequence, seq(1));
        assert_eq!(chain.get_at(seq(4)).unwrap().sequence, seq(3));
        assert_eq!(chain.get_at(seq(99)).unwrap().sequence, seq(5));
    }

    #[test]
    fn test_chain_same_sequence_replaces() {
        let mut chain = VersionChain::new(VersionedValue::new(b"a".to_vec(), seq(2)));
        chain.push(VersionedValue::tombstone(seq(2)));
        assert_eq!(chain.len(), 1);
        assert!(chain.latest().unwrap().is_tombstone());
    }

    #[test]
    fn test_chain_out_of_order_insert() {
        let mut chain = VersionChain::new(VersionedValue::new(b"5".to_vec(), seq(5)));
        chain.push(VersionedValue::new(b"2".to_vec(), seq(2)));
        chain.push(VersionedValue::new(b"3".to_vec(), seq(3)));
        assert_eq!(chain.latest().unwrap().sequence, seq(5));
        assert_eq!(chain.get_at(seq(4)).unwrap().sequence, seq(3));
        assert_eq!(chain.get_at(seq(2)).unwrap().sequence, seq(2));
    }

    #[test]
    fn test_chain_gc_keeps_newest_below_watermark() {
        let mut chain = VersionChain::new(VersionedValue::new(b"1".to_vec(), seq(1)));
        chain.push(VersionedValue::new(b"2".to_vec(), seq(2)));
        chain.push(VersionedValue::new(b"4".to_vec(), seq(4)));

        let removed = chain.gc(seq(3));
        assert_eq!(removed, 1);
        assert_eq!(chain.len(), 2);
        // A snapshot at 3 still reads version 2
        assert_eq!(chain.get_at(seq(3)).unwrap().sequence, seq(2));
    }

    #[test]
    fn test_chain_gc_nothing_below_watermark() {
        let mut chain = VersionChain::new(VersionedValue::new(b"9".to_vec(), seq(9)));
        assert_eq!(chain.gc(seq(3)), 0);
        assert_eq!(chain.len(), 1);
    }

    // ========================================================================
    // MemStore
    // ========================================================================

    #[test]
    fn test_apply_and_read_at_sequence() {
        let store = MemStore::new();
        store.apply_batch(&[put("k", "v1")], seq(1)).unwrap();
        store.apply_batch(&[put("k", "v2")], seq(2)).unwrap();

        let k = Key::from("k");
        assert_eq!(store.get_at(&k, seq(1)).unwrap().unwrap().value, Some(b"v1".to_vec()));
        assert_eq!(store.get_at(&k, seq(2)).unwrap().unwrap().value, Some(b"v2".to_vec()));
        assert!(store.get_at(&k, seq(0)).unwrap().is_none());
        assert_eq!(store.latest_sequence(&k).unwrap(), Some(seq(2)));
    }

    #[test]
    fn test_last_op_in_batch_wins() {
        let store = MemStore::new();
        store.apply_batch(&[put("k", "a"), put("k", "b"), del("k")], seq(1)).unwrap();
        let v = store.get_at(&Key::from("k"), seq(1)).unwrap().unwrap();
        assert!(v.is_tombstone());
        assert_eq!(store.version_count(), 1);
    }

    #[test]
    fn test_tombstone_counts_for_latest_sequence() {
        let store = MemStore::new();
        store.apply_batch(&[put("k", "a")], seq(1)).unwrap();
        store.apply_batch(&[del("k")], seq(2)).unwrap();
        assert_eq!(store.latest_sequence(&Key::from("k")).unwrap(), Some(seq(2)));
        assert_eq!(store.latest_sequence(&Key::from("missing")).unwrap(), None);
    }

    #[test]
    fn test_scan_skips_tombstones_and_sorts() {
        let store = MemStore::new();
        store
            .apply_batch(&[put("b", "2"), put("a", "1"), put("c", "3")], seq(1))
            .unwrap();
        store.apply_batch(&[del("b")], seq(2)).unwrap();

        let at1: Vec<_> = store.scan_at(seq(1)).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(at1, vec![Key::from("a"), Key::from("b"), Key::from("c")]);

        let at2: Vec<_> = store.scan_at(seq(2)).unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(at2, vec![Key::from("a"), Key::from("c")]);
    }

    #[test]
    fn test_changes_between_returns_newest_in_range() {
        let store = MemStore::new();
        store.apply_batch(&[put("a", "1"), put("b", "1")], seq(1)).unwrap();
        store.apply_batch(&[put("a", "2")], seq(2)).unwrap();
        store.apply_batch(&[del("b")], seq(3)).unwrap();
        store.apply_batch(&[put("a", "4")], seq(4)).unwrap();

        let changes = store.changes_between(seq(1), seq(3));
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].0, Key::from("a"));
        assert_eq!(changes[0].1.sequence, seq(2));
        assert_eq!(changes[1].0, Key::from("b"));
        assert!(changes[1].1.is_tombstone());

        assert!(store.changes_between(seq(4), seq(4)).is_empty());
    }

    #[test]
    fn test_gc_respects_durable_for_tombstones() {
        let store = MemStore::new();
        store.apply_batch(&[put("k", "v")], seq(1)).unwrap();
        store.apply_batch(&[del("k")], seq(2)).unwrap();

        // Delete not yet persisted: the tombstone must survive
        store.gc(seq(2), seq(1));
        assert_eq!(store.key_count(), 1);
        assert!(store.get_at(&Key::from("k"), seq(2)).unwrap().unwrap().is_tombstone());

        // Once persisted, the dead key disappears
        store.gc(seq(2), seq(2));
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn test_gc_preserves_snapshot_reads() {
        let store = MemStore::new();
        for i in 1..=5 {
            store.apply_batch(&[put("k", &i.to_string())], seq(i)).unwrap();
        }
        store.gc(seq(3), seq(5));

        let k = Key::from("k");
        assert_eq!(store.get_at(&k, seq(3)).unwrap().unwrap().value, Some(b"3".to_vec()));
        assert_eq!(store.get_at(&k, seq(5)).unwrap().unwrap().value, Some(b"5".to_vec()));
        assert_eq!(store.version_count(), 3);
    }

    #[test]
    fn test_load_out_of_order() {
        let store = MemStore::new();
        store.load(Key::from("k"), VersionedValue::new(b"new".to_vec(), seq(7)));
        store.load(Key::from("k"), VersionedValue::new(b"old".to_vec(), seq(3)));
        let k = Key::from("k");
        assert_eq!(store.get_at(&k, seq(5)).unwrap().unwrap().value, Some(b"old".to_vec()));
        assert_eq!(store.latest_sequence(&k).unwrap(), Some(seq(7)));
    }
}
