//! Snapshot registry
//!
//! A snapshot is a sequence number that readers resolve against: every
//! read through it sees exactly the batches with sequence <= its anchor.
//! The registry counts live handles per anchor so garbage collection can
//! find the oldest sequence any reader may still ask for.
//!
//! Handles are RAII: dropping the last clone of a `Snapshot` releases it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use cumulus_core::SequenceNumber;
use parking_lot::{Mutex, MutexGuard};

use crate::sequence::SequenceAuthority;

/// Lock on the registry held while garbage collection prunes versions
pub type RegistryGuard<'a> = MutexGuard<'a, BTreeMap<SequenceNumber, usize>>;

/// Reference-counted registry of live snapshot anchors
#[derive(Debug, Default)]
pub struct SnapshotList {
    live: Mutex<BTreeMap<SequenceNumber, usize>>,
}

impl SnapshotList {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a snapshot at the currently visible sequence
    ///
    /// The visible sequence is read while the registry lock is held, so a
    /// concurrent garbage collection pass cannot compute a watermark above
    /// the new anchor.
    pub fn acquire(self: &Arc<Self>, authority: &SequenceAuthority) -> Snapshot {
        let mut live = self.live.lock();
        let sequence = authority.visible();
        *live.entry(sequence).or_insert(0) += 1;
        Snapshot {
            sequence,
            list: Arc::clone(self),
        }
    }

    /// Oldest live anchor, if any snapshot is held
    pub fn oldest(&self) -> Option<SequenceNumber> {
        self.live.lock().keys().next().copied()
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.live.lock().values().sum()
    }

    /// True if no snapshot is held
    pub fn is_empty(&self) -> bool {
        self.live.lock().is_empty()
    }

    /// Lock the registry and compute the GC watermark
    ///
    /// The watermark is the oldest live anchor, or the visible sequence when
    /// no snapshot is held. New snapshots block until the guard is dropped.
    pub fn watermark(&self, authority: &SequenceAuthority) -> (SequenceNumber, RegistryGuard<'_>) {
        let live = self.live.lock();
        let visible = authority.visible();
        let watermark = live.keys().next().copied().map_or(visible, |s| s.min(visible));
        (watermark, live)
    }

    fn retain(&self, sequence: SequenceNumber) {
        *self.live.lock().entry(sequence).or_insert(0) += 1;
    }

    fn release(&self, sequence: SequenceNumber) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(&sequence) {
            *count -= 1;
            if *count == 0 {
                live.remove(&sequence);
            }
        }
    }
}

/// Handle to a pinned read view
///
/// Cloning registers an additional reference; the anchor stays pinned
/// until every clone is dropped.
pub struct Snapshot {
    sequence: SequenceNumber,
    list: Arc<SnapshotList>,
}

impl Snapshot {
    /// The anchor sequence this snapshot reads at
    #[inline]
    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }
}

impl Clone for Snapshot {
    fn clone(&self) -> Self {
        self.list.retain(self.sequence);
        Snapshot {
            sequence: self.sequence,
            list: Arc::clone(&self.list),
        }
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.list.release(self.sequence);
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl PartialEq for Snapshot {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(Snapshot: Send, Sync);
    static_assertions::assert_impl_all!(SnapshotList: Send, Sync);

    fn setup() -> (Arc<SnapshotList>, SequenceAuthority) {
        (Arc::new(SnapshotList::new()), SequenceAuthority::new())
    }

    #[test]
    fn test_acquire_anchors_at_visible() {
        let (list, auth) = setup();
        let seq = auth.allocate();
        auth.publish(seq);

        let snap = list.acquire(&auth);
        assert_eq!(snap.sequence(), seq);
        assert_eq!(list.oldest(), Some(seq));
    }

    #[test]
    fn test_drop_releases() {
        let (list, auth) = setup();
        {
            let _snap = list.acquire(&auth);
            assert_eq!(list.len(), 1);
        }
        assert!(list.is_empty());
        assert_eq!(list.oldest(), None);
    }

    #[test]
    fn test_clone_keeps_anchor_pinned() {
        let (list, auth) = setup();
        let snap = list.acquire(&auth);
        let copy = snap.clone();
        drop(snap);
        assert_eq!(list.oldest(), Some(copy.sequence()));
        drop(copy);
        assert!(list.is_empty());
    }

    #[test]
    fn test_oldest_tracks_minimum() {
        let (list, auth) = setup();
        let s1 = auth.allocate();
        auth.publish(s1);
        let old = list.acquire(&auth);

        let s2 = auth.allocate();
        auth.publish(s2);
        let young = list.acquire(&auth);

        assert_eq!(list.oldest(), Some(s1));
        drop(old);
        assert_eq!(list.oldest(), Some(s2));
        drop(young);
    }

    #[test]
    fn test_watermark_without_snapshots_is_visible() {
        let (list, auth) = setup();
        let s = auth.allocate();
        auth.publish(s);
        let (wm, _guard) = list.watermark(&auth);
        assert_eq!(wm, s);
    }

    #[test]
    fn test_watermark_bounded_by_oldest_snapshot() {
        let (list, auth) = setup();
        let s1 = auth.allocate();
        auth.publish(s1);
        let _held = list.acquire(&auth);
        let s2 = auth.allocate();
        auth.publish(s2);

        let (wm, _guard) = list.watermark(&auth);
        assert_eq!(wm, s1);
    }
}
