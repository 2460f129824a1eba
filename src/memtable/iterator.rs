//! Snapshot iteration over a skiplist, and the two-way merge of two
//! snapshots.

use crate::encoding;

use super::skiplist::SkipList;

/// Forward-only snapshot iterator. Creation captures a timestamp; entries
/// written after it, including newer versions of keys already visited, are
/// invisible. Dropping the iterator releases its reference on the list.
pub struct Iter<'a> {
    list: &'a SkipList,
    ts: u64,
    curr: u32,
}

impl<'a> Iter<'a> {
    pub(super) fn new(list: &'a SkipList) -> Self {
        Self {
            list,
            ts: encoding::now_micros(),
            curr: 0,
        }
    }

    /// The snapshot timestamp this iterator is bound to.
    pub fn timestamp(&self) -> u64 {
        self.ts
    }

    /// Position at the first visible entry.
    pub fn seek_to_first(&mut self) {
        self.curr = self.list.arena().node(self.list.head()).next(0);
        self.skip_invisible();
    }

    /// Position at the smallest entry whose raw key is >= `raw_key` and
    /// whose version is at or before the snapshot.
    pub fn seek(&mut self, raw_key: &[u8]) {
        let target = encoding::internal_key_at(raw_key, self.ts);
        self.curr = self.list.seek_offset(&target);
        self.skip_invisible();
    }

    /// Whether the iterator is positioned on an entry. `key`/`value` may
    /// only be called while this returns true.
    pub fn valid(&self) -> bool {
        self.curr != 0
    }

    /// Internal key (raw bytes plus timestamp) at the current position.
    pub fn key(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        let arena = self.list.arena();
        arena.node(self.curr).key(arena)
    }

    /// Raw key at the current position.
    pub fn raw_key(&self) -> &'a [u8] {
        encoding::raw(self.key())
    }

    /// Value at the current position.
    pub fn value(&self) -> &'a [u8] {
        debug_assert!(self.valid());
        let arena = self.list.arena();
        arena.node(self.curr).value(arena)
    }

    /// Step forward along level 0.
    pub fn advance(&mut self) {
        if self.curr == 0 {
            return;
        }
        self.curr = self.list.arena().node(self.curr).next(0);
        self.skip_invisible();
    }

    fn skip_invisible(&mut self) {
        let arena = self.list.arena();
        while self.curr != 0 {
            let node = arena.node(self.curr);
            if encoding::timestamp(node.key(arena)) <= self.ts {
                break;
            }
            self.curr = node.next(0);
        }
    }
}

impl Drop for Iter<'_> {
    fn drop(&mut self) {
        self.list.release_ref();
    }
}

/// Unifies two snapshot iterators, emitting entries in raw-key order. On a
/// raw-key tie the first (newer) side wins and both sides advance, so the
/// older version never surfaces. Exhaustion of one side degenerates to
/// pass-through of the other.
pub struct MergeIter<'a> {
    newer: Iter<'a>,
    older: Iter<'a>,
}

enum Side {
    Newer,
    Older,
    Both,
}

impl<'a> MergeIter<'a> {
    /// Build from two iterators; `newer` wins raw-key ties. Both iterators
    /// are positioned at their first entries.
    pub fn new(mut newer: Iter<'a>, mut older: Iter<'a>) -> Self {
        newer.seek_to_first();
        older.seek_to_first();
        Self { newer, older }
    }

    pub fn valid(&self) -> bool {
        self.newer.valid() || self.older.valid()
    }

    pub fn key(&self) -> &'a [u8] {
        match self.pick() {
            Side::Older => self.older.key(),
            _ => self.newer.key(),
        }
    }

    pub fn raw_key(&self) -> &'a [u8] {
        encoding::raw(self.key())
    }

    pub fn value(&self) -> &'a [u8] {
        match self.pick() {
            Side::Older => self.older.value(),
            _ => self.newer.value(),
        }
    }

    pub fn advance(&mut self) {
        match self.pick() {
            Side::Newer => self.newer.advance(),
            Side::Older => self.older.advance(),
            Side::Both => {
                self.newer.advance();
                self.older.advance();
            }
        }
    }

    fn pick(&self) -> Side {
        if !self.older.valid() {
            return Side::Newer;
        }
        if !self.newer.valid() {
            return Side::Older;
        }
        match self.newer.raw_key().cmp(self.older.raw_key()) {
            std::cmp::Ordering::Less => Side::Newer,
            std::cmp::Ordering::Greater => Side::Older,
            std::cmp::Ordering::Equal => Side::Both,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn pause() {
        std::thread::sleep(Duration::from_millis(2));
    }

    fn collect(mut merge: MergeIter) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        while merge.valid() {
            out.push((merge.raw_key().to_vec(), merge.value().to_vec()));
            merge.advance();
        }
        out
    }

    #[test]
    fn test_seek_lands_on_lower_bound() {
        let list = SkipList::new(1 << 20).unwrap();
        for key in [&b"apple"[..], b"banana", b"cherry"] {
            list.insert(key, key).unwrap();
        }
        pause();

        let mut iter = list.iter();
        iter.seek(b"b");
        assert!(iter.valid());
        assert_eq!(iter.raw_key(), b"banana");

        iter.seek(b"banana");
        assert_eq!(iter.raw_key(), b"banana");

        iter.seek(b"zebra");
        assert!(!iter.valid());
    }

    #[test]
    fn test_merge_prefers_newer_side_on_ties() {
        let older = SkipList::new(1 << 20).unwrap();
        older.insert(b"a", b"0").unwrap();
        older.insert(b"b", b"2").unwrap();
        pause();
        let newer = SkipList::new(1 << 20).unwrap();
        newer.insert(b"a", b"1").unwrap();
        newer.insert(b"c", b"3").unwrap();
        pause();

        let merged = collect(MergeIter::new(newer.iter(), older.iter()));
        assert_eq!(
            merged,
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_merge_with_exhausted_side() {
        let empty = SkipList::new(1 << 20).unwrap();
        let full = SkipList::new(1 << 20).unwrap();
        full.insert(b"k1", b"v1").unwrap();
        full.insert(b"k2", b"v2").unwrap();
        pause();

        let merged = collect(MergeIter::new(empty.iter(), full.iter()));
        assert_eq!(
            merged,
            vec![
                (b"k1".to_vec(), b"v1".to_vec()),
                (b"k2".to_vec(), b"v2".to_vec()),
            ]
        );
    }
}
