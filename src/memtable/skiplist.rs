//! Lock-free concurrent skiplist over an arena.
//!
//! Nodes live inside the arena and link to each other through 32-bit arena
//! offsets, with 0 encoding nil. Each logical key is stored as an internal
//! key (raw bytes plus timestamp), so repeated inserts of the same key
//! produce distinct versions ordered newest-first. Inserts link level 0
//! first, which publishes the node; readers that race with an insert may
//! miss the upper-level shortcuts and simply fall through to level 0.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::encoding;
use crate::error::{Error, Result};

use super::arena::Arena;
use super::iterator::Iter;

/// Maximum tower height. Node heights are level indexes in
/// `0..MAX_HEIGHT`.
pub const MAX_HEIGHT: usize = 25;

/// A skiplist node, stored packed inside the arena. The `next` tower is
/// trimmed at allocation time to `top_level + 1` entries, so short nodes
/// never pay for the full array.
#[repr(C)]
pub(super) struct Node {
    pub(super) key_size: u16,
    pub(super) key_off: u32,
    pub(super) val_size: u32,
    pub(super) val_off: u32,
    pub(super) top_level: u32,
    next: [AtomicU32; MAX_HEIGHT],
}

impl Node {
    /// Allocation size for a node whose tower reaches `top_level`.
    pub(super) fn size(top_level: usize) -> usize {
        std::mem::size_of::<Node>()
            - (MAX_HEIGHT - 1 - top_level) * std::mem::size_of::<AtomicU32>()
    }

    pub(super) fn key<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        arena.slice(self.key_off, self.key_size as u32)
    }

    pub(super) fn value<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        arena.slice(self.val_off, self.val_size)
    }

    pub(super) fn next(&self, level: usize) -> u32 {
        self.next[level].load(Ordering::Acquire)
    }

    fn set_next(&self, level: usize, off: u32) {
        self.next[level].store(off, Ordering::Relaxed)
    }

    fn cas_next(&self, level: usize, old: u32, new: u32) -> bool {
        self.next[level]
            .compare_exchange(old, new, Ordering::Release, Ordering::Acquire)
            .is_ok()
    }
}

/// Remembered `(prev, succ)` positions from a previous insert, used to
/// amortise near-sorted insert cost. A hint belongs to a single writer;
/// sharing one across threads loses the benefit but stays safe because
/// every hint entry is verified before use.
pub struct Hint {
    /// Levels `0..len` hold meaningful positions.
    len: usize,
    prev: [u32; MAX_HEIGHT],
    succ: [u32; MAX_HEIGHT],
}

impl Hint {
    pub fn new() -> Self {
        Self {
            len: 0,
            prev: [0; MAX_HEIGHT],
            succ: [0; MAX_HEIGHT],
        }
    }
}

impl Default for Hint {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrent ordered map of versioned keys to values.
pub struct SkipList {
    arena: Arena,
    head: u32,
    height: AtomicU32,
    refs: AtomicUsize,
}

impl SkipList {
    /// Create a skiplist backed by a fresh arena of `capacity` bytes. The
    /// head node is seeded first so that offset 0 is never handed to a
    /// payload allocation.
    pub fn new(capacity: u32) -> Result<Self> {
        let arena = Arena::new(capacity);
        let (head, _, _) = arena
            .alloc_node(MAX_HEIGHT - 1, &[], &[])
            .map_err(|_| Error::InvalidInput("memtable capacity below head node size".into()))?;
        // SAFETY: the head was just allocated and is not shared yet.
        unsafe {
            arena.node_mut(head).top_level = (MAX_HEIGHT - 1) as u32;
        }
        Ok(Self {
            arena,
            head,
            height: AtomicU32::new(0),
            refs: AtomicUsize::new(0),
        })
    }

    /// Insert a version of `key` bound to the current timestamp. Fails only
    /// with `SizeFull` once the arena is exhausted, at which point the list
    /// is treated as frozen by the layer above.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let ikey = self.stamped(key)?;
        self.insert_internal(&ikey, value, None)
    }

    /// Same as `insert`, reusing a caller-owned hint from the previous
    /// insert. Near-sorted workloads skip most of the descent.
    pub fn insert_with_hint(
        &self,
        key: &[u8],
        value: &[u8],
        hint: Option<&mut Hint>,
    ) -> Result<()> {
        let hint = hint.ok_or(Error::NilHint)?;
        let ikey = self.stamped(key)?;
        self.insert_internal(&ikey, value, Some(hint))
    }

    fn stamped(&self, key: &[u8]) -> Result<Vec<u8>> {
        if key.is_empty() {
            return Err(Error::InvalidInput("empty key".into()));
        }
        if key.len() > encoding::MAX_KEY_SIZE {
            return Err(Error::InvalidInput(format!(
                "key length {} exceeds {}",
                key.len(),
                encoding::MAX_KEY_SIZE
            )));
        }
        Ok(encoding::internal_key(key))
    }

    fn insert_internal(&self, ikey: &[u8], value: &[u8], hint: Option<&mut Hint>) -> Result<()> {
        if value.len() > encoding::MAX_VALUE_SIZE {
            return Err(Error::InvalidInput(format!(
                "value length {} exceeds {}",
                value.len(),
                encoding::MAX_VALUE_SIZE
            )));
        }
        let top = random_height();
        let (node_off, key_off, val_off) = self.arena.alloc_node(top, ikey, value)?;
        // SAFETY: the node is unpublished until the level-0 CAS below.
        unsafe {
            let node = self.arena.node_mut(node_off);
            node.key_size = ikey.len() as u16;
            node.key_off = key_off;
            node.val_size = value.len() as u32;
            node.val_off = val_off;
            node.top_level = top as u32;
        }

        self.promote_height(top);
        let height = self.height.load(Ordering::Acquire) as usize;

        let mut prev = [0u32; MAX_HEIGHT];
        let mut succ = [0u32; MAX_HEIGHT];
        match &hint {
            Some(h) => self.bounds_with_hint(ikey, height, h, &mut prev, &mut succ),
            None => self.bounds(ikey, height, &mut prev, &mut succ),
        }

        // Link bottom-up: level 0 publishes the node, upper levels only add
        // shortcuts. A failed CAS means a racing insert landed between prev
        // and succ; the stale prev is still a lower bound, so the re-search
        // starts from it rather than from the head.
        for level in 0..=top {
            loop {
                self.arena.node(node_off).set_next(level, succ[level]);
                if self.arena.node(prev[level]).cas_next(level, succ[level], node_off) {
                    break;
                }
                let (p, s) = self.bounds_at(ikey, level, prev[level]);
                prev[level] = p;
                succ[level] = s;
            }
        }

        if let Some(h) = hint {
            // The freshly linked node is the best finger for the next
            // near-sorted insert: it precedes any larger key, and its next
            // pointers are exactly the succs recorded at link time.
            for level in 0..=top {
                h.prev[level] = node_off;
                h.succ[level] = succ[level];
            }
            for level in top + 1..=height {
                h.prev[level] = prev[level];
                h.succ[level] = succ[level];
            }
            h.len = height + 1;
        }
        Ok(())
    }

    /// Most recent value for `key`, or None. Tombstones are returned as
    /// stored; interpreting them is the caller's business.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.get_at(key, u64::MAX)
    }

    /// Most recent value whose version is at or before `ts`.
    pub(crate) fn get_at(&self, key: &[u8], ts: u64) -> Option<&[u8]> {
        let target = encoding::internal_key_at(key, ts);
        let off = self.seek_offset(&target);
        if off == 0 {
            return None;
        }
        let node = self.arena.node(off);
        if encoding::raw(node.key(&self.arena)) == key {
            Some(node.value(&self.arena))
        } else {
            None
        }
    }

    /// Snapshot iterator bound to the current timestamp. Holding one blocks
    /// `close` until it is dropped.
    pub fn iter(&self) -> Iter<'_> {
        self.refs.fetch_add(1, Ordering::SeqCst);
        Iter::new(self)
    }

    /// Release check before the enclosing memtable drops the arena.
    pub fn close(&self) -> Result<()> {
        if self.refs.load(Ordering::SeqCst) != 0 {
            return Err(Error::StillReferenced);
        }
        Ok(())
    }

    /// Bytes left in the arena.
    pub fn remaining(&self) -> u32 {
        self.arena.remaining()
    }

    pub(super) fn arena(&self) -> &Arena {
        &self.arena
    }

    pub(super) fn head(&self) -> u32 {
        self.head
    }

    pub(super) fn release_ref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Offset of the first node at level 0 whose internal key is >=
    /// `target`, or 0.
    pub(super) fn seek_offset(&self, target: &[u8]) -> u32 {
        let mut level = self.height.load(Ordering::Acquire) as usize;
        let mut finger = self.head;
        loop {
            let (p, s) = self.bounds_at(target, level, finger);
            if level == 0 {
                return s;
            }
            finger = p;
            level -= 1;
        }
    }

    /// Walk level `level` from `prev` until the successor's key is >= the
    /// target. Returns `(prev, succ)`, succ 0 at end of level.
    fn bounds_at(&self, ikey: &[u8], level: usize, mut prev: u32) -> (u32, u32) {
        loop {
            let succ = self.arena.node(prev).next(level);
            if succ == 0 {
                return (prev, 0);
            }
            let succ_node = self.arena.node(succ);
            if encoding::compare(ikey, succ_node.key(&self.arena)) != std::cmp::Ordering::Greater {
                return (prev, succ);
            }
            prev = succ;
        }
    }

    /// Single top-down descent computing bounds for every level up to
    /// `height`. Each level starts from the previous level's prev.
    fn bounds(
        &self,
        ikey: &[u8],
        height: usize,
        prev: &mut [u32; MAX_HEIGHT],
        succ: &mut [u32; MAX_HEIGHT],
    ) {
        let mut finger = self.head;
        for level in (0..=height).rev() {
            let (p, s) = self.bounds_at(ikey, level, finger);
            prev[level] = p;
            succ[level] = s;
            finger = p;
        }
    }

    /// Like `bounds`, but reusing verified hint entries. A level is reused
    /// only when the remembered prev still sorts below the key, the
    /// remembered succ still sorts at or above it, and the link between
    /// them is intact; otherwise the level re-searches from the best
    /// lower bound available.
    fn bounds_with_hint(
        &self,
        ikey: &[u8],
        height: usize,
        hint: &Hint,
        prev: &mut [u32; MAX_HEIGHT],
        succ: &mut [u32; MAX_HEIGHT],
    ) {
        let mut finger = self.head;
        for level in (0..=height).rev() {
            let (p, s) = if self.hint_usable(hint, level, ikey) {
                (hint.prev[level], hint.succ[level])
            } else {
                let start = if level < hint.len && self.sorts_below(hint.prev[level], ikey) {
                    hint.prev[level]
                } else {
                    finger
                };
                self.bounds_at(ikey, level, start)
            };
            prev[level] = p;
            succ[level] = s;
            finger = p;
        }
    }

    fn hint_usable(&self, hint: &Hint, level: usize, ikey: &[u8]) -> bool {
        if level >= hint.len {
            return false;
        }
        let p = hint.prev[level];
        let s = hint.succ[level];
        if !self.sorts_below(p, ikey) {
            return false;
        }
        if s != 0 {
            let s_key = self.arena.node(s).key(&self.arena);
            if encoding::compare(s_key, ikey) == std::cmp::Ordering::Less {
                return false;
            }
        }
        self.arena.node(p).next(level) == s
    }

    fn sorts_below(&self, off: u32, ikey: &[u8]) -> bool {
        if off == self.head {
            return true;
        }
        let key = self.arena.node(off).key(&self.arena);
        encoding::compare(key, ikey) == std::cmp::Ordering::Less
    }

    /// CAS-bump the list height. Retried only while the sampled height
    /// still exceeds the observed one.
    fn promote_height(&self, top: usize) {
        let mut current = self.height.load(Ordering::Relaxed);
        while (top as u32) > current {
            match self.height.compare_exchange_weak(
                current,
                top as u32,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Sample a tower height with the geometric distribution
/// `h = min(MAX_HEIGHT - 1, 1 + ⌊ln(u) / ln(1 - 1/e)⌋)`, Pugh's
/// time/space optimum at p = 1/e.
fn random_height() -> usize {
    let log_p = (1.0 - 1.0 / std::f64::consts::E).ln();
    let u = 1.0 - rand::random::<f64>();
    let h = 1 + (u.ln() / log_p) as usize;
    h.min(MAX_HEIGHT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const CAP: u32 = 1 << 20;

    fn pause() {
        // Versions are timestamped at microsecond resolution; keep test
        // inserts on distinct ticks.
        std::thread::sleep(Duration::from_millis(2));
    }

    #[test]
    fn test_insert_and_get_newest_version() {
        let list = SkipList::new(CAP).unwrap();
        list.insert(b"a", b"1").unwrap();
        pause();
        list.insert(b"b", b"2").unwrap();
        pause();
        list.insert(b"a", b"3").unwrap();

        assert_eq!(list.get(b"a"), Some(&b"3"[..]));
        assert_eq!(list.get(b"b"), Some(&b"2"[..]));
        assert_eq!(list.get(b"c"), None);
    }

    #[test]
    fn test_rejects_empty_and_oversized_keys() {
        let list = SkipList::new(CAP).unwrap();
        assert!(matches!(
            list.insert(b"", b"v"),
            Err(Error::InvalidInput(_))
        ));
        let long = vec![b'x'; encoding::MAX_KEY_SIZE + 1];
        assert!(matches!(
            list.insert(&long, b"v"),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_size_full_is_surfaced() {
        let list = SkipList::new(4096).unwrap();
        let value = vec![0u8; 512];
        let mut filled = false;
        for i in 0..32 {
            let key = format!("key_{i:03}");
            match list.insert(key.as_bytes(), &value) {
                Ok(()) => {}
                Err(Error::SizeFull) => {
                    filled = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(filled, "a 4KB arena should not hold 16KB of values");
    }

    #[test]
    fn test_iterator_is_sorted_and_complete() {
        let list = SkipList::new(CAP).unwrap();
        let keys = [&b"delta"[..], b"alpha", b"echo", b"bravo", b"charlie"];
        for key in keys {
            list.insert(key, key).unwrap();
        }

        let mut iter = list.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(iter.raw_key().to_vec());
            iter.advance();
        }
        assert_eq!(
            seen,
            vec![
                b"alpha".to_vec(),
                b"bravo".to_vec(),
                b"charlie".to_vec(),
                b"delta".to_vec(),
                b"echo".to_vec()
            ]
        );
    }

    #[test]
    fn test_snapshot_iterator_ignores_later_writes() {
        let list = SkipList::new(CAP).unwrap();
        list.insert(b"x", b"X").unwrap();
        pause();
        let mut iter = list.iter();
        pause();
        list.insert(b"x", b"Y").unwrap();
        list.insert(b"z", b"Z").unwrap();

        iter.seek(b"x");
        assert!(iter.valid());
        assert_eq!(iter.value(), b"X");
        iter.advance();
        assert!(!iter.valid(), "z was written after the snapshot");

        assert_eq!(list.get(b"x"), Some(&b"Y"[..]));
    }

    #[test]
    fn test_hinted_insert_sequential_run() {
        let list = SkipList::new(CAP).unwrap();
        let mut hint = Hint::new();
        for i in 0..200u32 {
            let key = format!("key_{i:05}");
            list.insert_with_hint(key.as_bytes(), &i.to_be_bytes(), Some(&mut hint))
                .unwrap();
        }
        // Interleave an out-of-order key; the hint must be detected stale.
        list.insert_with_hint(b"aaa", b"front", Some(&mut hint)).unwrap();

        assert_eq!(list.get(b"aaa"), Some(&b"front"[..]));
        for i in (0..200u32).step_by(37) {
            let key = format!("key_{i:05}");
            assert_eq!(list.get(key.as_bytes()), Some(&i.to_be_bytes()[..]));
        }

        let mut iter = list.iter();
        iter.seek_to_first();
        let mut prev: Option<Vec<u8>> = None;
        while iter.valid() {
            if let Some(p) = &prev {
                assert!(p.as_slice() <= iter.raw_key());
            }
            prev = Some(iter.raw_key().to_vec());
            iter.advance();
        }
    }

    #[test]
    fn test_insert_without_hint_is_an_error() {
        let list = SkipList::new(CAP).unwrap();
        assert_eq!(
            list.insert_with_hint(b"k", b"v", None).unwrap_err(),
            Error::NilHint
        );
    }

    #[test]
    fn test_close_with_live_iterator() {
        let list = SkipList::new(CAP).unwrap();
        list.insert(b"k", b"v").unwrap();
        let iter = list.iter();
        assert_eq!(list.close().unwrap_err(), Error::StillReferenced);
        drop(iter);
        assert!(list.close().is_ok());
    }

    #[test]
    fn test_concurrent_inserts() {
        let list = SkipList::new(CAP).unwrap();
        std::thread::scope(|s| {
            for t in 0..4 {
                let list = &list;
                s.spawn(move || {
                    for i in 0..250u32 {
                        let key = format!("w{t}_{i:04}");
                        list.insert(key.as_bytes(), &i.to_be_bytes()).unwrap();
                    }
                });
            }
        });

        for t in 0..4 {
            for i in (0..250u32).step_by(49) {
                let key = format!("w{t}_{i:04}");
                assert_eq!(list.get(key.as_bytes()), Some(&i.to_be_bytes()[..]));
            }
        }

        let mut iter = list.iter();
        iter.seek_to_first();
        let mut count = 0;
        let mut prev: Option<Vec<u8>> = None;
        while iter.valid() {
            if let Some(p) = &prev {
                assert!(p.as_slice() <= iter.raw_key());
            }
            prev = Some(iter.raw_key().to_vec());
            count += 1;
            iter.advance();
        }
        assert_eq!(count, 1000);
    }
}
