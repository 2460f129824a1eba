//! N-way merge over sorted tables, driving compaction.
//!
//! A min-heap orders the head record of every input by internal key; ties
//! on raw key fall back to the input id. Callers pass inputs newest-first,
//! so a lower id means a newer version and raw-key duplicates from older
//! inputs are dropped as superseded.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::config::Config;
use crate::encoding;
use crate::error::Result;

use super::block::VAL_PAGE_PREFIX;
use super::{SsTable, TableIter, TableWriter};

struct HeapItem {
    /// Full key record: value page prefix plus internal key.
    record: Vec<u8>,
    id: usize,
}

impl HeapItem {
    fn ikey(&self) -> &[u8] {
        &self.record[VAL_PAGE_PREFIX..]
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        match encoding::compare(self.ikey(), other.ikey()) {
            Ordering::Equal => other.id.cmp(&self.id),
            // Reversed so the BinaryHeap pops the minimum.
            other_ord => other_ord.reverse(),
        }
    }
}

/// Merges the key streams of several tables into internal-key order with
/// raw-key deduplication.
pub struct MergeIterator<'a> {
    tables: &'a [Arc<SsTable>],
    iters: Vec<TableIter<'a>>,
    heap: BinaryHeap<HeapItem>,
    last_raw: Option<Vec<u8>>,
    target_level: usize,
}

impl<'a> MergeIterator<'a> {
    /// Build over `tables`, which the caller orders newest-first. The
    /// output feeds tables of `target_level`.
    pub fn new(tables: &'a [Arc<SsTable>], target_level: usize) -> Result<Self> {
        let mut iters: Vec<TableIter<'a>> = tables.iter().map(|t| t.iter()).collect();
        let mut heap = BinaryHeap::new();
        for (id, iter) in iters.iter_mut().enumerate() {
            if let Some(record) = iter.next_record()? {
                heap.push(HeapItem { record, id });
            }
        }
        Ok(Self {
            tables,
            iters,
            heap,
            last_raw: None,
            target_level,
        })
    }

    /// Next surviving key record and the id of the table it came from.
    /// Older versions of an already-emitted raw key are skipped.
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, usize)>> {
        while let Some(item) = self.heap.pop() {
            if let Some(record) = self.iters[item.id].next_record()? {
                self.heap.push(HeapItem {
                    record,
                    id: item.id,
                });
            }

            let raw = encoding::raw(item.ikey());
            if self.last_raw.as_deref() == Some(raw) {
                continue;
            }
            self.last_raw = Some(raw.to_vec());
            return Ok(Some((item.record, item.id)));
        }
        Ok(None)
    }

    /// Drain the merge into fresh tables of the target level. Tombstones
    /// survive unless the output lands on the final level, where nothing
    /// below can be shadowed any more.
    pub fn create_ssts(mut self, config: &Config) -> Result<Vec<SsTable>> {
        let drop_tombstones = self.target_level + 1 >= config.max_levels;
        let mut writer = TableWriter::new(config, self.target_level);

        while let Some((record, id)) = self.next()? {
            let val_page = BigEndian::read_u16(&record[..VAL_PAGE_PREFIX]);
            let value = self.tables[id].read_value(val_page)?;
            if drop_tombstones && encoding::is_tombstone(&value) {
                continue;
            }
            writer.add(&record[VAL_PAGE_PREFIX..], &value)?;
        }
        writer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{internal_key_at, TOMBSTONE};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config::new(dir.path()).fsync(false).compression(false)
    }

    fn build(config: &Config, level: usize, entries: &[(&[u8], u64, &[u8])]) -> Arc<SsTable> {
        let mut writer = TableWriter::new(config, level);
        for (raw, ts, value) in entries {
            writer.add(&internal_key_at(raw, *ts), value).unwrap();
        }
        let mut tables = writer.finish().unwrap();
        assert_eq!(tables.len(), 1);
        Arc::new(tables.remove(0))
    }

    fn drain(tables: &[Arc<SsTable>]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        for table in tables {
            let mut iter = table.iter();
            while let Some(record) = iter.next_record().unwrap() {
                let page = BigEndian::read_u16(&record[..VAL_PAGE_PREFIX]);
                out.push((
                    encoding::raw(&record[VAL_PAGE_PREFIX..]).to_vec(),
                    table.read_value(page).unwrap(),
                ));
            }
        }
        out
    }

    #[test]
    fn test_two_way_merge_keeps_newer_versions() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        // Table A is newer than table B.
        let a = build(&cfg, 0, &[(b"a", 10, b"1"), (b"c", 10, b"3")]);
        let b = build(&cfg, 0, &[(b"a", 5, b"0"), (b"b", 5, b"2")]);

        let inputs = [a, b];
        let merge = MergeIterator::new(&inputs, 1).unwrap();
        let out = merge.create_ssts(&cfg).unwrap();
        let out: Vec<Arc<SsTable>> = out.into_iter().map(Arc::new).collect();

        assert_eq!(
            drain(&out),
            vec![
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"2".to_vec()),
                (b"c".to_vec(), b"3".to_vec()),
            ]
        );
    }

    #[test]
    fn test_merge_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let a = build(&cfg, 0, &[(b"a", 10, b"1"), (b"b", 10, b"2")]);
        let b = build(&cfg, 0, &[(b"b", 5, b"old"), (b"c", 5, b"3")]);

        let first: Vec<Arc<SsTable>> = MergeIterator::new(&[a, b], 1)
            .unwrap()
            .create_ssts(&cfg)
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();
        let first_entries = drain(&first);

        let again: Vec<Arc<SsTable>> = MergeIterator::new(&first, 2)
            .unwrap()
            .create_ssts(&cfg)
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();

        assert_eq!(drain(&again), first_entries);
    }

    #[test]
    fn test_tombstones_survive_intermediate_levels() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir); // max_levels = 6
        let a = build(&cfg, 0, &[(b"dead", 10, &TOMBSTONE)]);
        let b = build(&cfg, 0, &[(b"dead", 5, b"alive"), (b"keep", 5, b"v")]);

        let out: Vec<Arc<SsTable>> = MergeIterator::new(&[a, b], 1)
            .unwrap()
            .create_ssts(&cfg)
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();

        assert_eq!(
            drain(&out),
            vec![
                (b"dead".to_vec(), TOMBSTONE.to_vec()),
                (b"keep".to_vec(), b"v".to_vec()),
            ]
        );
    }

    #[test]
    fn test_tombstones_dropped_on_final_level() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir).max_levels(2);
        let a = build(&cfg, 0, &[(b"dead", 10, &TOMBSTONE)]);
        let b = build(&cfg, 0, &[(b"dead", 5, b"alive"), (b"keep", 5, b"v")]);

        let out: Vec<Arc<SsTable>> = MergeIterator::new(&[a, b], 1)
            .unwrap()
            .create_ssts(&cfg)
            .unwrap()
            .into_iter()
            .map(Arc::new)
            .collect();

        assert_eq!(drain(&out), vec![(b"keep".to_vec(), b"v".to_vec())]);
    }
}
