//! Key blocks and the per-table sparse index.
//!
//! A key block is a sorted run of records, each a two-byte big-endian value
//! page number followed by the internal key. Blocks target roughly one page
//! of serialised size. The sparse index maps the first byte of each block's
//! first key to that block's page, bounded at 256 entries, so a linear scan
//! is fine.

use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::encoding;
use crate::error::Result;

/// Bytes of each key record taken by the value page number.
pub const VAL_PAGE_PREFIX: usize = 2;

/// A sorted run of key records.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Block {
    records: Vec<Vec<u8>>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Records must arrive in internal-key order.
    pub fn push(&mut self, val_page: u16, ikey: &[u8]) {
        let mut record = Vec::with_capacity(VAL_PAGE_PREFIX + ikey.len());
        let mut prefix = [0u8; VAL_PAGE_PREFIX];
        BigEndian::write_u16(&mut prefix, val_page);
        record.extend_from_slice(&prefix);
        record.extend_from_slice(ikey);
        self.records.push(record);
    }

    /// Binary search for `raw_key`. Records group versions of a raw key
    /// newest-first, so the match is the leftmost record of the group.
    /// Returns the value page and the matched internal key.
    pub fn find(&self, raw_key: &[u8]) -> Option<(u16, &[u8])> {
        let mut low = 0;
        let mut high = self.records.len();
        while low < high {
            let mid = (low + high) / 2;
            match Self::raw_of(&self.records[mid]).cmp(raw_key) {
                Ordering::Less => low = mid + 1,
                _ => high = mid,
            }
        }
        let record = self.records.get(low)?;
        if Self::raw_of(record) != raw_key {
            return None;
        }
        Some((
            BigEndian::read_u16(&record[..VAL_PAGE_PREFIX]),
            &record[VAL_PAGE_PREFIX..],
        ))
    }

    fn raw_of(record: &[u8]) -> &[u8] {
        encoding::raw(&record[VAL_PAGE_PREFIX..])
    }

    pub fn records(&self) -> &[Vec<u8>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Vec<u8>> {
        self.records
    }

    /// Raw key of the first record, for index maintenance.
    pub fn first_raw_key(&self) -> Option<&[u8]> {
        self.records.first().map(|r| Self::raw_of(r))
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Serialised size estimate: bincode frames each record and the vector
    /// itself with a u64 length.
    pub fn encoded_len(&self) -> usize {
        8 + self.records.iter().map(|r| 8 + r.len()).sum::<usize>()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

/// First-byte index over the key blocks of one table.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IndexBlock {
    entries: Vec<(u8, u32)>,
}

impl IndexBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the block at `page` is the first whose first key starts
    /// with `byte`. Later blocks with an already-seen byte are ignored.
    pub fn observe(&mut self, byte: u8, page: u32) {
        if !self.entries.iter().any(|(b, _)| *b == byte) {
            self.entries.push((byte, page));
        }
    }

    /// Candidate block page for a key starting with `byte`. At most 256
    /// entries, so linear search is acceptable.
    pub fn find(&self, byte: u8) -> Option<u32> {
        self.entries
            .iter()
            .find(|(b, _)| *b == byte)
            .map(|(_, page)| *page)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
