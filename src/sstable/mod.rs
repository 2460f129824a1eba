//! Sorted tables.
//!
//! A table is a pair of paged files. The key file holds sorted key blocks
//! followed by the serialised bloom filter, the sparse index, and a magic
//! trailer on its own page; the value file is a flat sequence of pages, one
//! value per page chain. Key records carry a two-byte value page prefix, so
//! a lookup that lands in a block can jump straight to its value.

pub mod block;
pub mod merge;

use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::config::Config;
use crate::encoding;
use crate::error::{Error, Result};
use crate::filter::BloomFilter;
use crate::page::PagedFile;

use block::{Block, IndexBlock};

/// Constant written alone on the final page of every key file. A table
/// whose last page does not start with it is refused.
pub const MAGIC: u32 = 0xAB75DE95;

/// Trailer payload: magic, bloom start page, index start page.
const TRAILER_SIZE: usize = 12;

/// Rough bytes per entry used to size bloom filters from a table budget.
const ENTRY_SIZE_ESTIMATE: u64 = 16;

/// Paths of the key and value files for a table.
pub fn table_paths(dir: &Path, name: &str, level: usize, stamp: u64) -> (PathBuf, PathBuf) {
    let base = format!("{name}-{level:02}-{stamp}");
    (
        dir.join(format!("{base}.sst.key")),
        dir.join(format!("{base}.sst.val")),
    )
}

/// Parse `(level, stamp)` out of a key file path produced by `table_paths`.
pub fn parse_table_name(path: &Path, name: &str) -> Option<(usize, u64)> {
    let file = path.file_name()?.to_str()?;
    let rest = file.strip_prefix(name)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(".sst.key")?;
    let (level, stamp) = rest.split_once('-')?;
    Some((level.parse().ok()?, stamp.parse().ok()?))
}

pub(crate) fn compress(data: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Encoder::new()
        .compress_vec(data)
        .map_err(|e| Error::Corrupted(format!("compress: {e}")))
}

pub(crate) fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|e| Error::Corrupted(format!("decompress: {e}")))
}

/// An immutable sorted table.
pub struct SsTable {
    keys: PagedFile,
    vals: PagedFile,
    filter: BloomFilter,
    index: IndexBlock,
    level: usize,
    stamp: u64,
    /// Pages of the key file holding key blocks; the bloom, index and
    /// trailer live at and after this page.
    data_pages: u32,
    compression: bool,
}

impl SsTable {
    /// Open a table from its key file path, validating the magic trailer.
    /// The level and stamp come from the file name.
    pub fn open(key_path: &Path, level: usize, stamp: u64, config: &Config) -> Result<Self> {
        let val_path = Self::val_path_for(key_path)?;
        let keys = PagedFile::open(key_path, config.page_size, config.fsync, config.sync_interval)?;
        let vals = PagedFile::open(&val_path, config.page_size, config.fsync, config.sync_interval)?;

        let last = keys.last_page();
        if last == 0 {
            return Err(Error::Corrupted(format!(
                "{}: key file has no pages",
                key_path.display()
            )));
        }
        let (trailer, _) = keys.read(last - 1)?;
        if trailer.len() < TRAILER_SIZE {
            return Err(Error::Corrupted(format!(
                "{}: trailer page too short",
                key_path.display()
            )));
        }
        let magic = BigEndian::read_u32(&trailer[..4]);
        if magic != MAGIC {
            return Err(Error::Corrupted(format!(
                "{}: bad magic {magic:#010x}",
                key_path.display()
            )));
        }
        let bloom_start = BigEndian::read_u32(&trailer[4..8]);
        let index_start = BigEndian::read_u32(&trailer[8..12]);
        if bloom_start >= index_start || index_start >= last {
            return Err(Error::Corrupted(format!(
                "{}: trailer points outside the file",
                key_path.display()
            )));
        }

        let (bloom_bytes, _) = keys.read(bloom_start)?;
        let filter = BloomFilter::from_bytes(&bloom_bytes)?;
        let (index_bytes, _) = keys.read(index_start)?;
        let index = IndexBlock::decode(&index_bytes)?;

        Ok(Self {
            keys,
            vals,
            filter,
            index,
            level,
            stamp,
            data_pages: bloom_start,
            compression: config.compression,
        })
    }

    fn val_path_for(key_path: &Path) -> Result<PathBuf> {
        let s = key_path.to_str().and_then(|s| s.strip_suffix(".sst.key"));
        match s {
            Some(base) => Ok(PathBuf::from(format!("{base}.sst.val"))),
            None => Err(Error::InvalidInput(format!(
                "{} is not a table key file",
                key_path.display()
            ))),
        }
    }

    /// Point lookup: bloom rejection, first-byte index, block binary
    /// search, value page read. Blocks past the candidate are scanned only
    /// while they can still hold the key.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if !self.filter.contains(key) {
            return Ok(None);
        }
        let first = match key.first() {
            Some(b) => *b,
            None => return Ok(None),
        };
        let mut page = match self.index.find(first) {
            Some(page) => page,
            None => return Ok(None),
        };

        while page < self.data_pages {
            let (data, end) = self.keys.read(page)?;
            let block = self.decode_block(&data)?;
            if let Some(block_first) = block.first_raw_key() {
                if block_first > key {
                    break;
                }
            }
            if let Some((val_page, _)) = block.find(key) {
                let (value, _) = self.vals.read(val_page as u32)?;
                return Ok(Some(value));
            }
            // The key would sort inside this block; later blocks only hold
            // larger keys.
            if block.records().last().map(Self::record_raw) > Some(key) {
                break;
            }
            page = end + 1;
        }
        Ok(None)
    }

    fn record_raw(record: &Vec<u8>) -> &[u8] {
        encoding::raw(&record[block::VAL_PAGE_PREFIX..])
    }

    fn decode_block(&self, data: &[u8]) -> Result<Block> {
        if self.compression {
            Block::decode(&decompress(data)?)
        } else {
            Block::decode(data)
        }
    }

    /// Read the value chain starting at `page` of the value file.
    pub fn read_value(&self, page: u16) -> Result<Vec<u8>> {
        Ok(self.vals.read(page as u32)?.0)
    }

    /// Iterate key records in page order.
    pub fn iter(&self) -> TableIter<'_> {
        TableIter {
            table: self,
            next_page: 0,
            records: Vec::new(),
            pos: 0,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Combined size of both files.
    pub fn size(&self) -> u64 {
        self.keys.size() + self.vals.size()
    }

    /// Close both files without touching their contents.
    pub fn close(&self) -> Result<()> {
        self.keys.close()?;
        self.vals.close()
    }

    /// Close both files and unlink them. Readers holding the table open
    /// keep their descriptors until they drop it.
    pub fn remove(&self) -> Result<()> {
        self.keys.close()?;
        self.vals.close()?;
        std::fs::remove_file(self.keys.path())?;
        std::fs::remove_file(self.vals.path())?;
        Ok(())
    }

    /// Flush both files; used before table metadata becomes visible.
    pub fn sync(&self) -> Result<()> {
        self.keys.sync()?;
        self.vals.sync()
    }
}

/// Sequential scan over a table's key records.
pub struct TableIter<'a> {
    table: &'a SsTable,
    next_page: u32,
    records: Vec<Vec<u8>>,
    pos: usize,
}

impl TableIter<'_> {
    /// Next key record (value page prefix plus internal key), or None at
    /// the end of the key blocks.
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if self.pos < self.records.len() {
                let record = std::mem::take(&mut self.records[self.pos]);
                self.pos += 1;
                return Ok(Some(record));
            }
            if self.next_page >= self.table.data_pages {
                return Ok(None);
            }
            let (data, end) = self.table.keys.read(self.next_page)?;
            self.records = self.table.decode_block(&data)?.into_records();
            self.pos = 0;
            self.next_page = end + 1;
        }
    }
}

/// Streams internal-key ordered entries into one or more tables of a
/// level, rolling to a fresh table when the level's size budget fills.
pub struct TableWriter<'a> {
    config: &'a Config,
    level: usize,
    budget: u64,
    current: Option<Building>,
    done: Vec<SsTable>,
    last_stamp: u64,
}

struct Building {
    keys: PagedFile,
    vals: PagedFile,
    filter: BloomFilter,
    index: IndexBlock,
    block: Block,
    stamp: u64,
    key_path: PathBuf,
    val_path: PathBuf,
}

impl<'a> TableWriter<'a> {
    pub fn new(config: &'a Config, level: usize) -> Self {
        Self {
            config,
            level,
            budget: config.level_budget(level),
            current: None,
            done: Vec::new(),
            last_stamp: 0,
        }
    }

    fn open_building(&mut self) -> Result<Building> {
        let stamp = encoding::now_micros().max(self.last_stamp + 1);
        self.last_stamp = stamp;
        let (key_path, val_path) =
            table_paths(&self.config.dir, &self.config.name, self.level, stamp);
        let expected = (self.budget / ENTRY_SIZE_ESTIMATE).clamp(64, 1 << 20) as u32;
        Ok(Building {
            keys: PagedFile::open(
                &key_path,
                self.config.page_size,
                self.config.fsync,
                self.config.sync_interval,
            )?,
            vals: PagedFile::open(
                &val_path,
                self.config.page_size,
                self.config.fsync,
                self.config.sync_interval,
            )?,
            filter: BloomFilter::new(expected, self.config.false_positive_prob)?,
            index: IndexBlock::new(),
            block: Block::new(),
            stamp,
            key_path,
            val_path,
        })
    }

    fn building(&mut self) -> Result<&mut Building> {
        if self.current.is_none() {
            let b = self.open_building()?;
            self.current = Some(b);
        }
        match self.current.as_mut() {
            Some(t) => Ok(t),
            None => Err(Error::SizeFull),
        }
    }

    /// Add an entry. Entries must arrive in internal-key order.
    pub fn add(&mut self, ikey: &[u8], value: &[u8]) -> Result<()> {
        let page_payload = (self.config.page_size - 4) as usize;
        let compression = self.config.compression;
        let budget = self.budget;

        // The two-byte value page prefix caps a table's value file.
        let prefix_exhausted = self
            .current
            .as_ref()
            .is_some_and(|t| t.vals.last_page() >= u16::MAX as u32);
        if prefix_exhausted {
            self.finalize_current()?;
        }

        let t = self.building()?;
        let val_page = t.vals.write(value)? as u16;
        t.filter.add(encoding::raw(ikey));
        t.block.push(val_page, ikey);
        if t.block.encoded_len() >= page_payload {
            Self::close_block(t, compression)?;
        }
        let over_budget = t.keys.size() + t.vals.size() >= budget;
        if over_budget {
            self.finalize_current()?;
        }
        Ok(())
    }

    fn close_block(t: &mut Building, compression: bool) -> Result<()> {
        if t.block.is_empty() {
            return Ok(());
        }
        let mut data = t.block.encode()?;
        if compression {
            data = compress(&data)?;
        }
        let page = t.keys.write(&data)?;
        if let Some(&byte) = t.block.first_raw_key().and_then(|k| k.first()) {
            t.index.observe(byte, page);
        }
        t.block = Block::new();
        Ok(())
    }

    /// Seal the in-progress table: final block, bloom, index, magic
    /// trailer, fsync. An empty table is discarded instead.
    fn finalize_current(&mut self) -> Result<()> {
        let mut t = match self.current.take() {
            Some(t) => t,
            None => return Ok(()),
        };
        Self::close_block(&mut t, self.config.compression)?;

        if t.keys.last_page() == 0 {
            t.keys.close()?;
            t.vals.close()?;
            std::fs::remove_file(&t.key_path)?;
            std::fs::remove_file(&t.val_path)?;
            return Ok(());
        }

        let data_pages = t.keys.last_page();
        let bloom_start = t.keys.write(&t.filter.to_bytes()?)?;
        let index_start = t.keys.write(&t.index.encode()?)?;

        let mut trailer = [0u8; TRAILER_SIZE];
        BigEndian::write_u32(&mut trailer[..4], MAGIC);
        BigEndian::write_u32(&mut trailer[4..8], bloom_start);
        BigEndian::write_u32(&mut trailer[8..12], index_start);
        t.keys.write(&trailer)?;

        t.keys.sync()?;
        t.vals.sync()?;

        tracing::debug!(
            level = self.level,
            stamp = t.stamp,
            key_pages = t.keys.last_page(),
            "sealed table"
        );

        self.done.push(SsTable {
            keys: t.keys,
            vals: t.vals,
            filter: t.filter,
            index: t.index,
            level: self.level,
            stamp: t.stamp,
            data_pages,
            compression: self.config.compression,
        });
        Ok(())
    }

    /// Seal whatever is in progress and hand back the finished tables.
    pub fn finish(mut self) -> Result<Vec<SsTable>> {
        self.finalize_current()?;
        Ok(self.done)
    }
}
