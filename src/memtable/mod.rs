//! In-memory write buffer: an arena skiplist guarded by a write-ahead log.

pub mod arena;
pub mod iterator;
pub mod skiplist;

pub use iterator::{Iter, MergeIter};
pub use skiplist::{Hint, SkipList};

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::Config;
use crate::encoding::{self, OP_DELETE, OP_PUT, TOMBSTONE};
use crate::error::{Error, Result};
use crate::wal::{self, LogEntry, Wal};

/// A memtable accepting versioned writes until its arena fills. Writes go
/// to the WAL first; the log is the durable record and is replayed on
/// restart, so a crash between the two leaves nothing behind that replay
/// cannot reproduce.
pub struct Memtable {
    list: SkipList,
    wal: Wal,
    stamp: u64,
    frozen: AtomicBool,
}

impl Memtable {
    /// Create an empty memtable with a fresh WAL stamped `stamp`.
    pub fn create(config: &Config, stamp: u64) -> Result<Self> {
        let wal = Wal::open(
            wal::wal_path(&config.dir, &config.name, stamp),
            config.page_size,
            config.fsync,
            config.sync_interval,
        )?;
        Ok(Self {
            list: SkipList::new(config.mem_table_size)?,
            wal,
            stamp,
            frozen: AtomicBool::new(false),
        })
    }

    /// Rebuild a memtable from an existing WAL. Entries are re-inserted in
    /// append order, so relative versioning is preserved. Replayed inserts
    /// re-sample tower heights, so the arena gets headroom over the
    /// configured capacity.
    pub fn replay(config: &Config, path: &Path, stamp: u64) -> Result<Self> {
        let wal = Wal::open(path, config.page_size, config.fsync, config.sync_interval)?;
        let capacity = config
            .mem_table_size
            .saturating_add(config.mem_table_size / 4);
        let list = SkipList::new(capacity)?;
        wal.replay(|entry| list.insert(&entry.key, &entry.value))?;
        Ok(Self {
            list,
            wal,
            stamp,
            frozen: AtomicBool::new(false),
        })
    }

    /// Insert a key/value pair, logging it first.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(OP_PUT, key, value)
    }

    /// Record a deletion as a tombstone value.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.write(OP_DELETE, key, &TOMBSTONE)
    }

    fn write(&self, key_op: u8, key: &[u8], value: &[u8]) -> Result<()> {
        if self.frozen.load(Ordering::Acquire) {
            // A frozen table takes no more writes; the caller rotates.
            return Err(Error::SizeFull);
        }
        if key.is_empty() || key.len() > encoding::MAX_KEY_SIZE {
            return Err(Error::InvalidInput(format!(
                "key length {} outside 1..={}",
                key.len(),
                encoding::MAX_KEY_SIZE
            )));
        }
        if value.len() > encoding::MAX_VALUE_SIZE {
            return Err(Error::InvalidInput(format!(
                "value length {} exceeds {}",
                value.len(),
                encoding::MAX_VALUE_SIZE
            )));
        }
        self.wal.append(&LogEntry {
            op: key_op,
            key: key.to_vec(),
            value: value.to_vec(),
        })?;
        self.list.insert(key, value)
    }

    /// Most recent value for `key`. A tombstone is returned as stored.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.list.get(key)
    }

    /// Snapshot iterator over the underlying skiplist.
    pub fn iter(&self) -> Iter<'_> {
        self.list.iter()
    }

    /// Mark the table read-only ahead of its flush.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Creation stamp, also the WAL file stamp.
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Arena bytes left.
    pub fn remaining(&self) -> u32 {
        self.list.remaining()
    }

    /// Verify no iterators remain and close the WAL.
    pub fn close(&self) -> Result<()> {
        self.list.close()?;
        self.wal.close()
    }

    /// Drop the WAL file once the table's contents are durable elsewhere.
    pub fn remove_wal(&self) -> Result<()> {
        self.wal.remove()
    }
}
