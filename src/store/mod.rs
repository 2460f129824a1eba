//! The database façade.
//!
//! A `Db` maintains an ordered list of memtables (the newest accepts
//! writes, the rest are frozen and await their flush) and per-level lists
//! of sorted tables, newest first. Reads walk memtables then levels and
//! stop at the first hit; a tombstone hit stops the walk with "not found".
//! Writes are logged before they touch the memtable, and an arena-full
//! insert rotates in a fresh memtable.

pub mod compaction;
pub mod tasks;

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use crate::config::Config;
use crate::encoding;
use crate::error::{Error, Result};
use crate::memtable::Memtable;
use crate::sstable::{self, SsTable, TableWriter};
use crate::wal;

use tasks::Maintenance;

/// An open cinderdb database.
pub struct Db {
    inner: Arc<DbInner>,
    maintenance: Maintenance,
}

pub(crate) struct DbInner {
    pub(crate) config: Config,
    /// Index 0 is the active memtable; the tail is the oldest frozen one.
    pub(crate) memtables: RwLock<Vec<Arc<Memtable>>>,
    /// `levels[l]` holds level `l`'s tables, newest first.
    pub(crate) levels: RwLock<Vec<Vec<Arc<SsTable>>>>,
    pub(crate) compacting: AtomicBool,
    pub(crate) flushing: AtomicBool,
}

impl Db {
    /// Open a database directory: replay its WALs into memtables, load and
    /// validate its tables, and start the background flush and compaction
    /// tasks. A table failing its magic check refuses the whole open.
    ///
    /// Must be called within a tokio runtime.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;

        let mut wal_files: Vec<(u64, PathBuf)> = Vec::new();
        let mut table_files: Vec<(usize, u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&config.dir)? {
            let path = entry?.path();
            if let Some(stamp) = wal::parse_wal_stamp(&path, &config.name) {
                wal_files.push((stamp, path));
            } else if let Some((level, stamp)) = sstable::parse_table_name(&path, &config.name) {
                table_files.push((level, stamp, path));
            }
        }

        // Oldest WAL first; the newest memtable ends up active at index 0.
        wal_files.sort();
        let mut memtables: Vec<Arc<Memtable>> = Vec::new();
        for (stamp, path) in &wal_files {
            let mem = Memtable::replay(&config, path, *stamp)?;
            memtables.insert(0, Arc::new(mem));
        }
        for frozen in memtables.iter().skip(1) {
            frozen.freeze();
        }
        if memtables.is_empty() {
            memtables.push(Arc::new(Memtable::create(&config, encoding::now_micros())?));
        }

        let mut levels: Vec<Vec<Arc<SsTable>>> = vec![Vec::new(); config.max_levels];
        for (level, stamp, path) in table_files {
            if level >= config.max_levels {
                return Err(Error::Corrupted(format!(
                    "{}: level {level} beyond configured maximum",
                    path.display()
                )));
            }
            let table = SsTable::open(&path, level, stamp, &config)?;
            levels[level].push(Arc::new(table));
        }
        for level in &mut levels {
            level.sort_by(|a, b| b.stamp().cmp(&a.stamp()));
        }

        tracing::info!(
            dir = %config.dir.display(),
            memtables = memtables.len(),
            tables = levels.iter().map(Vec::len).sum::<usize>(),
            "opened database"
        );

        let inner = Arc::new(DbInner {
            config,
            memtables: RwLock::new(memtables),
            levels: RwLock::new(levels),
            compacting: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
        });

        let maintenance = Maintenance::start(&inner);
        Ok(Self { inner, maintenance })
    }

    /// Most recent value for `key`, or None if absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    /// Insert a key/value pair.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.put(key, value)
    }

    /// Delete a key by writing a tombstone.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.inner.delete(key)
    }

    /// Flush the oldest frozen memtable to a level-0 table, if any.
    /// Normally driven by the background flush task.
    pub fn flush_memtable(&self) -> Result<bool> {
        self.inner.flush_memtable()
    }

    /// Run one compaction round if any level is over its table threshold.
    /// Normally driven by the background compaction task.
    pub fn compact(&self) -> Result<()> {
        compaction::compact(&self.inner)
    }

    /// Stop the background loops and close every file cleanly.
    pub async fn close(self) -> Result<()> {
        self.maintenance.shutdown().await?;

        let memtables = self.inner.memtables.read().unwrap().clone();
        for mem in memtables {
            mem.close()?;
        }
        let levels = self.inner.levels.read().unwrap().clone();
        for level in levels {
            for table in level {
                table.close()?;
            }
        }
        Ok(())
    }
}

impl DbInner {
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let memtables = self.memtables.read().unwrap().clone();
        for mem in &memtables {
            if let Some(value) = mem.get(key) {
                if encoding::is_tombstone(value) {
                    return Ok(None);
                }
                return Ok(Some(value.to_vec()));
            }
        }

        let levels = self.levels.read().unwrap().clone();
        for level in &levels {
            for table in level {
                if let Some(value) = table.find(key)? {
                    if encoding::is_tombstone(&value) {
                        return Ok(None);
                    }
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }

    pub(crate) fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write_active(|mem| mem.put(key, value))
    }

    pub(crate) fn delete(&self, key: &[u8]) -> Result<()> {
        self.write_active(|mem| mem.delete(key))
    }

    /// Run a write against the active memtable, rotating and retrying when
    /// its arena fills.
    fn write_active(&self, write: impl Fn(&Memtable) -> Result<()>) -> Result<()> {
        loop {
            let active = match self.memtables.read().unwrap().first() {
                Some(mem) => Arc::clone(mem),
                None => return Err(Error::IO("no active memtable".into())),
            };
            match write(&active) {
                Err(Error::SizeFull) => self.rotate(&active)?,
                other => return other,
            }
        }
    }

    fn rotate(&self, full: &Arc<Memtable>) -> Result<()> {
        let mut memtables = self.memtables.write().unwrap();
        if let Some(active) = memtables.first() {
            if !Arc::ptr_eq(active, full) {
                // Another writer already rotated.
                return Ok(());
            }
        }
        full.freeze();
        let stamp = encoding::now_micros().max(full.stamp() + 1);
        let fresh = Memtable::create(&self.config, stamp)?;
        memtables.insert(0, Arc::new(fresh));
        tracing::debug!(stamp, "rotated memtable");
        Ok(())
    }

    pub(crate) fn needs_flush(&self) -> bool {
        self.memtables.read().unwrap().len() > 1
    }

    pub(crate) fn flush_memtable(&self) -> Result<bool> {
        if self
            .flushing
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return Ok(false);
        }
        let result = self.flush_oldest();
        self.flushing
            .store(false, std::sync::atomic::Ordering::SeqCst);
        result
    }

    /// Write the oldest frozen memtable out as level-0 tables, publish
    /// them, and only then retire the memtable and its WAL.
    fn flush_oldest(&self) -> Result<bool> {
        let mem = {
            let memtables = self.memtables.read().unwrap();
            if memtables.len() <= 1 {
                return Ok(false);
            }
            match memtables.last() {
                Some(mem) => Arc::clone(mem),
                None => return Ok(false),
            }
        };

        let tables = {
            let mut writer = TableWriter::new(&self.config, 0);
            let mut iter = mem.iter();
            iter.seek_to_first();
            while iter.valid() {
                writer.add(iter.key(), iter.value())?;
                iter.advance();
            }
            writer.finish()?
        };

        let count = tables.len();
        {
            let mut levels = self.levels.write().unwrap();
            for table in tables.into_iter().rev() {
                levels[0].insert(0, Arc::new(table));
            }
        }
        {
            let mut memtables = self.memtables.write().unwrap();
            memtables.retain(|m| !Arc::ptr_eq(m, &mem));
        }
        mem.close()?;
        mem.remove_wal()?;

        tracing::info!(stamp = mem.stamp(), tables = count, "flushed memtable");
        Ok(true)
    }
}
