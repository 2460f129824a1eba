use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Smallest allowed page size in bytes.
pub const MIN_PAGE_SIZE: u32 = 512;
/// Largest allowed page size in bytes.
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Configuration for a cinderdb database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the database files.
    pub dir: PathBuf,

    /// Database name, used as the file name prefix (default: "cinderdb").
    pub name: String,

    /// Run a periodic fsync task per paged file (default: true).
    pub fsync: bool,

    /// Period of the fsync task (default: 100ms).
    pub sync_interval: Duration,

    /// Bytes per page, 512..=65536 (default: 4096).
    pub page_size: u32,

    /// Compress serialised key blocks (default: true).
    pub compression: bool,

    /// Arena capacity per memtable in bytes (default: 64KiB).
    pub mem_table_size: u32,

    /// Level-0 table size budget in bytes (default: 128KiB).
    pub sstable_size: u64,

    /// Per-level growth factor for table budgets (default: 5).
    pub size_multiple: u64,

    /// Number of levels (default: 6).
    pub max_levels: usize,

    /// Bloom filter target false-positive rate (default: 0.01).
    pub false_positive_prob: f64,

    /// How often the flush task checks for frozen memtables (default: 1s).
    pub flush_interval: Duration,

    /// How often the compaction task checks level sizes (default: 10s).
    pub compaction_interval: Duration,

    /// Table count above which a level is compacted (default: 4).
    pub level_table_threshold: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderdb"),
            name: "cinderdb".to_string(),
            fsync: true,
            sync_interval: Duration::from_millis(100),
            page_size: 4096,
            compression: true,
            mem_table_size: 64 * 1024,
            sstable_size: 128 * 1024,
            size_multiple: 5,
            max_levels: 6,
            false_positive_prob: 0.01,
            flush_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(10),
            level_table_threshold: 4,
        }
    }
}

impl Config {
    /// Create a new config rooted at the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the database name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Enable or disable the periodic fsync task.
    pub fn fsync(mut self, enabled: bool) -> Self {
        self.fsync = enabled;
        self
    }

    /// Set the fsync period.
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Set the page size.
    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    /// Enable or disable key block compression.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Set the per-memtable arena capacity.
    pub fn mem_table_size(mut self, size: u32) -> Self {
        self.mem_table_size = size;
        self
    }

    /// Set the level-0 table budget.
    pub fn sstable_size(mut self, size: u64) -> Self {
        self.sstable_size = size;
        self
    }

    /// Set the per-level growth factor.
    pub fn size_multiple(mut self, multiple: u64) -> Self {
        self.size_multiple = multiple;
        self
    }

    /// Set the level count.
    pub fn max_levels(mut self, levels: usize) -> Self {
        self.max_levels = levels;
        self
    }

    /// Set the bloom filter false-positive target.
    pub fn false_positive_prob(mut self, p: f64) -> Self {
        self.false_positive_prob = p;
        self
    }

    /// Set the flush check interval.
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the compaction check interval.
    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    /// Set the per-level table count threshold.
    pub fn level_table_threshold(mut self, threshold: usize) -> Self {
        self.level_table_threshold = threshold;
        self
    }

    /// Budget in bytes for a table of the given level.
    pub fn level_budget(&self, level: usize) -> u64 {
        self.sstable_size
            .saturating_mul(self.size_multiple.saturating_pow(level as u32))
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || self.page_size > MAX_PAGE_SIZE {
            return Err(Error::InvalidInput(format!(
                "page size {} outside {}..={}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.max_levels == 0 {
            return Err(Error::InvalidInput("max_levels must be at least 1".into()));
        }
        if self.size_multiple == 0 {
            return Err(Error::InvalidInput("size_multiple must be at least 1".into()));
        }
        if !(self.false_positive_prob > 0.0 && self.false_positive_prob < 1.0) {
            return Err(Error::InvalidInput(format!(
                "false positive probability {} outside (0, 1)",
                self.false_positive_prob
            )));
        }
        Ok(())
    }
}
