//! cinderdb is an embedded, append-friendly key/value store organised as a
//! leveled LSM tree: a lock-free arena skiplist memtable in front of paged
//! write-ahead logs and sorted tables, with background flush and
//! compaction.

pub mod config;
pub mod encoding;
pub mod error;
pub mod filter;
pub mod memtable;
pub mod page;
pub mod sstable;
pub mod store;
pub mod wal;

pub use config::Config;
pub use error::{Error, Result};
pub use store::Db;
