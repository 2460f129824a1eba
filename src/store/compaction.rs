//! Compaction policy and driver.
//!
//! A level is due for compaction when its table count exceeds the
//! configured threshold. All of its tables are merged with the whole next
//! level; the merge dedups by raw key with the newer input winning, so the
//! output is the level's authoritative contents. A single compaction runs
//! at a time, which trivially serialises compactions per target level, and
//! input files are unlinked only after the outputs are sealed and fsynced.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::sstable::merge::MergeIterator;
use crate::sstable::SsTable;

use super::DbInner;

/// First level over its table threshold, lowest first. The last level has
/// nowhere to merge into and is never a source.
pub(crate) fn find_compaction_level(inner: &DbInner) -> Option<usize> {
    let levels = inner.levels.read().unwrap();
    let threshold = inner.config.level_table_threshold;
    (0..levels.len().saturating_sub(1)).find(|&level| levels[level].len() > threshold)
}

pub(crate) fn needs_compaction(inner: &DbInner) -> bool {
    find_compaction_level(inner).is_some()
}

/// Run one compaction round if any level is due. Concurrent callers pass
/// through without waiting.
pub(crate) fn compact(inner: &DbInner) -> Result<()> {
    if inner
        .compacting
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }
    let result = compact_once(inner);
    inner.compacting.store(false, Ordering::SeqCst);
    result
}

fn compact_once(inner: &DbInner) -> Result<()> {
    let source = match find_compaction_level(inner) {
        Some(level) => level,
        None => return Ok(()),
    };
    let target = source + 1;

    // Snapshot the inputs newest-first: source tables shadow target tables.
    let inputs: Vec<Arc<SsTable>> = {
        let levels = inner.levels.read().unwrap();
        levels[source]
            .iter()
            .chain(levels[target].iter())
            .cloned()
            .collect()
    };
    if inputs.is_empty() {
        return Ok(());
    }

    tracing::info!(source, target, inputs = inputs.len(), "starting compaction");

    let outputs = MergeIterator::new(&inputs, target)?.create_ssts(&inner.config)?;
    let output_count = outputs.len();

    {
        let mut levels = inner.levels.write().unwrap();
        levels[source].retain(|t| !inputs.iter().any(|i| Arc::ptr_eq(i, t)));
        levels[target].retain(|t| !inputs.iter().any(|i| Arc::ptr_eq(i, t)));
        for table in outputs.into_iter().rev() {
            levels[target].insert(0, Arc::new(table));
        }
    }

    // Outputs are sealed and fsynced; the inputs can go. Readers that
    // still hold them keep their descriptors until the last clone drops.
    for table in &inputs {
        if let Err(e) = table.remove() {
            tracing::warn!(
                level = table.level(),
                stamp = table.stamp(),
                error = %e,
                "failed to unlink compacted table"
            );
        }
    }

    tracing::info!(source, target, outputs = output_count, "completed compaction");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::Db;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config::new(dir.path())
            .fsync(false)
            .compression(false)
            .mem_table_size(8 * 1024)
            .sstable_size(64 * 1024)
            .level_table_threshold(1)
            .flush_interval(Duration::from_secs(3600))
            .compaction_interval(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_compaction_moves_tables_down() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(config(&dir)).unwrap();

        for i in 0..240u32 {
            db.put(format!("key_{i:04}").as_bytes(), &[b'v'; 64]).unwrap();
        }
        while db.flush_memtable().unwrap() {}

        assert!(needs_compaction(&db.inner));
        db.compact().unwrap();

        {
            let levels = db.inner.levels.read().unwrap();
            assert!(levels[0].is_empty(), "source level should drain");
            assert!(!levels[1].is_empty(), "target level should fill");
        }

        for i in (0..240u32).step_by(23) {
            let key = format!("key_{i:04}");
            assert_eq!(db.get(key.as_bytes()).unwrap(), Some(vec![b'v'; 64]), "{key}");
        }

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_compaction_keeps_newest_version() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(config(&dir)).unwrap();

        db.put(b"versioned", b"old").unwrap();
        for i in 0..120u32 {
            db.put(format!("fill_a_{i:04}").as_bytes(), &[b'f'; 64]).unwrap();
        }
        std::thread::sleep(Duration::from_millis(2));
        db.put(b"versioned", b"new").unwrap();
        for i in 0..120u32 {
            db.put(format!("fill_b_{i:04}").as_bytes(), &[b'f'; 64]).unwrap();
        }

        while db.flush_memtable().unwrap() {}
        db.compact().unwrap();

        assert_eq!(db.get(b"versioned").unwrap(), Some(b"new".to_vec()));
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_compaction_is_a_noop_below_threshold() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(config(&dir)).unwrap();
        db.put(b"k", b"v").unwrap();

        assert!(!needs_compaction(&db.inner));
        db.compact().unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
        db.close().await.unwrap();
    }
}
