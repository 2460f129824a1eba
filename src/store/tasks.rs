//! Background maintenance for an open database.
//!
//! Two tokio loops, one per concern: the flush loop drains frozen
//! memtables to level 0, the compaction loop runs a merge round whenever a
//! level is over its table threshold. Each loop wakes on its configured
//! interval and winds down when the close signal arrives. A database only
//! ever needs these two, so there is no task registry.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;

use super::{compaction, DbInner};

/// The flush and compaction loops of one open database.
pub(crate) struct Maintenance {
    stop: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl Maintenance {
    /// Spawn both loops. Requires a tokio runtime.
    pub(crate) fn start(inner: &Arc<DbInner>) -> Self {
        let (stop, _) = watch::channel(false);
        let loops = vec![
            spawn_flush_loop(Arc::clone(inner), stop.subscribe()),
            spawn_compaction_loop(Arc::clone(inner), stop.subscribe()),
        ];
        Self { stop, loops }
    }

    /// Signal both loops to stop and wait until they have.
    pub(crate) async fn shutdown(self) -> Result<()> {
        let _ = self.stop.send(true);
        for handle in self.loops {
            handle.await?;
        }
        Ok(())
    }
}

/// Every `flush_interval`, write frozen memtables out until none remain.
/// A flush already running elsewhere ends the round early.
fn spawn_flush_loop(inner: Arc<DbInner>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.flush_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    while inner.needs_flush() {
                        match inner.flush_memtable() {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                tracing::error!(error = %e, "memtable flush failed");
                                break;
                            }
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}

/// Every `compaction_interval`, run one merge round if a level is over its
/// table threshold. Cascades (level 1 filling up after a level-0 round)
/// are picked up on the following ticks.
fn spawn_compaction_loop(inner: Arc<DbInner>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.compaction_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if compaction::needs_compaction(&inner) {
                        if let Err(e) = compaction::compact(&inner) {
                            tracing::error!(error = %e, "compaction failed");
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::store::Db;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> Config {
        Config::new(dir.path())
            .fsync(false)
            .compression(false)
            .mem_table_size(8 * 1024)
            .level_table_threshold(2)
            .flush_interval(Duration::from_millis(20))
            .compaction_interval(Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_flush_loop_drains_frozen_memtables() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(config(&dir)).unwrap();

        for i in 0..120u32 {
            db.put(format!("key_{i:04}").as_bytes(), &[b'v'; 64]).unwrap();
        }
        assert!(db.inner.memtables.read().unwrap().len() > 1, "no rotation");

        let mut rounds = 0;
        while db.inner.memtables.read().unwrap().len() > 1 && rounds < 300 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            rounds += 1;
        }
        assert_eq!(db.inner.memtables.read().unwrap().len(), 1);
        assert!(!db.inner.levels.read().unwrap()[0].is_empty());

        for i in (0..120u32).step_by(29) {
            let key = format!("key_{i:04}");
            assert_eq!(db.get(key.as_bytes()).unwrap(), Some(vec![b'v'; 64]), "{key}");
        }

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_compaction_loop_moves_level_zero_down() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(config(&dir).sstable_size(16 * 1024)).unwrap();

        for i in 0..200u32 {
            db.put(format!("key_{i:04}").as_bytes(), &[b'v'; 64]).unwrap();
        }

        let mut rounds = 0;
        loop {
            let settled = {
                let memtables = db.inner.memtables.read().unwrap();
                let levels = db.inner.levels.read().unwrap();
                memtables.len() == 1 && !levels[1].is_empty()
            };
            if settled || rounds >= 500 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            rounds += 1;
        }
        assert!(!db.inner.levels.read().unwrap()[1].is_empty(), "nothing compacted");

        for i in (0..200u32).step_by(31) {
            let key = format!("key_{i:04}");
            assert_eq!(db.get(key.as_bytes()).unwrap(), Some(vec![b'v'; 64]), "{key}");
        }

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_both_loops() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(config(&dir)).unwrap();
        db.put(b"k", b"v").unwrap();

        let start = std::time::Instant::now();
        db.close().await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2), "slow shutdown");
    }
}
