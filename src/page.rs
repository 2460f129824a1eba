//! Page-sized, position-addressed file I/O.
//!
//! A paged file is a flat sequence of fixed-size pages. Each page carries a
//! 4-byte big-endian header `(payload_len << 1) | overflow_bit`; a set
//! overflow bit means the payload continues on the next page. Writers
//! reserve consecutive pages with a single atomic add and then fill them
//! with positional writes, so concurrent writes never contend on a shared
//! file cursor.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Bytes of each page taken by the header.
pub const HEADER_SIZE: u32 = 4;

/// Tracks in-flight reads and writes so close can drain them.
struct OpGate {
    count: Mutex<usize>,
    idle: Condvar,
}

impl OpGate {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    fn enter(&self) -> OpGuard<'_> {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count += 1;
        OpGuard { gate: self }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            count = self.idle.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct OpGuard<'a> {
    gate: &'a OpGate,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.gate.count.lock().unwrap_or_else(|e| e.into_inner());
        *count -= 1;
        if *count == 0 {
            self.gate.idle.notify_all();
        }
    }
}

/// A single file addressed in fixed-size pages.
pub struct PagedFile {
    file: Arc<File>,
    path: PathBuf,
    page_size: u32,
    pages: AtomicU32,
    closed: AtomicBool,
    ops: OpGate,
    sync_stop: Option<watch::Sender<bool>>,
}

impl PagedFile {
    /// Open or create a paged file. With `fsync` set, a background ticker
    /// syncs the file every `sync_interval` and once more on close; this
    /// requires a tokio runtime.
    pub fn open(
        path: impl AsRef<Path>,
        page_size: u32,
        fsync: bool,
        sync_interval: Duration,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        let pages = len.div_ceil(page_size as u64) as u32;

        let file = Arc::new(file);
        let sync_stop = if fsync {
            Some(Self::spawn_sync_loop(Arc::clone(&file), &path, sync_interval))
        } else {
            None
        };

        Ok(Self {
            file,
            path,
            page_size,
            pages: AtomicU32::new(pages),
            closed: AtomicBool::new(false),
            ops: OpGate::new(),
            sync_stop,
        })
    }

    fn spawn_sync_loop(
        file: Arc<File>,
        path: &Path,
        interval: Duration,
    ) -> watch::Sender<bool> {
        let (tx, mut rx) = watch::channel(false);
        let path = path.to_path_buf();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = file.sync_data() {
                            tracing::warn!(path = %path.display(), error = %e, "periodic fsync failed");
                        }
                    }
                    _ = rx.changed() => {
                        if let Err(e) = file.sync_data() {
                            tracing::warn!(path = %path.display(), error = %e, "final fsync failed");
                        }
                        break;
                    }
                }
            }
        });
        tx
    }

    fn payload_size(&self) -> u32 {
        self.page_size - HEADER_SIZE
    }

    /// Write `data`, reserving as many consecutive pages as it needs, and
    /// return the first page number. Safe to call from many threads; each
    /// call owns its reserved range exclusively.
    pub fn write(&self, data: &[u8]) -> Result<u32> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::IO(format!("{} is closed", self.path.display())));
        }
        let _op = self.ops.enter();

        let payload = self.payload_size() as usize;
        let pages = data.len().div_ceil(payload).max(1) as u32;
        let start = self.pages.fetch_add(pages, Ordering::AcqRel);

        let mut buf = vec![0u8; self.page_size as usize];
        for i in 0..pages {
            let from = i as usize * payload;
            let to = (from + payload).min(data.len());
            let chunk = &data[from..to];

            let mut header = (chunk.len() as u32) << 1;
            if i + 1 < pages {
                header |= 1;
            }
            BigEndian::write_u32(&mut buf[..4], header);
            buf[4..4 + chunk.len()].copy_from_slice(chunk);
            for b in &mut buf[4 + chunk.len()..] {
                *b = 0;
            }

            let off = (start + i) as u64 * self.page_size as u64;
            self.file.write_all_at(&buf, off)?;
        }
        Ok(start)
    }

    /// Read the payload chain starting at `start`, following overflow bits.
    /// Returns the concatenated bytes and the last page number read.
    pub fn read(&self, start: u32) -> Result<(Vec<u8>, u32)> {
        let _op = self.ops.enter();

        let mut data = Vec::new();
        let mut page = start;
        loop {
            let off = page as u64 * self.page_size as u64;
            let mut header = [0u8; 4];
            self.file.read_exact_at(&mut header, off)?;
            let h = BigEndian::read_u32(&header);
            let len = h >> 1;
            if len > self.payload_size() {
                return Err(Error::Corrupted(format!(
                    "page {page} header claims {len} payload bytes"
                )));
            }
            let prev = data.len();
            data.resize(prev + len as usize, 0);
            self.file.read_exact_at(&mut data[prev..], off + 4)?;
            if h & 1 == 0 {
                return Ok((data, page));
            }
            page += 1;
        }
    }

    /// Pages allocated so far.
    pub fn last_page(&self) -> u32 {
        self.pages.load(Ordering::Acquire)
    }

    /// Estimated file size: page counter times page size.
    pub fn size(&self) -> u64 {
        self.last_page() as u64 * self.page_size as u64
    }

    /// Flush file contents to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Refuse new operations, drain in-flight ones, stop the sync ticker
    /// and flush once more. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.ops.wait_idle();
        if let Some(stop) = &self.sync_stop {
            let _ = stop.send(true);
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Iterate entries from the first page.
    pub fn entries(&self) -> PageIter<'_> {
        PageIter {
            file: self,
            next: 0,
        }
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        if let Some(stop) = &self.sync_stop {
            let _ = stop.send(true);
        }
    }
}

/// Walks a paged file entry by entry, where an entry is one `write` call's
/// payload chain.
pub struct PageIter<'a> {
    file: &'a PagedFile,
    next: u32,
}

impl PageIter<'_> {
    /// Whether another entry starts before the allocation frontier.
    pub fn valid(&self) -> bool {
        self.next < self.file.last_page()
    }

    /// Page number the next entry starts at.
    pub fn next_page(&self) -> u32 {
        self.next
    }

    /// Read the next entry and move past it.
    pub fn next_entry(&mut self) -> Result<Vec<u8>> {
        let (data, end) = self.file.read(self.next)?;
        self.next = end + 1;
        Ok(data)
    }
}
