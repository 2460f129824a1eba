//! Write-ahead log over a paged file.
//!
//! Each entry is one paged write:
//! `op:u8 | key_len:u16 | value_len:u32 | key | value`, integers
//! big-endian. Replay walks pages from the start and hands decoded entries
//! to a callback; a callback error aborts the replay.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::page::PagedFile;

const ENTRY_HEADER: usize = 7;

/// A single log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub op: u8,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LogEntry {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(ENTRY_HEADER + self.key.len() + self.value.len());
        buf.write_u8(self.op)?;
        buf.write_u16::<BigEndian>(self.key.len() as u16)?;
        buf.write_u32::<BigEndian>(self.value.len() as u32)?;
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let op = cursor
            .read_u8()
            .map_err(|_| Error::Corrupted("wal entry missing op byte".into()))?;
        let key_len = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| Error::Corrupted("wal entry missing key length".into()))?
            as usize;
        let value_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| Error::Corrupted("wal entry missing value length".into()))?
            as usize;

        let rest = &data[ENTRY_HEADER..];
        if rest.len() != key_len + value_len {
            return Err(Error::Corrupted(format!(
                "wal entry body is {} bytes, header claims {}",
                rest.len(),
                key_len + value_len
            )));
        }
        Ok(Self {
            op,
            key: rest[..key_len].to_vec(),
            value: rest[key_len..].to_vec(),
        })
    }
}

/// Append-only operation log.
pub struct Wal {
    page: PagedFile,
}

impl Wal {
    /// Open or create a log at `path`.
    pub fn open(
        path: impl AsRef<Path>,
        page_size: u32,
        fsync: bool,
        sync_interval: Duration,
    ) -> Result<Self> {
        let page = PagedFile::open(path, page_size, fsync, sync_interval)?;
        Ok(Self { page })
    }

    /// Append an entry and return the page it starts at.
    pub fn append(&self, entry: &LogEntry) -> Result<u32> {
        self.page.write(&entry.encode()?)
    }

    /// Replay every entry in append order. An error from `fn` aborts the
    /// replay and is returned.
    pub fn replay(&self, mut f: impl FnMut(LogEntry) -> Result<()>) -> Result<()> {
        let mut entries = self.page.entries();
        while entries.valid() {
            let data = entries.next_entry()?;
            f(LogEntry::decode(&data)?)?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.page.sync()
    }

    pub fn close(&self) -> Result<()> {
        self.page.close()
    }

    pub fn path(&self) -> &Path {
        self.page.path()
    }

    /// Close the log and unlink its file. Called once the memtable it
    /// protected has been durably flushed.
    pub fn remove(&self) -> Result<()> {
        self.page.close()?;
        std::fs::remove_file(self.page.path())?;
        Ok(())
    }
}

/// Path for the log paired with the memtable created at `stamp`.
pub fn wal_path(dir: &Path, name: &str, stamp: u64) -> PathBuf {
    dir.join(format!("{name}-{stamp}.wal"))
}

/// Extract the stamp from a log file name produced by `wal_path`.
pub fn parse_wal_stamp(path: &Path, name: &str) -> Option<u64> {
    let file = path.file_name()?.to_str()?;
    let rest = file.strip_prefix(name)?.strip_prefix('-')?;
    rest.strip_suffix(".wal")?.parse().ok()
}
