//! Append-only record file.
//!
//! Each record is persisted as `[u64 big-endian length][payload]`. Writes go
//! through a `BufWriter`; every read flushes it first, so a read never sees a
//! torn length prefix.

use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{StorageError, StorageResult};

/// Width of the length prefix written before every record
pub const LEN_WIDTH: u64 = 8;

struct StoreInner {
    writer: Option<BufWriter<File>>,
    size: u64,
}

pub struct Store {
    path: PathBuf,
    inner: Mutex<StoreInner>,
}

impl Store {
    /// Open (or create) the store file at `path`. The current file length
    /// becomes the append position.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path,
            inner: Mutex::new(StoreInner {
                writer: Some(BufWriter::new(file)),
                size,
            }),
        })
    }

    /// Append `data`, returning `(bytes_written, position)` where `position`
    /// is the byte offset the record starts at.
    pub fn append(&self, data: &[u8]) -> StorageResult<(u64, u64)> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let writer = inner.writer.as_mut().ok_or(StorageError::Closed)?;

        let pos = inner.size;
        writer.write_all(&(data.len() as u64).to_be_bytes())?;
        writer.write_all(data)?;

        let written = LEN_WIDTH + data.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Read the record starting at byte `pos`.
    pub fn read(&self, pos: u64) -> StorageResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let writer = inner.writer.as_mut().ok_or(StorageError::Closed)?;
        writer.flush()?;

        let file = writer.get_ref();
        let mut len_buf = [0u8; LEN_WIDTH as usize];
        file.read_exact_at(&mut len_buf, pos)?;

        let mut data = vec![0u8; u64::from_be_bytes(len_buf) as usize];
        file.read_exact_at(&mut data, pos + LEN_WIDTH)?;
        Ok(data)
    }

    /// Raw positional read used for sequential export. Returns 0 at end of
    /// file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<usize> {
        let mut inner = self.inner.lock();
        let writer = inner.writer.as_mut().ok_or(StorageError::Closed)?;
        writer.flush()?;
        Ok(writer.get_ref().read_at(buf, offset)?)
    }

    /// Current end-of-file position, including buffered bytes.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush buffered writes and release the file. Safe to call twice.
    pub fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        if let Some(writer) = inner.writer.take() {
            match writer.into_inner() {
                Ok(file) => file.sync_all()?,
                Err(e) => {
                    warn!("Failed to flush store {:?}: {}", self.path, e.error());
                    // Keep the buffered bytes so close can be retried.
                    let (error, writer) = e.into_parts();
                    inner.writer = Some(writer);
                    return Err(error.into());
                }
            }
        }
        Ok(())
    }
}
