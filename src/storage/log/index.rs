//! Memory-mapped offset index.
//!
//! Each entry is 12 bytes: `[u32 big-endian relative offset][u64 big-endian
//! store position]`. The file is grown to the configured capacity before it
//! is mapped and truncated back to its logical size on close, so a reopened
//! index recovers its last entry from the file length.
//!
//! The index has no lock of its own; the owning segment serializes access.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use memmap2::MmapMut;
use tracing::warn;

use crate::error::{StorageError, StorageResult};

pub const OFFSET_WIDTH: u64 = 4;
pub const POSITION_WIDTH: u64 = 8;
pub const ENTRY_WIDTH: u64 = OFFSET_WIDTH + POSITION_WIDTH;

pub struct Index {
    path: PathBuf,
    file: Option<File>,
    mmap: Option<MmapMut>,
    /// Bytes actually written
    size: u64,
}

impl Index {
    pub fn open(path: impl AsRef<Path>, max_index_bytes: u64) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        // A torn trailing entry is dropped.
        let mut size = len - len % ENTRY_WIDTH;
        file.set_len(max_index_bytes.max(size))?;

        // SAFETY: the file is owned by this index for the lifetime of the
        // mapping, and the mapping is dropped before the file is resized or
        // closed.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        // A file left at full size by an unclean exit has a zeroed tail. Only
        // the first entry can legitimately be all zeros.
        while size > ENTRY_WIDTH {
            let start = (size - ENTRY_WIDTH) as usize;
            if mmap[start..start + ENTRY_WIDTH as usize].iter().any(|b| *b != 0) {
                break;
            }
            size -= ENTRY_WIDTH;
        }

        Ok(Self {
            path,
            file: Some(file),
            mmap: Some(mmap),
            size,
        })
    }

    /// Read entry `i`, or the last written entry when `i == -1`.
    /// Returns `(relative_offset, store_position)`.
    pub fn read(&self, i: i64) -> StorageResult<(u32, u64)> {
        if self.size == 0 {
            return Err(StorageError::EndOfIndex);
        }

        let entries = self.size / ENTRY_WIDTH;
        let entry = match i {
            -1 => entries - 1,
            i if i < 0 => return Err(StorageError::EndOfIndex),
            i => i as u64,
        };
        if entry >= entries {
            return Err(StorageError::EndOfIndex);
        }

        let mmap = self.mmap.as_ref().ok_or(StorageError::Closed)?;
        let start = (entry * ENTRY_WIDTH) as usize;
        let mut offset = [0u8; OFFSET_WIDTH as usize];
        let mut position = [0u8; POSITION_WIDTH as usize];
        offset.copy_from_slice(&mmap[start..start + OFFSET_WIDTH as usize]);
        position.copy_from_slice(
            &mmap[start + OFFSET_WIDTH as usize..start + ENTRY_WIDTH as usize],
        );

        Ok((u32::from_be_bytes(offset), u64::from_be_bytes(position)))
    }

    /// Shorthand for `read(-1)`
    pub fn last(&self) -> StorageResult<(u32, u64)> {
        self.read(-1)
    }

    pub fn write(&mut self, offset: u32, position: u64) -> StorageResult<()> {
        let mmap = self.mmap.as_mut().ok_or(StorageError::Closed)?;
        if (mmap.len() as u64) < self.size + ENTRY_WIDTH {
            return Err(StorageError::IndexFull);
        }

        let start = self.size as usize;
        mmap[start..start + OFFSET_WIDTH as usize].copy_from_slice(&offset.to_be_bytes());
        mmap[start + OFFSET_WIDTH as usize..start + ENTRY_WIDTH as usize]
            .copy_from_slice(&position.to_be_bytes());
        self.size += ENTRY_WIDTH;
        Ok(())
    }

    /// Forget every entry. The next write lands at the start of the file.
    pub fn clear(&mut self) {
        self.size = 0;
    }

    /// True when another entry would not fit.
    pub fn is_full(&self) -> bool {
        let capacity = self.mmap.as_ref().map_or(0, |m| m.len() as u64);
        self.size + ENTRY_WIDTH > capacity
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync the mapping, unmap, shrink the file to its logical size and sync
    /// it. Safe to call twice.
    /// Handles are only released once their step succeeds, so a failed
    /// close can be retried.
    pub fn close(&mut self) -> StorageResult<()> {
        if let Some(mmap) = self.mmap.as_ref() {
            mmap.flush()?;
        }
        self.mmap = None;
        if let Some(file) = self.file.as_ref() {
            file.set_len(self.size)?;
            file.sync_all()?;
        }
        self.file = None;
        Ok(())
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close index {:?}: {}", self.path, e);
        }
    }
}
