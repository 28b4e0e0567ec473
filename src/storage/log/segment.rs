use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
    error::{StorageError, StorageResult},
    message::Record,
};

use super::{index::Index, manager::SegmentConfig, store::Store};

/// Store file extension
pub const STORE_FILE_EXT: &str = "store";

/// Index file extension
pub const INDEX_FILE_EXT: &str = "index";

pub fn segment_file_path(dir: &Path, base_offset: u64, ext: &str) -> PathBuf {
    dir.join(format!("{}.{}", base_offset, ext))
}

/// One store + one index covering `[base_offset, next_offset)`.
pub struct Segment {
    store: Arc<Store>,
    index: Index,
    base_offset: u64,
    next_offset: u64,
    config: SegmentConfig,
}

impl Segment {
    /// Open the segment files for `base_offset` in `dir`, creating them if
    /// needed. `next_offset` is recovered from the last index entry.
    pub fn open(dir: &Path, base_offset: u64, config: SegmentConfig) -> StorageResult<Self> {
        let store = Store::open(segment_file_path(dir, base_offset, STORE_FILE_EXT))?;
        let mut index = Index::open(
            segment_file_path(dir, base_offset, INDEX_FILE_EXT),
            config.max_index_bytes,
        )?;
        if store.size() == 0 && index.size() > 0 {
            warn!(
                "Discarding index entries for empty store: base={}",
                base_offset
            );
            index.clear();
        }

        let next_offset = match index.last() {
            Ok((relative, _)) => base_offset + relative as u64 + 1,
            Err(StorageError::EndOfIndex) => base_offset,
            Err(e) => return Err(e),
        };

        debug!(
            "Opened segment: base={}, next={}, store_size={}",
            base_offset,
            next_offset,
            store.size()
        );

        Ok(Self {
            store: Arc::new(store),
            index,
            base_offset,
            next_offset,
            config,
        })
    }

    /// Assign the next offset to `record`, persist it and index it.
    pub fn append(&mut self, record: &mut Record) -> StorageResult<u64> {
        let offset = self.next_offset;
        if offset == u64::MAX {
            return Err(StorageError::OffsetOutOfRange(offset));
        }
        let relative =
            u32::try_from(offset - self.base_offset).map_err(|_| StorageError::IndexFull)?;
        if self.index.is_full() {
            return Err(StorageError::IndexFull);
        }

        record.offset = offset;
        let data = record.serialize()?;
        let (_, position) = self.store.append(&data)?;
        self.index.write(relative, position)?;

        self.next_offset += 1;
        Ok(offset)
    }

    pub fn read(&self, offset: u64) -> StorageResult<Record> {
        if offset < self.base_offset || offset >= self.next_offset {
            return Err(StorageError::OffsetOutOfRange(offset));
        }

        let (_, position) = self.index.read((offset - self.base_offset) as i64)?;
        let data = self.store.read(position)?;
        Record::deserialize(&data)
    }

    /// True once either the store or the index has reached its cap.
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes || self.index.is_full()
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    pub(crate) fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Close both files, attempting the index even if the store fails.
    pub fn close(&mut self) -> StorageResult<()> {
        let store = self.store.close();
        let index = self.index.close();
        store.and(index)
    }

    /// Close the segment and delete both of its files.
    pub fn remove(mut self) -> StorageResult<()> {
        self.close()?;
        fs::remove_file(self.store.path())?;
        fs::remove_file(self.index.path())?;
        info!(
            "Removed segment: base={}, next={}",
            self.base_offset, self.next_offset
        );
        Ok(())
    }
}
