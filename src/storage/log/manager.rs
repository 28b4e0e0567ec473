//! The per-node log: an ordered set of segments.
//!
//! This module provides:
//! - Recovery of segments from `<base_offset>.store` / `<base_offset>.index` pairs
//! - Routing appends to the active (last) segment, rotating when it is maxed
//! - Offset lookups across all segments
//! - Truncation of old segments and a raw sequential reader for export

use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::{
    error::{StorageError, StorageResult},
    message::Record,
    traits::CommitLog,
};

use super::{
    index::ENTRY_WIDTH,
    segment::{INDEX_FILE_EXT, STORE_FILE_EXT, Segment},
    store::Store,
};

/// Default store size before rotation (1MB)
pub const DEFAULT_MAX_STORE_BYTES: u64 = 1024 * 1024;

/// Default index size before rotation (1MB), also the preallocated size
pub const DEFAULT_MAX_INDEX_BYTES: u64 = 1024 * 1024;

/// Segment limits. Zero byte limits fall back to the defaults above.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentConfig {
    pub max_store_bytes: u64,
    pub max_index_bytes: u64,
    /// First offset of a brand-new log
    pub initial_offset: u64,
}

impl SegmentConfig {
    fn normalized(mut self) -> StorageResult<Self> {
        if self.max_store_bytes == 0 {
            self.max_store_bytes = DEFAULT_MAX_STORE_BYTES;
        }
        if self.max_index_bytes == 0 {
            self.max_index_bytes = DEFAULT_MAX_INDEX_BYTES;
        }
        if self.max_index_bytes < ENTRY_WIDTH {
            return Err(StorageError::Config(format!(
                "max_index_bytes {} is smaller than one index entry ({} bytes)",
                self.max_index_bytes, ENTRY_WIDTH
            )));
        }
        Ok(self)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogConfig {
    pub segment: SegmentConfig,
}

struct LogInner {
    /// Sorted by base offset; the last one is active
    segments: Vec<Segment>,
    closed: bool,
}

impl LogInner {
    fn active(&mut self) -> StorageResult<&mut Segment> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        self.segments.last_mut().ok_or(StorageError::Closed)
    }
}

pub struct Log {
    dir: PathBuf,
    config: LogConfig,
    inner: RwLock<LogInner>,
}

impl Log {
    /// Open the log in `dir`, recovering any existing segments.
    pub fn new(dir: impl AsRef<Path>, config: LogConfig) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let config = LogConfig {
            segment: config.segment.normalized()?,
        };

        fs::create_dir_all(&dir)?;
        let segments = Self::load_segments(&dir, &config)?;

        info!(
            "Opened log {:?}: segments={}, max_store_bytes={}, max_index_bytes={}",
            dir,
            segments.len(),
            config.segment.max_store_bytes,
            config.segment.max_index_bytes
        );

        Ok(Self {
            dir,
            config,
            inner: RwLock::new(LogInner {
                segments,
                closed: false,
            }),
        })
    }

    /// Scan `dir` for segment files and open one segment per base offset.
    fn load_segments(dir: &Path, config: &LogConfig) -> StorageResult<Vec<Segment>> {
        let mut base_offsets = Vec::new();

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if ext != Some(STORE_FILE_EXT) && ext != Some(INDEX_FILE_EXT) {
                continue;
            }
            match path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                Some(base_offset) => base_offsets.push(base_offset),
                None => warn!("Ignoring unrecognised file in log directory: {:?}", path),
            }
        }

        base_offsets.sort_unstable();
        base_offsets.dedup();

        let mut segments = Vec::with_capacity(base_offsets.len() + 1);
        for base_offset in base_offsets {
            segments.push(Segment::open(dir, base_offset, config.segment)?);
        }

        match segments.last() {
            None => {
                segments.push(Segment::open(
                    dir,
                    config.segment.initial_offset,
                    config.segment,
                )?);
            }
            Some(last) if last.is_maxed() => {
                let base_offset = last.next_offset();
                segments.push(Segment::open(dir, base_offset, config.segment)?);
            }
            Some(_) => {}
        }

        Ok(segments)
    }

    fn rotate(&self, inner: &mut LogInner, base_offset: u64) -> StorageResult<()> {
        let segment = Segment::open(&self.dir, base_offset, self.config.segment)?;
        inner.segments.push(segment);
        info!("Rotated to new segment: base={}", base_offset);
        Ok(())
    }

    /// Append `record` to the active segment and return its offset. A maxed
    /// active segment is replaced by a new one starting at `offset + 1`.
    pub fn append(&self, mut record: Record) -> StorageResult<u64> {
        let mut inner = self.inner.write();

        let offset = match inner.active()?.append(&mut record) {
            Ok(offset) => offset,
            Err(StorageError::IndexFull) => {
                let base_offset = inner.active()?.next_offset();
                self.rotate(&mut inner, base_offset)?;
                inner.active()?.append(&mut record)?
            }
            Err(e) => return Err(e),
        };

        if inner.active()?.is_maxed() {
            self.rotate(&mut inner, offset + 1)?;
        }
        Ok(offset)
    }

    pub fn read(&self, offset: u64) -> StorageResult<Record> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StorageError::Closed);
        }

        let segment = inner
            .segments
            .iter()
            .rev()
            .find(|s| s.base_offset() <= offset && offset <= s.next_offset())
            .ok_or(StorageError::OffsetOutOfRange(offset))?;
        if offset >= segment.next_offset() {
            return Err(StorageError::OffsetOutOfRange(offset));
        }
        segment.read(offset)
    }

    pub fn lowest_offset(&self) -> u64 {
        self.inner
            .read()
            .segments
            .first()
            .map_or(0, |s| s.base_offset())
    }

    pub fn highest_offset(&self) -> u64 {
        self.inner
            .read()
            .segments
            .last()
            .map_or(0, |s| s.next_offset().saturating_sub(1))
    }

    /// Remove every segment whose whole range is at or below `lowest`. If
    /// nothing survives, a fresh active segment starts at `lowest + 1`
    /// (saturating, so `u64::MAX` leaves an exhausted log).
    ///
    /// If a removal fails, the segments not yet removed stay in the log and
    /// the error is returned.
    pub fn truncate(&self, lowest: u64) -> StorageResult<()> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StorageError::Closed);
        }

        let cutoff = lowest.saturating_add(1);
        let (doomed, kept): (Vec<Segment>, Vec<Segment>) = std::mem::take(&mut inner.segments)
            .into_iter()
            .partition(|s| s.next_offset() <= cutoff);
        inner.segments = kept;

        let mut removed = 0;
        let mut result = Ok(());
        let mut doomed = doomed.into_iter();
        for segment in doomed.by_ref() {
            let base_offset = segment.base_offset();
            if let Err(e) = segment.remove() {
                warn!("Failed to remove segment {}: {}", base_offset, e);
                result = Err(e);
                break;
            }
            removed += 1;
        }

        let remaining: Vec<Segment> = doomed.collect();
        if !remaining.is_empty() {
            let kept = std::mem::replace(&mut inner.segments, remaining);
            inner.segments.extend(kept);
        }
        if inner.segments.is_empty() {
            self.rotate(&mut inner, cutoff)?;
        }

        info!(
            "Truncated log up to offset {}: removed {} segment(s)",
            lowest, removed
        );
        result
    }

    /// A sequential reader over every segment's raw store bytes, in base
    /// offset order.
    pub fn reader(&self) -> LogReader {
        let inner = self.inner.read();
        LogReader {
            stores: inner.segments.iter().map(|s| s.store()).collect(),
            current: 0,
            position: 0,
        }
    }

    /// Close every segment, returning the first failure. Later operations
    /// fail with `Closed`; calling again retries any segment left open.
    pub fn close(&self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let was_closed = std::mem::replace(&mut inner.closed, true);

        let mut first_error = None;
        for segment in inner.segments.iter_mut() {
            if let Err(e) = segment.close() {
                warn!("Failed to close segment {}: {}", segment.base_offset(), e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        if !was_closed {
            info!("Closed log {:?}", self.dir);
        }
        Ok(())
    }

    /// Close the log and delete its directory.
    pub fn remove(&self) -> StorageResult<()> {
        self.close()?;
        self.inner.write().segments.clear();
        match fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Delete all on-disk state and start over as a fresh log.
    pub fn reset(&self) -> StorageResult<()> {
        self.remove()?;
        fs::create_dir_all(&self.dir)?;
        let segments = Self::load_segments(&self.dir, &self.config)?;

        let mut inner = self.inner.write();
        inner.segments = segments;
        inner.closed = false;
        info!("Reset log {:?}", self.dir);
        Ok(())
    }

    pub fn segment_count(&self) -> usize {
        self.inner.read().segments.len()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> LogConfig {
        self.config
    }
}

impl CommitLog for Log {
    fn append(&self, record: Record) -> StorageResult<u64> {
        Log::append(self, record)
    }

    fn read(&self, offset: u64) -> StorageResult<Record> {
        Log::read(self, offset)
    }

    fn remove(&self) -> StorageResult<()> {
        Log::remove(self)
    }
}

/// Raw byte stream over the stores that existed when it was created.
pub struct LogReader {
    stores: Vec<Arc<Store>>,
    current: usize,
    position: u64,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while let Some(store) = self.stores.get(self.current) {
            let n = store.read_at(buf, self.position).map_err(|e| match e {
                StorageError::Io(e) => e,
                e => io::Error::other(e),
            })?;
            if n > 0 {
                self.position += n as u64;
                return Ok(n);
            }
            self.current += 1;
            self.position = 0;
        }
        Ok(0)
    }
}
