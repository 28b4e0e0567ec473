//! Segmented commit log storage.
//!
//! # Module Structure
//!
//! - `store`: append-only, length-prefixed record file
//! - `index`: memory-mapped relative offset -> store position index
//! - `segment`: one store + one index covering a contiguous offset range
//! - `manager`: the full log, with rotation, truncation and recovery

mod index;
mod manager;
mod segment;
mod store;


pub use index::{ENTRY_WIDTH, Index, OFFSET_WIDTH, POSITION_WIDTH};

pub use manager::{
    DEFAULT_MAX_INDEX_BYTES, DEFAULT_MAX_STORE_BYTES, Log, LogConfig, LogReader, SegmentConfig,
};

pub use segment::{INDEX_FILE_EXT, STORE_FILE_EXT, Segment};

pub use store::{LEN_WIDTH, Store};
