pub mod log;

pub use log::{Log, LogConfig, SegmentConfig};
