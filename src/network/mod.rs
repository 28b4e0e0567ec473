//! Produce/consume transport for the commit log.
//!
//! # Module Structure
//!
//! - `wire`: request/response types and length-delimited bincode frames
//! - `server`: TCP server over any [`CommitLog`](crate::traits::CommitLog)
//! - `client`: request/response client, the produce stream, and the record
//!   stream used for replication

mod client;
mod server;
pub mod wire;

pub use client::{CONNECT_TIMEOUT, ConsumeStream, LogClient, ProduceStream};
pub use server::{LogServer, ServerConfig, ServerHandle};
