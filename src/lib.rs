//! Replicated, append-only commit log.
//!
//! Each node keeps a segmented log on disk, discovers the rest of the
//! cluster through gossip, and streams every peer's log into its own.
//!
//! # Module Structure
//!
//! - `storage`: store, index, segment and log
//! - `network`: produce/consume server and client
//! - `discovery`: gossip membership
//! - `replicator`: per-peer streaming replication driven by membership
//! - `agent`: wires a complete node together

pub mod agent;
pub mod discovery;
pub mod error;
pub mod message;
pub mod network;
pub mod replicator;
pub mod storage;
pub mod traits;

pub use agent::{Agent, AgentConfig};
pub use discovery::{Member, MemberStatus, Membership, MembershipConfig, RPC_ADDR_TAG};
pub use error::{Error, MembershipError, Result, RpcError, StorageError};
pub use message::Record;
pub use network::{LogClient, LogServer, ServerConfig, ServerHandle};
pub use replicator::{Replicator, ReplicatorConfig};
pub use storage::{Log, LogConfig, SegmentConfig};
pub use traits::{CommitLog, MembershipHandler};
