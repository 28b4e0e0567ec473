use crate::{error::Result, error::StorageResult, message::Record};

/// The capability the transport layer and the replicator need from a log.
///
/// `Log` is the only production implementer; tests substitute doubles.
pub trait CommitLog: Send + Sync {
    fn append(&self, record: Record) -> StorageResult<u64>;

    fn read(&self, offset: u64) -> StorageResult<Record>;

    fn remove(&self) -> StorageResult<()>;
}

/// Receives membership changes for remote nodes.
pub trait MembershipHandler: Send + Sync {
    fn join(&self, name: &str, rpc_addr: &str) -> Result<()>;

    fn leave(&self, name: &str) -> Result<()>;
}
