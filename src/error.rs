use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("Invalid address {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the segmented log (store, index, segment, log)
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Offset {0} out of range")]
    OffsetOutOfRange(u64),

    /// The index has no room for another entry. The log treats this as a
    /// rotation trigger.
    #[error("Index full")]
    IndexFull,

    #[error("End of index")]
    EndOfIndex,

    #[error("Failed to encode record: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Failed to decode record: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Log is closed")]
    Closed,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StorageError {
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, StorageError::OffsetOutOfRange(_) | StorageError::EndOfIndex)
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors raised by the RPC transport
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Failed to decode frame: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Offset {0} out of range")]
    OffsetOutOfRange(u64),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unexpected response")]
    UnexpectedResponse,

    #[error("RPC timeout")]
    Timeout,
}

impl RpcError {
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, RpcError::OffsetOutOfRange(_))
    }
}

pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Errors raised by gossip membership
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode gossip message: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Failed to decode gossip message: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Invalid address {0}")]
    InvalidAddress(String),

    #[error("Failed to join cluster: {0}")]
    JoinFailed(String),
}

pub type MembershipResult<T> = std::result::Result<T, MembershipError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_classification() {
        assert!(StorageError::OffsetOutOfRange(3).is_out_of_range());
        assert!(StorageError::EndOfIndex.is_out_of_range());
        assert!(!StorageError::IndexFull.is_out_of_range());
        assert!(!StorageError::Closed.is_out_of_range());

        assert!(RpcError::OffsetOutOfRange(7).is_out_of_range());
        assert!(!RpcError::ConnectionClosed.is_out_of_range());
        assert!(!RpcError::Remote("offset out of range".into()).is_out_of_range());
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = StorageError::OffsetOutOfRange(9).into();
        assert!(matches!(err, Error::Storage(StorageError::OffsetOutOfRange(9))));
        assert_eq!(err.to_string(), "Storage error: Offset 9 out of range");
    }
}
