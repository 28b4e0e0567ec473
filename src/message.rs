use bincode::{Decode, Encode};
use tracing::warn;

use crate::error::StorageResult;

/// A single log record.
///
/// `offset` is assigned by the segment on append; whatever the caller puts
/// there is overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Decode, Encode)]
pub struct Record {
    pub offset: u64,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            offset: 0,
            value: value.into(),
        }
    }

    pub fn serialize(&self) -> StorageResult<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> StorageResult<Self> {
        let config = bincode::config::standard();
        let (record, _) = bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize record: {}", e);
            e
        })?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_encoding_keeps_offset_and_value() {
        let record = Record {
            offset: 42,
            value: b"hello world".to_vec(),
        };
        let bytes = record.serialize().unwrap();
        assert_eq!(Record::deserialize(&bytes).unwrap(), record);
    }

    #[test]
    fn test_record_deserialize_garbage() {
        assert!(Record::deserialize(&[0xff]).is_err());
    }
}
