//! Frame format shared by the log server and client.
//!
//! Every message is one `LengthDelimitedCodec` frame holding a
//! bincode-encoded [`Request`] or [`Response`].

use bincode::{Decode, Encode};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{
    error::{RpcError, RpcResult, StorageError},
    message::Record,
};

pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Request {
    Produce { record: Record },
    Consume { offset: u64 },
    /// Open-ended stream of records starting at `offset`
    ConsumeStream { offset: u64 },
    /// Every later frame on the connection is a bare [`Record`], each
    /// answered with `Produced` in order
    ProduceStream,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Response {
    Produced { offset: u64 },
    Record { record: Record },
    Error(WireError),
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum WireError {
    OffsetOutOfRange(u64),
    Internal(String),
}

impl From<&StorageError> for WireError {
    fn from(e: &StorageError) -> Self {
        match e {
            StorageError::OffsetOutOfRange(offset) => WireError::OffsetOutOfRange(*offset),
            e => WireError::Internal(e.to_string()),
        }
    }
}

impl From<WireError> for RpcError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::OffsetOutOfRange(offset) => RpcError::OffsetOutOfRange(offset),
            WireError::Internal(msg) => RpcError::Remote(msg),
        }
    }
}

pub fn framed(stream: TcpStream) -> FramedStream {
    Framed::new(stream, LengthDelimitedCodec::new())
}

pub fn encode<T: Encode>(msg: &T) -> RpcResult<Bytes> {
    let data = bincode::encode_to_vec(msg, bincode::config::standard())?;
    Ok(Bytes::from(data))
}

pub fn decode<T: Decode<()>>(frame: &[u8]) -> RpcResult<T> {
    let (msg, _) = bincode::decode_from_slice(frame, bincode::config::standard())?;
    Ok(msg)
}

pub async fn send<T: Encode>(framed: &mut FramedStream, msg: &T) -> RpcResult<()> {
    framed.send(encode(msg)?).await?;
    Ok(())
}

/// Next message, or `None` once the peer has closed the connection.
pub async fn recv<T: Decode<()>>(framed: &mut FramedStream) -> RpcResult<Option<T>> {
    match framed.next().await {
        Some(frame) => Ok(Some(decode(&frame?)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_mapping() {
        let err = StorageError::OffsetOutOfRange(12);
        assert_eq!(WireError::from(&err), WireError::OffsetOutOfRange(12));

        let err = StorageError::Closed;
        assert_eq!(
            WireError::from(&err),
            WireError::Internal("Log is closed".to_string())
        );
    }

    #[test]
    fn test_wire_error_to_rpc_error() {
        assert!(RpcError::from(WireError::OffsetOutOfRange(3)).is_out_of_range());
        assert!(matches!(
            RpcError::from(WireError::Internal("boom".into())),
            RpcError::Remote(msg) if msg == "boom"
        ));
    }

    #[test]
    fn test_request_frame() {
        let request = Request::Produce {
            record: Record::new(b"payload".to_vec()),
        };
        let frame = encode(&request).unwrap();
        assert_eq!(decode::<Request>(&frame).unwrap(), request);
    }

    #[test]
    fn test_produce_stream_frames() {
        let frame = encode(&Request::ProduceStream).unwrap();
        assert_eq!(decode::<Request>(&frame).unwrap(), Request::ProduceStream);

        // Records on an open produce stream travel without a request wrapper.
        let record = Record::new(b"streamed".to_vec());
        let frame = encode(&record).unwrap();
        assert_eq!(decode::<Record>(&frame).unwrap(), record);
    }

    #[test]
    fn test_decode_truncated_frame() {
        let frame = encode(&Response::Record {
            record: Record::new(vec![7u8; 32]),
        })
        .unwrap();
        assert!(matches!(
            decode::<Response>(&frame[..frame.len() - 4]),
            Err(RpcError::Decode(_))
        ));
    }
}
