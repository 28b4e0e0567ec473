use std::time::Duration;

use tokio::{net::TcpStream, time::timeout};
use tracing::debug;

use crate::{
    error::{RpcError, RpcResult},
    message::Record,
};

use super::wire::{self, FramedStream, Request, Response};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client for a single [`LogServer`](super::LogServer) connection.
pub struct LogClient {
    addr: String,
    framed: FramedStream,
}

impl LogClient {
    pub async fn connect(addr: &str) -> RpcResult<Self> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Timeout)??;
        stream.set_nodelay(true)?;
        debug!("Connected to log server {}", addr);

        Ok(Self {
            addr: addr.to_string(),
            framed: wire::framed(stream),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Append `record` on the server and return the offset it was given.
    pub async fn produce(&mut self, record: Record) -> RpcResult<u64> {
        match self.call(Request::Produce { record }).await? {
            Response::Produced { offset } => Ok(offset),
            Response::Error(e) => Err(e.into()),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    pub async fn consume(&mut self, offset: u64) -> RpcResult<Record> {
        match self.call(Request::Consume { offset }).await? {
            Response::Record { record } => Ok(record),
            Response::Error(e) => Err(e.into()),
            _ => Err(RpcError::UnexpectedResponse),
        }
    }

    /// Turn this connection into a stream of records starting at `offset`.
    pub async fn consume_stream(mut self, offset: u64) -> RpcResult<ConsumeStream> {
        wire::send(&mut self.framed, &Request::ConsumeStream { offset }).await?;
        Ok(ConsumeStream {
            framed: self.framed,
        })
    }

    /// Turn this connection into a produce stream. Records can be sent ahead
    /// of their acknowledgements; offsets come back in send order.
    pub async fn produce_stream(mut self) -> RpcResult<ProduceStream> {
        wire::send(&mut self.framed, &Request::ProduceStream).await?;
        Ok(ProduceStream {
            framed: self.framed,
        })
    }

    async fn call(&mut self, request: Request) -> RpcResult<Response> {
        wire::send(&mut self.framed, &request).await?;
        wire::recv(&mut self.framed)
            .await?
            .ok_or(RpcError::ConnectionClosed)
    }
}

pub struct ConsumeStream {
    framed: FramedStream,
}

impl ConsumeStream {
    /// Wait for the next record.
    ///
    /// `RpcError::OffsetOutOfRange` means the server has caught up; the
    /// stream stays open and later calls yield new records as they arrive.
    /// Any other error ends the stream.
    pub async fn next(&mut self) -> RpcResult<Record> {
        match wire::recv(&mut self.framed).await? {
            Some(Response::Record { record }) => Ok(record),
            Some(Response::Error(e)) => Err(e.into()),
            Some(_) => Err(RpcError::UnexpectedResponse),
            None => Err(RpcError::ConnectionClosed),
        }
    }
}

pub struct ProduceStream {
    framed: FramedStream,
}

impl ProduceStream {
    pub async fn send(&mut self, record: Record) -> RpcResult<()> {
        wire::send(&mut self.framed, &record).await
    }

    /// Offset assigned to the oldest unacknowledged record. An error ends the
    /// stream.
    pub async fn recv(&mut self) -> RpcResult<u64> {
        match wire::recv(&mut self.framed).await? {
            Some(Response::Produced { offset }) => Ok(offset),
            Some(Response::Error(e)) => Err(e.into()),
            Some(_) => Err(RpcError::UnexpectedResponse),
            None => Err(RpcError::ConnectionClosed),
        }
    }
}
