use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::{
    error::{RpcError, RpcResult},
    message::Record,
    traits::CommitLog,
};

use super::wire::{self, FramedStream, Request, Response, WireError};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How often a caught-up consume stream re-checks the log
    pub stream_poll_interval: Duration,
    /// How long `shutdown` waits for open connections to finish
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            stream_poll_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Serves produce/consume requests against a [`CommitLog`].
pub struct LogServer {
    log: Arc<dyn CommitLog>,
    config: ServerConfig,
}

impl LogServer {
    pub fn new(log: Arc<dyn CommitLog>, config: ServerConfig) -> Self {
        Self { log, config }
    }

    /// Bind `addr` and start accepting connections in the background.
    pub async fn serve(self, addr: impl ToSocketAddrs) -> RpcResult<ServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener)
    }

    pub fn serve_listener(self, listener: TcpListener) -> RpcResult<ServerHandle> {
        let local_addr = listener.local_addr()?;
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();

        info!("Log server listening on {}", local_addr);

        let accept = tokio::spawn(
            accept_loop(
                listener,
                self.log,
                self.config.clone(),
                token.clone(),
                tracker.clone(),
            )
            .instrument(info_span!("log_server", addr = %local_addr)),
        );

        Ok(ServerHandle {
            local_addr,
            token,
            tracker,
            shutdown_timeout: self.config.shutdown_timeout,
            accept: Mutex::new(Some(accept)),
        })
    }
}

pub struct ServerHandle {
    local_addr: SocketAddr,
    token: CancellationToken,
    tracker: TaskTracker,
    shutdown_timeout: Duration,
    accept: Mutex<Option<JoinHandle<()>>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, cancel every connection and wait for them to exit.
    /// Later calls return immediately.
    pub async fn shutdown(&self) {
        let accept = self.accept.lock().take();
        let Some(accept) = accept else {
            return;
        };

        self.token.cancel();
        if let Err(e) = accept.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        self.tracker.close();
        if timeout(self.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "Forced server shutdown with {} open connection(s)",
                self.tracker.len()
            );
        }
        info!("Log server on {} stopped", self.local_addr);
    }
}

async fn accept_loop(
    listener: TcpListener,
    log: Arc<dyn CommitLog>,
    config: ServerConfig,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    debug!("New connection from {}", peer);
                    let log = log.clone();
                    let config = config.clone();
                    let token = token.clone();
                    tracker.spawn(
                        async move {
                            if let Err(e) = handle_connection(stream, log, config, token).await {
                                warn!("Connection error: {}", e);
                            }
                        }
                        .instrument(info_span!("connection", %peer)),
                    );
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    log: Arc<dyn CommitLog>,
    config: ServerConfig,
    token: CancellationToken,
) -> RpcResult<()> {
    stream.set_nodelay(true)?;
    let mut framed = wire::framed(stream);

    loop {
        let request = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            request = wire::recv::<Request>(&mut framed) => request?,
        };
        let Some(request) = request else {
            return Ok(());
        };

        let response = match request {
            Request::Produce { record } => match log.append(record) {
                Ok(offset) => Response::Produced { offset },
                Err(e) => Response::Error(WireError::from(&e)),
            },
            Request::Consume { offset } => match log.read(offset) {
                Ok(record) => Response::Record { record },
                Err(e) => Response::Error(WireError::from(&e)),
            },
            Request::ConsumeStream { offset } => {
                return stream_records(&mut framed, log, offset, &config, &token).await;
            }
            Request::ProduceStream => {
                return produce_records(&mut framed, log, &token).await;
            }
        };
        wire::send(&mut framed, &response).await?;
    }
}

/// Append every record frame and answer each with its offset. An append
/// failure is reported once and ends the stream.
async fn produce_records(
    framed: &mut FramedStream,
    log: Arc<dyn CommitLog>,
    token: &CancellationToken,
) -> RpcResult<()> {
    debug!("Accepting produce stream");
    loop {
        let record = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            record = wire::recv::<Record>(framed) => record?,
        };
        let Some(record) = record else {
            return Ok(());
        };

        match log.append(record) {
            Ok(offset) => wire::send(framed, &Response::Produced { offset }).await?,
            Err(e) => {
                warn!("Ending produce stream: {}", e);
                wire::send(framed, &Response::Error(WireError::from(&e))).await?;
                return Ok(());
            }
        }
    }
}

/// Push records from `offset` onwards until the client goes away, the server
/// shuts down or the log fails.
async fn stream_records(
    framed: &mut FramedStream,
    log: Arc<dyn CommitLog>,
    mut offset: u64,
    config: &ServerConfig,
    token: &CancellationToken,
) -> RpcResult<()> {
    debug!("Streaming records from offset {}", offset);
    let mut caught_up = false;

    loop {
        if token.is_cancelled() {
            return Ok(());
        }

        match log.read(offset) {
            Ok(record) => {
                wire::send(framed, &Response::Record { record }).await?;
                offset += 1;
                caught_up = false;
            }
            Err(e) if e.is_out_of_range() => {
                if !caught_up {
                    let response = Response::Error(WireError::OffsetOutOfRange(offset));
                    wire::send(framed, &response).await?;
                    caught_up = true;
                }
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(config.stream_poll_interval) => {}
                    frame = framed.next() => match frame {
                        None => return Ok(()),
                        Some(Err(e)) => return Err(RpcError::Io(e)),
                        Some(Ok(_)) => debug!("Ignoring request on an open stream"),
                    },
                }
            }
            Err(e) => {
                warn!("Ending stream at offset {}: {}", offset, e);
                wire::send(framed, &Response::Error(WireError::from(&e))).await?;
                return Ok(());
            }
        }
    }
}
