//! Pulls every peer's log into the local log.
//!
//! The replicator is the membership handler: a joined peer gets a task that
//! streams the peer's log from offset 0 and appends each record locally, a
//! departed peer has its task cancelled. Records get new local offsets and
//! are not deduplicated.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::{
    error::Result,
    message::Record,
    network::{ConsumeStream, LogClient},
    traits::{CommitLog, MembershipHandler},
};

#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Records buffered between a peer's stream and the local log
    pub buffer_size: usize,
    /// How long `close` waits for each peer task before aborting it
    pub shutdown_timeout: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

struct PeerTask {
    addr: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Replicator {
    log: Arc<dyn CommitLog>,
    runtime: Handle,
    config: ReplicatorConfig,
    closing: CancellationToken,
    peers: Mutex<HashMap<String, PeerTask>>,
    span: Span,
}

impl Replicator {
    pub fn new(
        log: Arc<dyn CommitLog>,
        runtime: Handle,
        config: ReplicatorConfig,
        span: Span,
    ) -> Self {
        Self {
            log,
            runtime,
            config,
            closing: CancellationToken::new(),
            peers: Mutex::new(HashMap::new()),
            span,
        }
    }

    /// Names of the peers currently tracked.
    pub fn peers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// True while `name` has a running replication task. A tracked peer
    /// whose stream failed stays listed by `peers` but is not replicating
    /// until it joins again.
    pub fn is_replicating(&self, name: &str) -> bool {
        self.peers
            .lock()
            .get(name)
            .is_some_and(|task| !task.handle.is_finished())
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Stop every peer task and wait for them to exit. Later `join` calls
    /// are ignored. Safe to call twice.
    pub async fn close(&self) {
        let tasks: Vec<(String, PeerTask)> = {
            let mut peers = self.peers.lock();
            if self.closing.is_cancelled() && peers.is_empty() {
                return;
            }
            self.closing.cancel();
            peers.drain().collect()
        };

        for (name, task) in tasks {
            let abort = task.handle.abort_handle();
            match timeout(self.config.shutdown_timeout, task.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(peer = %name, "Replication task ended abnormally: {}", e),
                Err(_) => {
                    warn!(peer = %name, "Replication task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        info!("Replicator closed");
    }
}

impl MembershipHandler for Replicator {
    fn join(&self, name: &str, addr: &str) -> Result<()> {
        let mut peers = self.peers.lock();
        if self.closing.is_cancelled() {
            return Ok(());
        }

        if let Some(task) = peers.get(name) {
            if !task.handle.is_finished() {
                return Ok(());
            }
            info!(peer = %name, addr = %task.addr, "Restarting finished replication task");
        }

        let token = CancellationToken::new();
        let span = info_span!(parent: &self.span, "replicate", peer = %name, addr = %addr);
        let handle = self.runtime.spawn(
            replicate(
                addr.to_string(),
                self.log.clone(),
                token.clone(),
                self.closing.clone(),
                self.config.buffer_size,
            )
            .instrument(span),
        );

        peers.insert(
            name.to_string(),
            PeerTask {
                addr: addr.to_string(),
                token,
                handle,
            },
        );
        info!(peer = %name, addr = %addr, "Started replicating");
        Ok(())
    }

    fn leave(&self, name: &str) -> Result<()> {
        if let Some(task) = self.peers.lock().remove(name) {
            task.token.cancel();
            info!(peer = %name, addr = %task.addr, "Stopped replicating");
        }
        Ok(())
    }
}

/// Open a consume stream on the peer and append everything it yields until
/// either token fires or the stream fails.
async fn replicate(
    addr: String,
    log: Arc<dyn CommitLog>,
    peer: CancellationToken,
    closing: CancellationToken,
    buffer_size: usize,
) {
    let stream = tokio::select! {
        _ = peer.cancelled() => return,
        _ = closing.cancelled() => return,
        stream = open_stream(&addr) => match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to open stream: {}", e);
                return;
            }
        },
    };

    let (tx, mut rx) = mpsc::channel(buffer_size);
    let pump = tokio::spawn(pump_records(stream, tx).in_current_span());

    loop {
        tokio::select! {
            _ = peer.cancelled() => break,
            _ = closing.cancelled() => break,
            record = rx.recv() => match record {
                Some(record) => {
                    if let Err(e) = log.append(Record::new(record.value)) {
                        warn!("Failed to append replicated record: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    pump.abort();
    debug!("Replication task exiting");
}

async fn open_stream(addr: &str) -> crate::error::RpcResult<ConsumeStream> {
    LogClient::connect(addr).await?.consume_stream(0).await
}

async fn pump_records(mut stream: ConsumeStream, tx: mpsc::Sender<Record>) {
    loop {
        match stream.next().await {
            Ok(record) => {
                if tx.send(record).await.is_err() {
                    return;
                }
            }
            Err(e) if e.is_out_of_range() => debug!("Caught up with peer"),
            Err(e) => {
                warn!("Replication stream ended: {}", e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::{StorageError, StorageResult};
    use crate::network::{LogServer, ServerConfig, ServerHandle};

    #[derive(Default)]
    struct MemoryLog {
        records: Mutex<Vec<Record>>,
    }

    impl CommitLog for MemoryLog {
        fn append(&self, mut record: Record) -> StorageResult<u64> {
            let mut records = self.records.lock();
            record.offset = records.len() as u64;
            records.push(record);
            Ok(records.len() as u64 - 1)
        }

        fn read(&self, offset: u64) -> StorageResult<Record> {
            self.records
                .lock()
                .get(offset as usize)
                .cloned()
                .ok_or(StorageError::OffsetOutOfRange(offset))
        }

        fn remove(&self) -> StorageResult<()> {
            self.records.lock().clear();
            Ok(())
        }
    }

    impl MemoryLog {
        fn len(&self) -> usize {
            self.records.lock().len()
        }
    }

    fn replicator() -> Replicator {
        Replicator::new(
            Arc::new(MemoryLog::default()),
            Handle::current(),
            ReplicatorConfig::default(),
            Span::none(),
        )
    }

    async fn serve(log: Arc<MemoryLog>) -> ServerHandle {
        LogServer::new(log, ServerConfig::default())
            .serve("127.0.0.1:0")
            .await
            .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_join_leave_tracking() {
        let replicator = replicator();

        // Nothing listens there; the task keeps its registry entry until left.
        replicator.join("b", "127.0.0.1:1").unwrap();
        replicator.join("c", "127.0.0.1:1").unwrap();
        assert_eq!(replicator.peers(), vec!["b", "c"]);

        replicator.leave("b").unwrap();
        replicator.leave("b").unwrap();
        replicator.leave("unknown").unwrap();
        assert_eq!(replicator.peers(), vec!["c"]);

        replicator.close().await;
        assert!(replicator.peers().is_empty());
    }

    #[tokio::test]
    async fn test_join_after_close_is_ignored() {
        let replicator = replicator();
        replicator.close().await;
        replicator.close().await;
        assert!(replicator.is_closed());

        replicator.join("b", "127.0.0.1:1").unwrap();
        assert!(replicator.peers().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_join_runs_one_task() {
        let remote = Arc::new(MemoryLog::default());
        for i in 0..3u8 {
            remote.append(Record::new(vec![i])).unwrap();
        }
        let server = serve(remote.clone()).await;
        let addr = server.local_addr().to_string();

        let local = Arc::new(MemoryLog::default());
        let replicator = Replicator::new(
            local.clone(),
            Handle::current(),
            ReplicatorConfig::default(),
            Span::none(),
        );
        replicator.join("b", &addr).unwrap();
        replicator.join("b", &addr).unwrap();
        assert_eq!(replicator.peers(), vec!["b"]);

        assert!(wait_until(|| local.len() == 3).await);
        // A second task would append every record again.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(local.len(), 3);

        replicator.close().await;
        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stream_failure_ends_task_and_join_restarts_it() {
        let remote = Arc::new(MemoryLog::default());
        remote.append(Record::new(b"first".to_vec())).unwrap();
        let server = serve(remote.clone()).await;

        let local = Arc::new(MemoryLog::default());
        let replicator = Replicator::new(
            local.clone(),
            Handle::current(),
            ReplicatorConfig::default(),
            Span::none(),
        );
        replicator.join("b", &server.local_addr().to_string()).unwrap();
        assert!(wait_until(|| local.len() == 1).await);
        assert!(replicator.is_replicating("b"));

        // The peer's server going away ends the stream and the task.
        server.shutdown().await;
        assert!(wait_until(|| !replicator.is_replicating("b")).await);
        assert_eq!(replicator.peers(), vec!["b"]);

        let server = serve(remote.clone()).await;
        replicator.join("b", &server.local_addr().to_string()).unwrap();
        assert!(replicator.is_replicating("b"));
        // The new stream starts from offset 0 again.
        assert!(wait_until(|| local.len() == 2).await);
        assert_eq!(local.read(1).unwrap().value, b"first");

        replicator.close().await;
        server.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_caught_up_stream_keeps_replicating() {
        let remote = Arc::new(MemoryLog::default());
        let server = serve(remote.clone()).await;

        let local = Arc::new(MemoryLog::default());
        let replicator = Replicator::new(
            local.clone(),
            Handle::current(),
            ReplicatorConfig::default(),
            Span::none(),
        );
        replicator.join("b", &server.local_addr().to_string()).unwrap();

        // The empty peer answers out-of-range first.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(replicator.is_replicating("b"));
        assert_eq!(local.len(), 0);

        remote.append(Record::new(b"late".to_vec())).unwrap();
        assert!(wait_until(|| local.len() == 1).await);
        assert_eq!(local.read(0).unwrap().value, b"late");
        assert!(replicator.is_replicating("b"));

        replicator.close().await;
        server.shutdown().await;
    }
}
