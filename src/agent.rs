//! A complete node: log, log server, replicator and membership.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::runtime::Handle;
use tracing::{Instrument, Span, error, info, info_span};

use crate::{
    discovery::{Membership, MembershipConfig, RPC_ADDR_TAG},
    error::{Error, Result},
    network::{LogServer, ServerConfig, ServerHandle},
    replicator::{Replicator, ReplicatorConfig},
    storage::{Log, LogConfig},
    traits::CommitLog,
};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_dir: PathBuf,
    /// Gossip bind address
    pub bind_addr: String,
    /// Log server port on the gossip host; 0 picks a free port
    pub rpc_port: u16,
    pub node_name: String,
    pub start_join_addrs: Vec<String>,
    pub log: LogConfig,
    pub membership: MembershipConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bind_addr: "127.0.0.1:8401".to_string(),
            rpc_port: 8400,
            node_name: "node-1".to_string(),
            start_join_addrs: Vec::new(),
            log: LogConfig::default(),
            membership: MembershipConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Address the log server binds: the gossip host with `rpc_port`.
    pub fn rpc_addr(&self) -> Result<SocketAddr> {
        let bind: SocketAddr = self
            .bind_addr
            .parse()
            .map_err(|_| Error::InvalidAddress(self.bind_addr.clone()))?;
        Ok(SocketAddr::new(bind.ip(), self.rpc_port))
    }
}

pub struct Agent {
    config: AgentConfig,
    log: Arc<Log>,
    server: ServerHandle,
    replicator: Arc<Replicator>,
    membership: Membership,
    shutdown: AtomicBool,
    span: Span,
}

impl Agent {
    pub async fn new(config: AgentConfig) -> Result<Self> {
        let span = info_span!("agent", node = %config.node_name);
        let rpc_addr = config.rpc_addr()?;

        let log = Arc::new(Log::new(config.data_dir.join("log"), config.log)?);

        let server = LogServer::new(log.clone() as Arc<dyn CommitLog>, ServerConfig::default())
            .serve(rpc_addr)
            .await?;

        let replicator = Arc::new(Replicator::new(
            log.clone(),
            Handle::current(),
            ReplicatorConfig::default(),
            span.clone(),
        ));

        let mut tags = BTreeMap::new();
        tags.insert(RPC_ADDR_TAG.to_string(), server.local_addr().to_string());
        let membership_config = MembershipConfig {
            node_name: config.node_name.clone(),
            bind_addr: config.bind_addr.clone(),
            tags,
            start_join_addrs: config.start_join_addrs.clone(),
            ..config.membership.clone()
        };
        let membership = match Membership::new(
            membership_config,
            replicator.clone(),
            span.clone(),
        )
        .await
        {
            Ok(membership) => membership,
            Err(e) => {
                server.shutdown().await;
                if let Err(close_err) = log.close() {
                    span.in_scope(|| {
                        error!("Failed to close log after startup error: {}", close_err)
                    });
                }
                return Err(e.into());
            }
        };

        span.in_scope(|| {
            info!(
                "Agent started: rpc_addr={}, gossip_addr={}",
                server.local_addr(),
                membership.local_addr()
            )
        });

        Ok(Self {
            config,
            log,
            server,
            replicator,
            membership,
            shutdown: AtomicBool::new(false),
            span,
        })
    }

    /// Leave the cluster, close the log, stop replication and stop the log
    /// server, in that order. Every step runs even if an earlier one failed;
    /// the first error is returned. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown_in_order()
            .instrument(self.span.clone())
            .await
    }

    async fn shutdown_in_order(&self) -> Result<()> {
        let mut first_error: Option<Error> = None;

        if let Err(e) = self.membership.leave().await {
            error!("Failed to leave cluster: {}", e);
            first_error.get_or_insert(e.into());
        }
        if let Err(e) = self.log.close() {
            error!("Failed to close log: {}", e);
            first_error.get_or_insert(e.into());
        }
        self.replicator.close().await;
        self.server.shutdown().await;

        info!("Agent shut down");
        first_error.map_or(Ok(()), Err)
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// Bound address of the log server.
    pub fn rpc_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Bound gossip address.
    pub fn bind_addr(&self) -> SocketAddr {
        self.membership.local_addr()
    }
}
