//! Gossip-based cluster membership.
//!
//! Nodes exchange their membership view over UDP. Every gossip round a node
//! bumps its own heartbeat, expires members whose heartbeat stalled, and
//! sends its view to a few random peers. Membership changes are turned into
//! [`MembershipHandler`] calls on a dedicated dispatch task.
//!
//! # Module Structure
//!
//! - `member`: member states, the membership table and its merge rules

mod member;

pub use member::{Member, MemberEvent, MemberStatus, MemberTable};

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use bincode::{Decode, Encode};
use parking_lot::Mutex;
use tokio::{
    net::{UdpSocket, lookup_host},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::{
    error::{MembershipError, MembershipResult},
    traits::MembershipHandler,
};

/// Tag carrying the address of a member's log server
pub const RPC_ADDR_TAG: &str = "rpc_addr";

const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    pub node_name: String,
    /// Gossip bind address
    pub bind_addr: String,
    pub tags: BTreeMap<String, String>,
    /// Gossip addresses of existing members to join through
    pub start_join_addrs: Vec<String>,
    pub gossip_interval: Duration,
    /// A member whose heartbeat has not advanced for this long is failed
    pub failure_timeout: Duration,
    /// Peers contacted per gossip round
    pub fanout: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            bind_addr: "127.0.0.1:0".to_string(),
            tags: BTreeMap::new(),
            start_join_addrs: Vec::new(),
            gossip_interval: Duration::from_millis(200),
            failure_timeout: Duration::from_secs(3),
            fanout: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
enum GossipMessage {
    Join { member: Member },
    Sync { members: Vec<Member> },
}

fn encode_message(msg: &GossipMessage) -> MembershipResult<Vec<u8>> {
    Ok(bincode::encode_to_vec(msg, bincode::config::standard())?)
}

fn decode_message(data: &[u8]) -> MembershipResult<GossipMessage> {
    let (msg, _) = bincode::decode_from_slice(data, bincode::config::standard())?;
    Ok(msg)
}

/// Shared by the gossip tasks.
struct GossipState {
    config: MembershipConfig,
    socket: UdpSocket,
    table: Mutex<MemberTable>,
    seeds: Vec<SocketAddr>,
    /// Taken on leave, which ends the dispatch loop
    events: Mutex<Option<mpsc::UnboundedSender<MemberEvent>>>,
}

impl GossipState {
    fn publish(&self, events: impl IntoIterator<Item = MemberEvent>) {
        let events_tx = self.events.lock();
        if let Some(tx) = events_tx.as_ref() {
            for event in events {
                let _ = tx.send(event);
            }
        }
    }

    async fn send(&self, msg: &GossipMessage, to: SocketAddr) {
        let data = match encode_message(msg) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode gossip message: {}", e);
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&data, to).await {
            debug!("Failed to send gossip to {}: {}", to, e);
        }
    }

    async fn handle(&self, msg: GossipMessage, from: SocketAddr) {
        let now = Instant::now();
        match msg {
            GossipMessage::Join { member } => {
                let reply_to = member.addr;
                debug!("Join request from {} ({})", member.name, from);
                let (event, members) = {
                    let mut table = self.table.lock();
                    (table.merge(member, now), table.gossip_view())
                };
                self.publish(event);
                self.send(&GossipMessage::Sync { members }, reply_to).await;
            }
            GossipMessage::Sync { members } => {
                let events: Vec<MemberEvent> = {
                    let mut table = self.table.lock();
                    members
                        .into_iter()
                        .filter_map(|m| table.merge(m, now))
                        .collect()
                };
                self.publish(events);
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, token: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((n, from)) => match decode_message(&buf[..n]) {
                        Ok(msg) => self.handle(msg, from).await,
                        Err(e) => warn!("Dropping malformed gossip from {}: {}", from, e),
                    },
                    Err(e) => warn!("Gossip receive error: {}", e),
                }
            }
        }
    }

    async fn gossip_loop(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.gossip_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let (local, events, members, targets) = {
                let mut table = self.table.lock();
                table.tick();
                let events = table.expire(self.config.failure_timeout, Instant::now());
                let targets = table.random_peers(self.config.fanout);
                (table.local().clone(), events, table.gossip_view(), targets)
            };
            for event in &events {
                if let MemberEvent::Failed(m) = event {
                    warn!(peer = %m.name, "Member failed");
                }
            }
            self.publish(events);

            if targets.is_empty() {
                // Nobody known yet; keep knocking on the seeds.
                for seed in &self.seeds {
                    let msg = GossipMessage::Join {
                        member: local.clone(),
                    };
                    self.send(&msg, *seed).await;
                }
                continue;
            }

            let msg = GossipMessage::Sync { members };
            for target in targets {
                self.send(&msg, target).await;
            }
        }
    }
}

async fn dispatch_loop(
    local_name: String,
    mut events: mpsc::UnboundedReceiver<MemberEvent>,
    handler: Arc<dyn MembershipHandler>,
) {
    while let Some(event) = events.recv().await {
        match event {
            MemberEvent::Joined(member) => {
                if member.name == local_name {
                    continue;
                }
                let Some(rpc_addr) = member.tag(RPC_ADDR_TAG) else {
                    warn!(peer = %member.name, "Joined member has no {} tag", RPC_ADDR_TAG);
                    continue;
                };
                info!(peer = %member.name, addr = %rpc_addr, "Member joined");
                if let Err(e) = handler.join(&member.name, rpc_addr) {
                    error!(peer = %member.name, addr = %rpc_addr, "Failed to handle join: {}", e);
                }
            }
            MemberEvent::Left(member) | MemberEvent::Failed(member) => {
                if member.name == local_name {
                    continue;
                }
                info!(peer = %member.name, status = ?member.status, "Member left");
                if let Err(e) = handler.leave(&member.name) {
                    error!(peer = %member.name, "Failed to handle leave: {}", e);
                }
            }
        }
    }
    debug!("Membership event channel closed");
}

/// This node's membership in the gossip cluster.
pub struct Membership {
    state: Arc<GossipState>,
    local_addr: SocketAddr,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    left: AtomicBool,
}

impl Membership {
    /// Bind the gossip socket, start the gossip and dispatch tasks and ask
    /// the configured seeds to let this node in.
    pub async fn new(
        config: MembershipConfig,
        handler: Arc<dyn MembershipHandler>,
        span: Span,
    ) -> MembershipResult<Self> {
        let socket = UdpSocket::bind(config.bind_addr.as_str()).await?;
        let local_addr = socket.local_addr()?;

        let mut seeds = Vec::new();
        for addr in &config.start_join_addrs {
            let resolved = lookup_host(addr.as_str())
                .await
                .map_err(|_| MembershipError::InvalidAddress(addr.clone()))?;
            seeds.extend(resolved.filter(|a| *a != local_addr));
        }
        if !config.start_join_addrs.is_empty() && seeds.is_empty() {
            return Err(MembershipError::JoinFailed(format!(
                "no usable seed in {:?}",
                config.start_join_addrs
            )));
        }

        let incarnation = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        let local = Member {
            name: config.node_name.clone(),
            addr: local_addr,
            tags: config.tags.clone(),
            incarnation,
            heartbeat: 0,
            status: MemberStatus::Alive,
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(GossipState {
            config,
            socket,
            table: Mutex::new(MemberTable::new(local.clone())),
            seeds,
            events: Mutex::new(Some(events_tx)),
        });
        let token = CancellationToken::new();
        let gossip_span = info_span!(parent: &span, "membership", addr = %local_addr);

        let tasks = vec![
            tokio::spawn(
                state
                    .clone()
                    .receive_loop(token.clone())
                    .instrument(gossip_span.clone()),
            ),
            tokio::spawn(
                state
                    .clone()
                    .gossip_loop(token.clone())
                    .instrument(gossip_span.clone()),
            ),
            tokio::spawn(
                dispatch_loop(local.name.clone(), events_rx, handler).instrument(gossip_span),
            ),
        ];

        for seed in &state.seeds {
            state
                .send(
                    &GossipMessage::Join {
                        member: local.clone(),
                    },
                    *seed,
                )
                .await;
        }

        info!(
            "Membership started: node={}, addr={}, seeds={:?}",
            local.name, local_addr, state.seeds
        );

        Ok(Self {
            state,
            local_addr,
            token,
            tasks: Mutex::new(tasks),
            left: AtomicBool::new(false),
        })
    }

    /// Tell every alive peer this node is leaving, then stop gossiping.
    /// Later calls are no-ops.
    pub async fn leave(&self) -> MembershipResult<()> {
        if self.left.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (members, peers) = {
            let mut table = self.state.table.lock();
            table.leave_local();
            (table.gossip_view(), table.alive_peers())
        };
        let data = encode_message(&GossipMessage::Sync { members })?;
        for peer in peers {
            if let Err(e) = self.state.socket.send_to(&data, peer).await {
                warn!("Failed to send leave to {}: {}", peer, e);
            }
        }

        self.token.cancel();
        self.state.events.lock().take();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Membership task ended abnormally: {}", e);
            }
        }

        info!("Left cluster: node={}", self.state.config.node_name);
        Ok(())
    }

    /// Current view of the cluster, this node included, sorted by name.
    pub fn members(&self) -> Vec<Member> {
        self.state.table.lock().members()
    }

    pub fn member(&self, name: &str) -> Option<Member> {
        self.state.table.lock().get(name).cloned()
    }

    pub fn local_member(&self) -> Member {
        self.state.table.lock().local().clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.token.cancel();
        self.state.events.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gossip_message_encoding() {
        let member = Member {
            name: "node-1".to_string(),
            addr: SocketAddr::from(([127, 0, 0, 1], 8401)),
            tags: BTreeMap::from([(RPC_ADDR_TAG.to_string(), "127.0.0.1:8400".to_string())]),
            incarnation: 1_700_000_000_000,
            heartbeat: 12,
            status: MemberStatus::Alive,
        };
        let msg = GossipMessage::Sync {
            members: vec![member],
        };
        let data = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&data).unwrap(), msg);
        assert!(decode_message(&data[..data.len() / 2]).is_err());
    }

    #[test]
    fn test_default_config() {
        let config = MembershipConfig::default();
        assert_eq!(config.gossip_interval, Duration::from_millis(200));
        assert_eq!(config.failure_timeout, Duration::from_secs(3));
        assert_eq!(config.fanout, 3);
    }
}
