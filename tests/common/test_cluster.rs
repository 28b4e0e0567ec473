// test_cluster.rs
use std::time::Duration;

use replog::{Agent, AgentConfig, Log, MembershipConfig};
use tempfile::TempDir;
use tracing::info;

pub fn agent_config(name: &str, dir: &TempDir, seeds: Vec<String>) -> AgentConfig {
    AgentConfig {
        data_dir: dir.path().to_path_buf(),
        bind_addr: "127.0.0.1:0".to_string(),
        rpc_port: 0,
        node_name: name.to_string(),
        start_join_addrs: seeds,
        membership: MembershipConfig {
            gossip_interval: Duration::from_millis(100),
            ..MembershipConfig::default()
        },
        ..AgentConfig::default()
    }
}

/// Agents started in order; every agent after the first joins through the
/// first one's gossip address.
pub struct TestCluster {
    pub agents: Vec<Agent>,
    _dirs: Vec<TempDir>,
}

impl TestCluster {
    pub async fn start(names: &[&str]) -> Self {
        let mut agents: Vec<Agent> = Vec::new();
        let mut dirs = Vec::new();

        for name in names {
            let dir = TempDir::new().unwrap();
            let seeds = agents
                .first()
                .map(|a| vec![a.bind_addr().to_string()])
                .unwrap_or_default();
            let agent = Agent::new(agent_config(name, &dir, seeds)).await.unwrap();
            info!(
                "Started {}: rpc={}, gossip={}",
                name,
                agent.rpc_addr(),
                agent.bind_addr()
            );
            agents.push(agent);
            dirs.push(dir);
        }

        Self {
            agents,
            _dirs: dirs,
        }
    }

    pub fn agent(&self, name: &str) -> &Agent {
        self.agents
            .iter()
            .find(|a| a.config().node_name == name)
            .unwrap()
    }

    pub async fn shutdown(&self) {
        for agent in &self.agents {
            agent.shutdown().await.unwrap();
        }
    }
}

/// True if any retained record in `log` carries `value`. Scans newest first.
pub fn log_contains(log: &Log, value: &[u8]) -> bool {
    (log.lowest_offset()..=log.highest_offset())
        .rev()
        .filter_map(|offset| log.read(offset).ok())
        .any(|record| record.value == value)
}
