//! replog - a node of the replicated commit log.

use std::path::PathBuf;

use clap::Parser;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use replog::{Agent, AgentConfig, LogConfig, SegmentConfig};

#[derive(Parser, Debug)]
#[command(name = "replog")]
#[command(about = "Replicated append-only commit log node")]
struct Args {
    /// Unique node name within the cluster
    #[arg(short, long, default_value = "node-1")]
    node_name: String,

    /// Gossip bind address
    #[arg(short, long, default_value = "127.0.0.1:8401")]
    bind_addr: String,

    /// Log server port, on the gossip host
    #[arg(short, long, default_value = "8400")]
    rpc_port: u16,

    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Gossip addresses of existing members
    #[arg(long)]
    start_join_addrs: Vec<String>,

    /// Store size that triggers segment rotation (0 = default)
    #[arg(long, default_value = "0")]
    max_store_bytes: u64,

    /// Index size that triggers segment rotation (0 = default)
    #[arg(long, default_value = "0")]
    max_index_bytes: u64,

    /// First offset of a brand-new log
    #[arg(long, default_value = "0")]
    initial_offset: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = AgentConfig {
        data_dir: args.data_dir,
        bind_addr: args.bind_addr,
        rpc_port: args.rpc_port,
        node_name: args.node_name,
        start_join_addrs: args.start_join_addrs,
        log: LogConfig {
            segment: SegmentConfig {
                max_store_bytes: args.max_store_bytes,
                max_index_bytes: args.max_index_bytes,
                initial_offset: args.initial_offset,
            },
        },
        ..AgentConfig::default()
    };

    let agent = Agent::new(config).await?;
    info!(
        "Node ready: rpc_addr={}, gossip_addr={}",
        agent.rpc_addr(),
        agent.bind_addr()
    );

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");
    agent.shutdown().await?;

    Ok(())
}
