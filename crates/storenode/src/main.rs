//! StripeKV storage server binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use proto::tcp::TcpTransport;
use proto::PeerAddr;
use storenode::config::StoreNodeConfig;
use storenode::worker::{StoreNodeContext, StoreNodeWorker};

#[derive(Parser, Debug)]
#[command(name = "stripekv-server")]
#[command(about = "StripeKV storage server - chunked key-value store")]
struct Args {
    /// This server's slot id in the cluster server list
    #[arg(short, long)]
    server_id: Option<u16>,

    /// Log level
    #[arg(long, default_value = "")]
    log_level: String,

    /// Configuration file path (YAML format)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        StoreNodeConfig::from_file(config_path)?
    } else {
        StoreNodeConfig::default()
    };
    if let Some(server_id) = args.server_id {
        config.server.server_id = server_id;
    }
    if !args.log_level.is_empty() {
        config.log.level = args.log_level.clone();
    }

    let level = match config.log.level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let listen_addr = config
        .cluster
        .servers
        .iter()
        .find(|s| s.id == config.server.server_id)
        .map(|s| s.addr.clone())
        .ok_or_else(|| anyhow!("server id missing from cluster server list"))?;

    info!(
        server_id = config.server.server_id,
        listen_addr = %listen_addr,
        "starting storage server"
    );

    let mut addrs = std::collections::HashMap::new();
    addrs.insert(
        PeerAddr::Coordinator,
        config.cluster.coordinator_addr.clone(),
    );
    for server in &config.cluster.servers {
        addrs.insert(PeerAddr::Server(server.id), server.addr.clone());
    }
    for gateway in &config.cluster.gateways {
        addrs.insert(PeerAddr::Gateway(gateway.id), gateway.addr.clone());
    }
    let transport = Arc::new(TcpTransport::new(addrs));

    let (inbound_tx, inbound_rx) = mpsc::channel(proto::transport::PEER_CHANNEL_CAPACITY);
    let accept = TcpTransport::serve(&listen_addr, inbound_tx).await?;

    let ctx = Arc::new(StoreNodeContext::new(config, transport)?);
    let worker = StoreNodeWorker::new(ctx);
    worker.register().await;
    worker.run(inbound_rx).await;

    accept.abort();
    Ok(())
}
