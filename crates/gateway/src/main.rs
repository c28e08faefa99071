//! StripeKV gateway binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use gateway::config::GatewayConfig;
use gateway::context::ServiceContext;
use gateway::server::GatewayServer;
use proto::tcp::TcpTransport;
use proto::PeerAddr;

#[derive(Parser, Debug)]
#[command(name = "stripekv-gateway")]
#[command(about = "StripeKV gateway - application-facing request router")]
struct Args {
    /// Gateway instance id
    #[arg(short, long)]
    instance_id: Option<u16>,

    /// Application listen address
    #[arg(short, long)]
    listen_addr: Option<String>,

    /// Peer listen address (coordinator and server traffic)
    #[arg(short, long)]
    peer_addr: Option<String>,

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
        GatewayConfig::from_file(config_path)?
    } else {
        GatewayConfig::default()
    };
    if let Some(instance_id) = args.instance_id {
        config.gateway.instance_id = instance_id;
    }
    if let Some(listen_addr) = &args.listen_addr {
        config.gateway.listen_addr = listen_addr.clone();
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

    info!(
        instance_id = config.gateway.instance_id,
        listen_addr = %config.gateway.listen_addr,
        "starting gateway"
    );

    let mut addrs = std::collections::HashMap::new();
    addrs.insert(
        PeerAddr::Coordinator,
        config.cluster.coordinator_addr.clone(),
    );
    for server in &config.cluster.servers {
        addrs.insert(PeerAddr::Server(server.id), server.addr.clone());
    }
    let transport = Arc::new(TcpTransport::new(addrs));

    // Peer traffic comes in on this gateway's entry in the cluster list.
    let peer_addr = args.peer_addr.clone().or_else(|| {
        config
            .cluster
            .gateways
            .iter()
            .find(|g| g.id == config.gateway.instance_id)
            .map(|g| g.addr.clone())
    });

    let ctx = Arc::new(ServiceContext::new(config, transport));
    let (server, _workers) = GatewayServer::start(ctx);

    if let Some(peer_addr) = peer_addr {
        let (inbound_tx, inbound_rx) = mpsc::channel(proto::transport::PEER_CHANNEL_CAPACITY);
        TcpTransport::serve(&peer_addr, inbound_tx).await?;
        server.spawn_peer_pump(inbound_rx);
    }

    server.register_with_coordinator().await;
    let accept = server.serve_apps().await?;
    accept.await?;
    Ok(())
}
