//! StripeKV coordinator binary

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use coordinator::config::CoordinatorConfig;
use coordinator::worker::{CoordinatorContext, CoordinatorWorker};
use proto::tcp::TcpTransport;
use proto::PeerAddr;

#[derive(Parser, Debug)]
#[command(name = "stripekv-coordinator")]
#[command(about = "StripeKV coordinator - cluster control plane")]
struct Args {
    /// Listen address
    #[arg(short, long)]
    listen_addr: Option<String>,

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
        CoordinatorConfig::from_file(config_path)?
    } else {
        CoordinatorConfig::default()
    };
    if let Some(listen_addr) = &args.listen_addr {
        config.cluster.coordinator_addr = listen_addr.clone();
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
        listen_addr = %config.cluster.coordinator_addr,
        servers = config.cluster.servers.len(),
        "starting coordinator"
    );

    // Outbound routes to every known peer; inbound via the accept loop.
    let mut addrs = std::collections::HashMap::new();
    for server in &config.cluster.servers {
        addrs.insert(PeerAddr::Server(server.id), server.addr.clone());
    }
    for gateway in &config.cluster.gateways {
        addrs.insert(PeerAddr::Gateway(gateway.id), gateway.addr.clone());
    }
    let transport = Arc::new(TcpTransport::new(addrs));

    let (inbound_tx, inbound_rx) = mpsc::channel(proto::transport::PEER_CHANNEL_CAPACITY);
    let listen_addr = config.cluster.coordinator_addr.clone();
    let server = TcpTransport::serve(&listen_addr, inbound_tx).await?;

    let ctx = Arc::new(CoordinatorContext::new(config, transport));
    let worker = CoordinatorWorker::new(ctx);
    worker.run(inbound_rx).await;

    server.abort();
    Ok(())
}
