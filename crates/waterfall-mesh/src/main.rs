//! waterfall-mesh — a demonstration node for the unstructured peer-to-peer
//! mesh socket.
//!
//! # Usage
//!
//! ```bash
//! waterfall-mesh                          # bind and wait for peers
//! waterfall-mesh --port 9876              # bind to a specific TCP port
//! waterfall-mesh --connect 10.0.0.5:9876  # also dial a seed peer
//! ```
//!
//! On first run, a config file is created with a fresh bind configuration.
//! The node then prints every message it receives to stdout and replies
//! with an acknowledgement.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use waterfall_core::config::NodeConfig;
use waterfall_mesh::{MeshSocket, PlaintextTransport};

/// waterfall-mesh — unstructured peer-to-peer mesh node.
#[derive(Parser, Debug)]
#[command(name = "waterfall-mesh", about = "Unstructured peer-to-peer mesh socket node")]
struct Cli {
    /// TCP port to bind for peer connections (0 = auto-assign).
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Address to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Seed peer to dial on startup, as `host:port`. May be repeated.
    #[arg(long = "connect")]
    connect: Vec<SocketAddr>,

    /// Path to the configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => NodeConfig::config_file_path().context("could not determine config directory")?,
    };

    let mut config = match NodeConfig::load_from(&config_path)? {
        Some(config) => {
            info!(path = %config_path.display(), "loaded config");
            config
        }
        None => {
            info!("first run detected, creating new config");
            let config = NodeConfig::new_first_run();
            config.save_to(&config_path)?;
            info!(path = %config_path.display(), "saved new config");
            config
        }
    };

    if cli.port != 0 {
        config.bind_port = cli.port;
    }
    config.bind_addr = cli.bind.clone();

    let transport = Arc::new(PlaintextTransport);
    let socket = MeshSocket::bind(config, transport)
        .await
        .context("failed to bind mesh socket")?;

    info!(node_id = %socket.node_id(), addr = ?socket.outward_addr(), "node is running");

    for peer_addr in &cli.connect {
        match socket.connect(&peer_addr.ip().to_string(), peer_addr.port()).await {
            Ok(true) => info!(peer = %peer_addr, "dialed seed peer"),
            Ok(false) => info!(peer = %peer_addr, "seed peer already routed or self"),
            Err(e) => error!(peer = %peer_addr, error = %e, "failed to dial seed peer"),
        }
    }

    let recv_socket = socket.clone();
    let recv_task = tokio::spawn(async move {
        loop {
            if let Some(msg) = recv_socket.recv_wait(std::time::Duration::from_secs(3600)).await {
                info!(
                    sender = %msg.sender,
                    id = %msg.id,
                    body_packets = msg.body().len(),
                    "message received"
                );
                recv_socket.reply(&msg, vec![b"ack".to_vec()]).await;
            }
        }
    });

    info!("node is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    info!("shutting down...");

    recv_task.abort();
    socket.close().ok();
    info!("node stopped");
    Ok(())
}

/// Initializes the tracing logging infrastructure.
///
/// Sets up a layered subscriber that writes to:
/// 1. stderr — so logs appear in the terminal when running interactively
/// 2. A log file at the platform data directory — persists across runs
///
/// The log level is controlled by the `WATERFALL_LOG` environment variable.
/// Defaults to `info` if not set.
fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_env("WATERFALL_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let file_layer = NodeConfig::data_dir()
        .and_then(|dir| {
            std::fs::create_dir_all(&dir).ok()?;
            let log_path = dir.join("node.log");
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .ok()
        })
        .map(|file| fmt::layer().with_writer(std::sync::Mutex::new(file)).with_ansi(false));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}
