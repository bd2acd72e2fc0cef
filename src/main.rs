use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use veilring::{Node, OverlayConfig, TcpTransport};

#[derive(Parser, Debug)]
#[command(name = "veilring")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Address of an existing ring member to join through. Repeatable;
    /// tried in order until one succeeds.
    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<String>,

    /// Name attached to outbound broadcasts.
    #[arg(short, long, default_value = "anonymous")]
    name: String,

    /// Seconds between ring status log lines.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let config = OverlayConfig {
        client_name: args.name.clone(),
        ..OverlayConfig::default()
    };
    let transport = Arc::new(TcpTransport::new(args.bind.clone()));
    let node = Node::bind(transport, config).await?;
    info!("Node {} listening on {}", node.node_id(), node.onion_host());

    for addr in &args.bootstrap {
        info!("Joining ring through {addr}");
        match node.join(addr).await {
            Ok(()) => {
                info!("Join complete");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Join through {addr} failed");
            }
        }
    }

    let Some(mut messages) = node.messages().await else {
        anyhow::bail!("message stream already taken");
    };
    let mut interval = time::interval(Duration::from_secs(args.status_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(message) = messages.recv() => {
                info!(from = %message.username, "{}", message.body);
            }
            _ = interval.tick() => {
                let successor = node.successor().await?;
                let predecessor = node.predecessor().await?;
                let fingers = node.finger_table().await?.len();
                let peers = node.peers().await.len();
                info!(
                    successor = %successor.id,
                    predecessor = ?predecessor.map(|p| p.id.to_hex()),
                    fingers,
                    peers,
                    "ring status"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
