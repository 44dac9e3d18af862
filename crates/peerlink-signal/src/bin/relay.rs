//! Peerlink development relay
//!
//! WebSocket relay implementing the signaling protocol, for local testing of
//! links without the production service.
//!
//! # Usage
//!
//! ```bash
//! # Defaults from the config file (or built-in defaults)
//! peerlink-relay
//!
//! # Explicit port and bind address
//! peerlink-relay --port 9000 --bind 127.0.0.1
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use peerlink_core::Config;
use peerlink_signal::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "peerlink-relay")]
#[command(about = "Peerlink development signaling relay")]
#[command(version)]
struct Args {
    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "PEERLINK_RELAY_PORT")]
    port: Option<u16>,

    /// Bind address (overrides the config file)
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    let mut relay = config.relay;
    if let Some(port) = args.port {
        relay.port = port;
    }
    if let Some(bind) = args.bind {
        relay.bind = bind;
    }

    let addr = SocketAddr::new(relay.bind, relay.port);

    info!("Starting Peerlink Relay");
    info!(
        "Room idle timeout {}s, max {} clients per room",
        relay.room_idle_timeout_secs, relay.max_clients_per_room
    );

    let server = RelayServer::new(&relay);
    server.serve(addr).await?;

    Ok(())
}
