//! Beacon Signal Server
//!
//! Lightweight WebSocket signaling relay for browser peers.
//!
//! # Usage
//!
//! ```bash
//! # Defaults (0.0.0.0:8080, upgrade path /ws)
//! beacon-signal
//!
//! # Explicit config file, overriding the port
//! beacon-signal --config /etc/beacon/config.toml --port 9000
//! ```

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use beacon_core::Config;
use beacon_signal::SignalServer;

#[derive(Parser, Debug)]
#[command(name = "beacon-signal")]
#[command(about = "Beacon signaling relay for WebRTC peers")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "BEACON_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "BEACON_PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long, env = "BEACON_BIND")]
    bind: Option<IpAddr>,

    /// Path that accepts WebSocket upgrades
    #[arg(long)]
    ws_path: Option<String>,

    /// Reply with an error message when a message cannot be routed
    #[arg(long)]
    notify_errors: bool,

    /// Close the older session when an identity reconnects
    #[arg(long)]
    close_displaced: bool,

    /// Log in JSON format
    #[arg(long)]
    json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(ws_path) = &self.ws_path {
            config.server.ws_path = ws_path.clone();
        }
        config.relay.notify_errors |= self.notify_errors;
        config.relay.close_displaced |= self.close_displaced;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(args.json.then(|| fmt::layer().json()))
        .with((!args.json).then(|| fmt::layer()))
        .with(filter)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load(),
    };
    args.apply(&mut config);

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let addr = config.server.listen_addr();
    info!("Starting Beacon Signal Server");
    info!(
        "WebSocket endpoint: ws://{}{}?id=<peer>",
        addr, config.server.ws_path
    );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let server = SignalServer::new(&config);
    server
        .serve_listener(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
