//! ECHTunnel client
//!
//! Opens TCP circuits through a WebSocket tunnel server, with the TLS layer
//! optionally protected by Encrypted Client Hello.
//!
//! - `connect` pipes stdin/stdout through a single tunnel
//! - `forward` exposes a local TCP port, one tunnel per accepted connection

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use echtunnel::config::Config;
use echtunnel::{forward_tcp, TunnelClient, TunnelConfig};

#[derive(Parser, Debug)]
#[command(name = "echtunnel")]
#[command(author, version, about = "Reach TCP targets through an ECH-protected WebSocket tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tunnel server hostname
    #[arg(short, long, global = true, env = "ECHTUNNEL_SERVER")]
    server: Option<String>,

    /// Tunnel server port
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Auth token
    #[arg(short = 'k', long, global = true, env = "ECHTUNNEL_TOKEN")]
    token: Option<String>,

    /// WebSocket path on the server
    #[arg(long, global = true)]
    path: Option<String>,

    /// Skip server certificate verification
    #[arg(long, global = true)]
    insecure: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dial one tunnel and pipe stdin/stdout through it
    Connect {
        /// Destination as host:port
        target: String,
    },

    /// Forward a local TCP port through the tunnel
    Forward {
        /// Local address to listen on
        #[arg(short, long, default_value = "127.0.0.1:1080")]
        listen: SocketAddr,

        /// Destination as host:port
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    init_logging(cli.verbose, config.log.level.as_deref());

    let mut options = config.tunnel;
    if let Some(server) = cli.server {
        options.server = Some(server);
    }
    if let Some(port) = cli.port {
        options.port = Some(port);
    }
    if let Some(token) = cli.token {
        options.token = Some(token);
    }
    if let Some(path) = cli.path {
        options.ws_path = Some(path);
    }
    if cli.insecure {
        options.skip_cert_verify = true;
    }

    let tunnel_config = TunnelConfig::try_from(options).with_context(|| {
        format!(
            "Invalid tunnel settings. Use --server, set ECHTUNNEL_SERVER, \
             or edit the config file at {:?}",
            Config::config_path().unwrap_or_default()
        )
    })?;
    let client = Arc::new(TunnelClient::new(tunnel_config));

    match cli.command {
        Commands::Connect { target } => run_connect(&client, &target).await,
        Commands::Forward { listen, target } => run_forward(client, listen, target).await,
    }
}

async fn run_connect(client: &TunnelClient, target: &str) -> Result<()> {
    let conn = client
        .dial(target)
        .await
        .with_context(|| format!("Failed to open tunnel to {}", target))?;
    debug!(local = %conn.local_addr(), peer = %conn.peer_addr(), "connected");

    let (mut rd, mut wr) = tokio::io::split(conn);
    let upstream = tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        tokio::io::copy(&mut stdin, &mut wr).await?;
        wr.shutdown().await
    });

    // The server closing the circuit ends the session even if stdin is open.
    let mut stdout = tokio::io::stdout();
    let copied = tokio::io::copy(&mut rd, &mut stdout).await;
    stdout.flush().await?;

    if upstream.is_finished() {
        upstream.await?.context("Tunnel write failed")?;
    } else {
        upstream.abort();
    }
    copied.context("Tunnel read failed")?;
    Ok(())
}

async fn run_forward(client: Arc<TunnelClient>, listen: SocketAddr, target: String) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;

    let shutdown = CancellationToken::new();
    let forwarder = tokio::spawn(forward_tcp(client.clone(), listener, target, shutdown.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("shutting down");
    shutdown.cancel();
    client.close()?;

    forwarder.await?.context("Forwarder failed")?;
    Ok(())
}

fn init_logging(verbose: bool, level: Option<&str>) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")))
    };

    // stdout carries tunnel payload in `connect` mode
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
