//! Muxgate CLI - connection-multiplexing gateway
//!
//! Runs either side of the gateway: an echo backend that serves virtual
//! connections, or a frontend that spreads clients over backend links.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::GatewayConfig;
use muxgate_backend::{BackendListener, VirtualConn};
use muxgate_frontend::{Frontend, Router};
use muxgate_transport::{Link, LinkId, MuxConfig, TcpLinkListener};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_BACKEND_LISTEN: &str = "0.0.0.0:7000";
const DEFAULT_FRONTEND_LISTEN: &str = "0.0.0.0:8000";

/// Muxgate - carry many client connections over a few backend links
#[derive(Parser, Debug)]
#[command(name = "muxgate")]
#[command(about = "Muxgate - carry many client connections over a few backend links")]
#[command(version)]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// YAML config file with listen address, backends and mux tuning
    #[arg(short, long, global = true, env = "MUXGATE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an echo backend: every virtual connection gets its payloads back
    Backend {
        /// Address to accept frontend links on
        #[arg(long, env = "MUXGATE_LISTEN")]
        listen: Option<String>,
    },

    /// Accept clients and spread them round-robin over backend links
    #[command(long_about = r#"
Accept client connections and multiplex them over one physical link per
backend. Clients are assigned to backends round-robin.

EXAMPLES:
  # Two backends
  muxgate frontend --listen 0.0.0.0:8000 \
    --backend 10.0.0.5:7000 --backend 10.0.0.6:7000

ENVIRONMENT VARIABLES:
  MUXGATE_LISTEN    Address to accept clients on
  MUXGATE_BACKENDS  Comma separated backend addresses
  MUXGATE_CONFIG    YAML config file
    "#)]
    Frontend {
        /// Address to accept clients on
        #[arg(long, env = "MUXGATE_LISTEN")]
        listen: Option<String>,

        /// Backend address (repeatable)
        #[arg(long = "backend", env = "MUXGATE_BACKENDS", value_delimiter = ',')]
        backends: Vec<String>,
    },
}

/// Setup logging; `--verbose` wins over `RUST_LOG`
fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Hand out backends in turn
fn round_robin() -> impl Router {
    let next = AtomicUsize::new(0);
    move |_: &Link, backends: &[LinkId]| {
        if backends.is_empty() {
            return None;
        }
        let turn = next.fetch_add(1, Ordering::Relaxed);
        Some(backends[turn % backends.len()])
    }
}

async fn echo(conn: VirtualConn) {
    let client_id = conn.id();
    debug!(client_id, "Echoing for {}", conn.remote_addr());

    loop {
        match conn.recv().await {
            Ok(Some(msg)) => {
                if let Err(e) = conn.send(msg).await {
                    debug!(client_id, "Echo failed: {}", e);
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(client_id, "Receive failed: {}", e);
                break;
            }
        }
    }

    conn.close();
}

async fn run_backend(listen: String, mux: MuxConfig) -> Result<()> {
    let server = TcpLinkListener::bind(listen.as_str(), mux.link.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;
    let listener = BackendListener::new(server, mux);
    info!("Echo backend listening on {}", listener.local_addr()?);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok(Some(conn)) => {
                    tokio::spawn(echo(conn));
                }
                Ok(None) => break,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    break;
                }
            },
        }
    }

    listener.close();
    info!("Muxgate backend stopped");
    Ok(())
}

async fn run_frontend(listen: String, backends: Vec<String>, mux: MuxConfig) -> Result<()> {
    if backends.is_empty() {
        anyhow::bail!("No backends configured; pass --backend or set MUXGATE_BACKENDS");
    }

    let server = TcpLinkListener::bind(listen.as_str(), mux.link.clone())
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;
    let frontend = Frontend::new(server, round_robin(), mux);

    for addr in &backends {
        let link_id = match frontend.add_backend(addr.as_str()).await {
            Ok(link_id) => link_id,
            Err(e) => {
                frontend.stop();
                return Err(e).with_context(|| format!("Failed to connect to backend {}", addr));
            }
        };
        info!(link_id, "Backend {} connected", addr);
    }

    info!("Frontend listening on {}", frontend.local_addr()?);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut health = tokio::time::interval(Duration::from_secs(1));

    let result = loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break Ok(());
            }
            _ = health.tick() => {
                if frontend.backends().is_empty() {
                    warn!("Every backend link is gone");
                    break Err(anyhow::anyhow!("All backends disconnected"));
                }
            }
        }
    };

    frontend.stop();
    info!("Muxgate frontend stopped");
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let file = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };

    match cli.command {
        Commands::Backend { listen } => {
            let listen = listen
                .or(file.listen)
                .unwrap_or_else(|| DEFAULT_BACKEND_LISTEN.to_string());
            run_backend(listen, file.mux).await
        }
        Commands::Frontend { listen, backends } => {
            let listen = listen
                .or(file.listen)
                .unwrap_or_else(|| DEFAULT_FRONTEND_LISTEN.to_string());
            let backends = if backends.is_empty() {
                file.backends
            } else {
                backends
            };
            run_frontend(listen, backends, file.mux).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxgate_transport::LinkConfig;

    #[test]
    fn test_cli_parses_frontend() {
        let cli = Cli::try_parse_from([
            "muxgate",
            "frontend",
            "--listen",
            "127.0.0.1:8000",
            "--backend",
            "10.0.0.5:7000,10.0.0.6:7000",
            "--backend",
            "10.0.0.7:7000",
            "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Frontend { listen, backends } => {
                assert_eq!(listen.as_deref(), Some("127.0.0.1:8000"));
                assert_eq!(backends, ["10.0.0.5:7000", "10.0.0.6:7000", "10.0.0.7:7000"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["muxgate"]).is_err());
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let router = round_robin();
        let (client, _peer) = Link::pair(&LinkConfig::default());

        let picks: Vec<_> = (0..4).map(|_| router.route(&client, &[3, 5])).collect();
        assert_eq!(picks, [Some(3), Some(5), Some(3), Some(5)]);
        assert_eq!(router.route(&client, &[]), None);
    }
}
