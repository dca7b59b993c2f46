//! User directory service.
//!
//! A small read-only directory of users and roles, served over HTTP and
//! hardened with a per-IP sliding-window rate limiter, per-dependency circuit
//! breakers and request-scoped batch loaders.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ request id ─▶ trace span ─▶ timeout ─▶ pipeline
//!                                                             │
//!                            ┌────────────────────────────────┤
//!                            ▼                                ▼
//!                   ┌─────────────────┐             ┌──────────────────┐
//!                   │  rate limiter   │             │ handlers         │
//!                   │  (sliding win.) │             │  + loader set    │
//!                   └────────┬────────┘             └────────┬─────────┘
//!                            ▼                                ▼
//!                   ┌─────────────────┐             ┌──────────────────┐
//!                   │ KV client       │             │ guarded directory│
//!                   │  + breaker      │             │  + breaker       │
//!                   └────────┬────────┘             └────────┬─────────┘
//!                            ▼                                ▼
//!                    redis / memory                  directory store
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;

use userdir::clock;
use userdir::config::load_or_default;
use userdir::http::HttpServer;
use userdir::lifecycle::{bootstrap, signals, Shutdown};
use userdir::observability::{logging, metrics};

#[derive(Debug, Parser)]
#[command(name = "userdir", version, about = "User directory service")]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(short, long, env = "USERDIR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_or_default(cli.config.as_deref())?;

    logging::init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "userdir starting");
    tracing::info!(
        environment = ?config.environment,
        bind_address = %config.listener.bind_address,
        kv_backend = ?config.kv.backend,
        request_timeout_secs = config.timeouts.request_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let shutdown = Shutdown::new();
    let grace = Duration::from_secs(config.timeouts.shutdown_grace_secs);
    let bind_address = config.listener.bind_address.clone();

    let services = bootstrap(config, clock::system(), &shutdown).await?;
    let kv = services.state.kv.clone();

    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    signals::spawn_signal_listener(shutdown.clone());

    let server = HttpServer::new(services.state);
    let result = server.run(listener, shutdown.subscribe()).await;

    // The server also stops on I/O errors; make sure background tasks follow.
    shutdown.trigger();
    shutdown.drain(services.background, grace).await;
    if let Err(e) = kv.close().await {
        tracing::warn!(error = %e, "KV close failed");
    }

    result?;
    tracing::info!("Shutdown complete");
    Ok(())
}
