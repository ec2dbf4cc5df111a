use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::http::HttpServer;
use turnstile::ratelimit::{RateLimiter, SystemClock};

/// Sliding-window request admission service.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen address from configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(true);
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Turnstile Request Admission Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(listen_addr = %config.server.listen_addr, "Configuration loaded");

    let rate_limiter = Arc::new(RateLimiter::from_config(&config, Arc::new(SystemClock::new()))?);
    info!(resolver = ?rate_limiter.resolver(), "Rate limiter initialized");

    let sweeper = rate_limiter
        .sweeper(
            config.rate_limiting.sweep_interval(),
            config.rate_limiting.idle_retention(),
        )
        .spawn();

    let server = HttpServer::new(config.server.listen_addr, Arc::clone(&rate_limiter));

    // Run the server with graceful shutdown on Ctrl+C
    let result = server.serve_with_shutdown(shutdown_signal()).await;
    sweeper.shutdown();
    result?;

    info!("Turnstile Request Admission Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
