use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use leitstand::api::{self, AppState};
use leitstand::config::Config;
use leitstand::manager::ConnectionManager;
use leitstand::reaper;
use leitstand::session::SessionRegistry;

#[derive(Parser, Debug)]
#[command(name = "leitstand", about = "Dispatch status board server")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "LEITSTAND_BIND", default_value = "0.0.0.0:8000")]
    bind: SocketAddr,

    /// Path to the TOML config file.
    #[arg(long, env = "LEITSTAND_CONFIG", default_value = "leitstand.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "leitstand=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?
        .unwrap_or_default();

    // The config file's bind address wins over the CLI default.
    let bind = match &config.bind {
        Some(addr) => addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind address in config: {addr}"))?,
        None => args.bind,
    };

    let registry = SessionRegistry::new();
    let manager = ConnectionManager::new(registry, config.timeouts);

    let reaper_handle = reaper::spawn(
        manager.clone(),
        Duration::from_secs(config.timeouts.reap_interval_secs),
    );

    let app = api::router(AppState { manager });
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding to {bind}"))?;
    tracing::info!(%bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    reaper_handle.abort();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install shutdown handler");
        return;
    }
    tracing::info!("shutting down");
}
