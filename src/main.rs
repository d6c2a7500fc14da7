//! streamgate - HTTP range-streaming gateway
//!
//! Main entry point: configuration, session pool startup, and the HTTP
//! server with its maintenance loop.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use streamgate::cli::{Cli, Commands};
use streamgate::http::{self, AppState};
use streamgate::ledger::Ledger;
use streamgate::maintenance;
use streamgate::pool::{Connector, SessionPool};
use streamgate::resolver::Resolver;
use streamgate::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;

    match cli.command {
        Commands::Serve { bind } => serve(config, bind).await,
    }
}

async fn serve(config: Config, bind: Option<String>) -> Result<()> {
    let connector = build_connector(&config)?;
    let pool = Arc::new(SessionPool::new(
        config.bin_channel,
        config.session_specs(),
        connector,
    ));
    let ledger = Arc::new(Ledger::new());

    // A failed primary start is fatal; secondaries come up best-effort.
    pool.start(&ledger).await?;
    info!(clients = pool.active_count(), "session pool online");

    let resolver = Arc::new(Resolver::new(pool.clone()));
    let maintenance_task = maintenance::spawn(pool.clone(), ledger.clone());

    let state = AppState {
        pool: pool.clone(),
        ledger,
        resolver,
        started_at: Instant::now(),
        doc_url: config.server.doc_url.clone(),
    };

    let addr = bind.unwrap_or_else(|| config.bind_address());
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "gateway listening");

    http::serve(state, listener, shutdown_signal()).await?;

    maintenance_task.abort();
    pool.shutdown().await;
    info!("gateway stopped");
    Ok(())
}

#[cfg(feature = "telegram")]
fn build_connector(config: &Config) -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(streamgate::upstream::telegram::TelegramConnector::new(config)))
}

#[cfg(not(feature = "telegram"))]
fn build_connector(_config: &Config) -> Result<Arc<dyn Connector>> {
    anyhow::bail!("built without the `telegram` feature; no upstream connector is available")
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    info!("shutdown signal received");
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "streamgate=debug,info" } else { "info" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
