// flowgate - REST server
// Run with: cargo run --bin server -- --port 4000

//! # flowgate Server Binary
//!
//! Starts the engine runtime (event, child-schema and timer worker pools)
//! and serves the REST API on top of it.
//!
//! ```text
//! main()
//!   ↓ loads
//! .env → AppConfig (defaults, file, FLOWGATE__* env, CLI flags)
//!   ↓ builds
//! EngineRuntime (InMemoryStorage + messaging)
//!   ↓ shared with
//! ApiServer (axum)
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Graceful Shutdown
//! `axum::Server::with_graceful_shutdown` takes a future; when it resolves
//! (Ctrl+C here) the server stops accepting connections and finishes the
//! in-flight requests. The runtime is then drained so queued events and
//! child triggers are not lost.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use flowgate::{
    ApiServerBuilder, AppConfig, EngineRuntime, InMemoryStorage, LoggingMessagingService,
    MessagingService, WebhookMessagingService,
};

#[derive(Parser)]
#[command(name = "flowgate-server")]
#[command(about = "Multi-tenant workflow and rules engine")]
#[command(version)]
struct Cli {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long, env = "FLOWGATE_CONFIG")]
    config: Option<String>,

    /// Bind host, overrides the configuration
    #[arg(long, env = "FLOWGATE_HOST")]
    host: Option<String>,

    /// Bind port, overrides the configuration
    #[arg(short, long, env = "FLOWGATE_PORT")]
    port: Option<u16>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(config: &AppConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if json || config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn messaging(config: &AppConfig) -> anyhow::Result<Arc<dyn MessagingService>> {
    match &config.messaging.webhook_url {
        Some(url) => {
            let timeout = Duration::from_secs(config.messaging.request_timeout_secs);
            info!(url = %url, "Outbound messages go to webhook");
            Ok(Arc::new(WebhookMessagingService::new(url.clone(), timeout)?))
        }
        None => {
            warn!("No messaging.webhook_url configured, outbound messages are only logged");
            Ok(Arc::new(LoggingMessagingService::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let dotenv_result = dotenv();
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_tracing(&config, cli.json_logs);
    if let Err(e) = dotenv_result {
        info!("No .env file loaded: {}", e);
    }

    info!("🚀 Starting flowgate server");
    info!(
        bind = %config.bind_address(),
        event_concurrency = config.queues.event_concurrency,
        timer_concurrency = config.queues.timer_concurrency,
        child_concurrency = config.queues.child_concurrency,
        "Configuration loaded"
    );

    let runtime = Arc::new(EngineRuntime::start(
        Arc::new(InMemoryStorage::new()),
        &config,
        messaging(&config)?,
    ));

    let server = ApiServerBuilder::new()
        .with_config(config.server.clone())
        .with_runtime(runtime.clone())
        .build()?;
    server.run(shutdown_signal()).await?;

    runtime.shutdown().await;
    info!("flowgate server stopped");
    Ok(())
}
