//! Alembic server binary: HTTP control plane over the projection engine.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

mod config;
mod http;
mod service;

use config::Config;
use service::{KafkaRuntimeFactory, ProjectionService};

#[derive(Parser)]
#[command(name = "alembic")]
#[command(author, version, about = "Dynamic stream-projection engine", long_about = None)]
struct Cli {
    /// Optional path to a JSON configuration file.
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&config);
    config.validate().context("validating configuration")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port(),
        "starting alembic"
    );

    let service = Arc::new(ProjectionService::new(
        config.processor_config(),
        KafkaRuntimeFactory,
    ));

    let addr = format!("0.0.0.0:{}", config.port());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "http server listening");

    axum::serve(listener, http::router(service.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("http server")?;

    service.shutdown().await;
    info!("all projections stopped");
    Ok(())
}

fn init_logging(config: &Config) {
    let level = config.logging.level.as_deref().unwrap_or("info");
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    match config.logging.format.as_deref() {
        Some(format) if format.eq_ignore_ascii_case("text") => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .init();
        }
    }
}
