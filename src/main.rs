//! Bucket gateway - path-addressable buckets over cloud object stores
//!
//! This service exposes buckets backed by S3, GCS, Azure Blob, Cloudflare
//! R2, IBM COS or a local path as one filesystem-like HTTP API, with three
//! access modes (MOUNT, COPY, MOUNT_CACHED) trading latency against
//! consistency.

mod config;
mod errors;
mod gateway;
mod metrics;
mod policy;
mod registry;
mod resolver;
mod routes;
mod server;
mod storage;

use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::gateway::Gateway;
use crate::policy::PolicyEngine;
use crate::registry::Registry;
use crate::server::Server;
use crate::storage::ProviderFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment and optional config file
    let config = Config::from_env()?;

    // Initialize tracing with JSON output for structured logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Initialize Prometheus metrics
    crate::metrics::init_metrics()?;

    info!("Starting bucket gateway");
    info!(
        bind_address = %config.server.bind_address,
        cache_root = %config.cache.root.display(),
        persistent_registry = config.registry.database_url.is_some(),
        "Configuration loaded"
    );

    let registry = Registry::connect(&config.registry).await?;
    info!("Bucket registry initialized");

    let factory = ProviderFactory::new(
        config.providers.clone(),
        config.storage.managed_root.clone(),
    );
    let engine = PolicyEngine::new(factory, &config);
    let gateway = Arc::new(Gateway::new(registry, engine));

    // Create and start the HTTP server
    let server = Server::new(config.clone(), gateway.clone());

    // Handle graceful shutdown
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    info!("Server starting on {}", config.server.bind_address);
    if let Err(e) = server.start(shutdown_signal).await {
        error!(error = %e, "Server error");
        return Err(e);
    }

    gateway.engine().shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
