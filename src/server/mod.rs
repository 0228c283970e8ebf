//! HTTP server implementation
//!
//! Sets up the Axum HTTP server with:
//! - Gateway API routes
//! - Middleware (tracing, request metrics, timeout, compression, body limit)
//! - Graceful shutdown

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Request},
    middleware::{self, Next},
    response::Response,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::info;

use crate::config::Config;
use crate::gateway::Gateway;
use crate::metrics::{HTTP_REQUESTS, HTTP_REQUEST_DURATION};
use crate::routes;

/// HTTP server for the gateway
pub struct Server {
    config: Config,
    gateway: Arc<Gateway>,
}

impl Server {
    pub fn new(config: Config, gateway: Arc<Gateway>) -> Self {
        Self { config, gateway }
    }

    /// Build the Axum router with all middleware
    fn build_router(&self) -> Router {
        routes::create_router(self.gateway.clone())
            .layer(DefaultBodyLimit::max(self.config.server.max_body_size))
            .layer(middleware::from_fn(track_metrics))
            .layer(
                ServiceBuilder::new()
                    // Add request tracing
                    .layer(TraceLayer::new_for_http())
                    // Add timeout
                    .layer(TimeoutLayer::new(Duration::from_secs(
                        self.config.server.timeout_secs,
                    )))
                    // Add compression
                    .layer(CompressionLayer::new())
                    // The console calls from the browser
                    .layer(CorsLayer::permissive())
                    .into_inner(),
            )
    }

    /// Start the server and run until shutdown signal
    pub async fn start<F>(&self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.config.server.bind_address).await?;
        info!(address = %self.config.server.bind_address, "Server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Count and time every request
async fn track_metrics(request: Request<Body>, next: Next) -> Response {
    let method = request.method().to_string();
    let timer = HTTP_REQUEST_DURATION.start_timer();
    let response = next.run(request).await;
    timer.observe_duration();
    HTTP_REQUESTS
        .with_label_values(&[method.as_str(), response.status().as_str()])
        .inc();
    response
}
