use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::{handlers, AppState};
use crate::config::Config;
use crate::error::{GenieError, Result};
use crate::ingest::Orchestrator;

/// Check if a port is available by attempting to bind to it
async fn check_port_available(port: u16) -> bool {
    tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await.is_ok()
}

/// Build the router over `state`
pub fn build_router(state: AppState, allowed_origins: &[String], max_body_bytes: usize) -> Router {
    // No configured origins means local development: allow any.
    let cors = if allowed_origins.is_empty() {
        CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/process-invoice", post(handlers::process_web))
        .route("/api/mobile/process-invoice", post(handlers::process_mobile))
        .route("/api/invoices", post(handlers::create_invoice).get(handlers::list_invoices))
        .route("/api/invoices/:id", get(handlers::get_invoice))
        .route("/api/invoices/:id/extracted", put(handlers::review_extracted))
        .route("/api/invoices/:id/retry", post(handlers::retry_invoice))
        .route("/api/usage", get(handlers::usage))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(max_body_bytes)),
        )
        .with_state(state)
}

/// HTTP API server
pub struct ApiServer {
    state: AppState,
    allowed_origins: Vec<String>,
    max_body_bytes: usize,
}

impl ApiServer {
    pub fn new(config: &Config, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            state: AppState::new(orchestrator, &config.server.session_cookie),
            allowed_origins: config.server.allowed_origins.clone(),
            max_body_bytes: config.server.max_body_bytes,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone(), &self.allowed_origins, self.max_body_bytes)
    }

    /// Run the HTTP server
    pub async fn run(&self, port: u16) -> Result<()> {
        let app = self.router();

        let addr = format!("127.0.0.1:{}", port);
        log::info!("Starting Invoice Genie API on http://{}", addr);

        if !check_port_available(port).await {
            return Err(GenieError::Config(format!(
                "Port {} is already in use. Stop the other process or set server.port in config.toml",
                port
            )));
        }

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            GenieError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("Failed to bind to {}: {}", addr, e),
            ))
        })?;

        axum::serve(listener, app)
            .await
            .map_err(|e| GenieError::Io(std::io::Error::new(std::io::ErrorKind::Other, format!("HTTP server error: {}", e))))?;

        Ok(())
    }
}
