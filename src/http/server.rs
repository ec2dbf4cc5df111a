//! HTTP server implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{middleware, Json, Router};
use tracing::{error, info};

use super::middleware::admission_middleware;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::RateLimiter;

/// Build the service router with admission applied to every route,
/// including the fallback.
pub fn router(rate_limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .fallback(not_found_handler)
        .layer(middleware::from_fn_with_state(rate_limiter, admission_middleware))
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "success": false,
            "message": "Resource not found",
            "error_code": "NOT_FOUND"
        })),
    )
}

/// HTTP server hosting the admission layer.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The rate limiter instance
    rate_limiter: Arc<RateLimiter>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, rate_limiter: Arc<RateLimiter>) -> Self {
        Self { addr, rate_limiter }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TurnstileError::Server(format!("failed to bind {}: {}", self.addr, e))
        })?;

        info!(
            addr = %self.addr,
            "Starting HTTP server with request admission"
        );

        let app = router(self.rate_limiter);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}
