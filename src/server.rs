//! HTTP server wrapper around the bounded round-tripper.
//!
//! The server is deliberately thin: every query route funnels into the
//! round-tripper, which owns decoding, limiting, splitting, fan-out
//! and merging. The server adds metrics, error rendering and graceful
//! shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use tokio::signal;

use crate::error::{Error, Result};
use crate::metrics::{HttpLabels, HttpLabelsWithStatus, HttpMethod, Metrics};
use crate::roundtrip::BoundedRoundTripper;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub frontend: Arc<BoundedRoundTripper>,
    pub metrics: Arc<Metrics>,
}

/// HTTP server for the query frontend.
pub struct FrontendServer {
    state: AppState,
    port: u16,
}

impl FrontendServer {
    pub fn new(frontend: Arc<BoundedRoundTripper>, metrics: Arc<Metrics>, port: u16) -> Self {
        Self {
            state: AppState { frontend, metrics },
            port,
        }
    }

    /// Build the router; exposed separately so tests can drive it
    /// without binding a socket.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/loki/api/v1/query_range", get(handle_query))
            .route("/loki/api/v1/query", get(handle_query))
            .route("/loki/api/v1/series", get(handle_query))
            .route("/loki/api/v1/labels", get(handle_query))
            .route("/api/prom/query", get(handle_query))
            .route("/api/prom/query_range", get(handle_query))
            .route("/api/prom/label", get(handle_query))
            .route("/metrics", get(handle_metrics))
            .route("/-/healthy", get(handle_healthy))
            .route("/-/ready", get(handle_ready))
            .with_state(self.state.clone())
    }

    /// Run the HTTP server until SIGINT/SIGTERM.
    pub async fn run(self) {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let app = self.router();
        tracing::info!("Starting query frontend on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("failed to bind listener");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .expect("server failed");

        tracing::info!("Server shut down gracefully");
    }
}

/// Error wrapper rendering the taxonomy as prometheus-style JSON.
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_type = match &self.0 {
            Error::BadRequest(_) => "bad_data",
            Error::Upstream { .. } => "upstream",
            Error::Internal(_) => "internal",
            Error::Cancelled => "timeout",
        };

        let body = serde_json::json!({
            "status": "error",
            "errorType": error_type,
            "error": self.0.to_string(),
        });

        (self.0.status_code(), Json(body)).into_response()
    }
}

/// Forward a query request through the round-tripper, recording
/// request metrics around it.
async fn handle_query(State(state): State<AppState>, request: Request) -> Response {
    let started = Instant::now();
    let endpoint = request.uri().path().to_string();
    let method = HttpMethod::from(request.method());

    state.metrics.http_requests_in_flight.inc();
    let result = forward(&state, request).await;
    state.metrics.http_requests_in_flight.dec();

    state
        .metrics
        .http_request_duration_seconds
        .get_or_create(&HttpLabels {
            method: method.clone(),
            endpoint: endpoint.clone(),
        })
        .observe(started.elapsed().as_secs_f64());

    let response = match result {
        Ok(resp) => resp.map(Body::from),
        Err(err) => ApiError(err).into_response(),
    };

    state
        .metrics
        .http_requests_total
        .get_or_create(&HttpLabelsWithStatus {
            method,
            endpoint,
            status: response.status().as_u16(),
        })
        .inc();

    response
}

async fn forward(state: &AppState, request: Request) -> Result<axum::http::Response<Bytes>> {
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| Error::internal(format!("error reading request body: {}", e)))?;
    let request = axum::http::Request::from_parts(parts, body);
    state.frontend.round_trip(request).await
}

/// Handle GET /metrics
async fn handle_metrics(State(state): State<AppState>) -> String {
    state.metrics.encode()
}

/// Handle GET /-/healthy
async fn handle_healthy() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Handle GET /-/ready
async fn handle_ready(State(_state): State<AppState>) -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Listen for SIGTERM (pod termination) and SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
