//! Request logging middleware.
//!
//! The admin surface is low-traffic, so every completed request gets one
//! structured line. Health probes and the WebSocket upgrade are exempt:
//! probes are noise, and a session logs its own connect and disconnect.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Admin handlers are in-memory lookups; anything slower than this is
/// worth a warning even when it succeeds.
const SLOW_REQUEST: Duration = Duration::from_millis(250);

pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if matches!(path.as_str(), "/health" | "/ws") {
        return next.run(request).await;
    }

    let started = Instant::now();
    let response = next.run(request).await;
    let elapsed = started.elapsed();
    let status = response.status();

    if status.is_server_error() {
        error!(
            %method,
            path,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "admin request errored"
        );
    } else if status.is_client_error() {
        warn!(
            %method,
            path,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "admin request rejected"
        );
    } else if elapsed >= SLOW_REQUEST {
        warn!(
            %method,
            path,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "admin request slow"
        );
    } else {
        info!(
            %method,
            path,
            status = status.as_u16(),
            elapsed_ms = elapsed.as_millis() as u64,
            "admin request served"
        );
    }

    response
}
