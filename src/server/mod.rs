//! Local HTTP facade exposing the engine to the web UI.

mod routes;
mod state;
mod tasks;

pub use state::ServerState;
pub use tasks::{TaskRegistry, TaskSnapshot, TaskStatus};

use anyhow::{Context, Result};
use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(request).await;
    debug!(
        "{} {} -> {} ({}ms)",
        method,
        path,
        response.status(),
        start.elapsed().as_millis()
    );
    response
}

/// Serve the API on localhost until the shutdown token fires.
pub async fn run_server(state: ServerState, port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = routes::api_router()
        .layer(middleware::from_fn(log_requests))
        .with_state(state);

    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    Ok(())
}
