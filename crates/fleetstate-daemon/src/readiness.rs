//! HTTP readiness endpoint.
//!
//! Exposes the single piece of state the core shares with the outside
//! world: whether this process is leader and migrations are done. Load
//! balancers and serving layers poll `GET /ready` and gate traffic on it.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Builds the readiness router over the control plane's readiness signal.
#[must_use]
pub fn router(readiness: watch::Receiver<bool>) -> Router {
    Router::new().route("/ready", get(ready)).with_state(readiness)
}

async fn ready(State(readiness): State<watch::Receiver<bool>>) -> (StatusCode, &'static str) {
    if *readiness.borrow() {
        (StatusCode::OK, "ok\n")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready\n")
    }
}

/// Serves the readiness endpoint until the shutdown signal fires.
///
/// # Errors
///
/// Returns the underlying I/O error if serving fails.
pub async fn serve(
    listener: TcpListener,
    readiness: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(readiness))
        .with_graceful_shutdown(async move {
            // Either the signal fires or the daemon is tearing down and
            // dropped the sender; stop serving in both cases.
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}
