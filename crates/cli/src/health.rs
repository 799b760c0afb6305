//! Liveness endpoint: `GET /healthz` answers with the build version and the
//! agent's current phase.

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use rudder_agent::Phase;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Serialize)]
struct Healthz {
    version: &'static str,
    phase: &'static str,
}

pub fn router(phase: watch::Receiver<Phase>) -> Router {
    Router::new().route("/healthz", get(healthz)).with_state(phase)
}

async fn healthz(State(phase): State<watch::Receiver<Phase>>) -> Json<Healthz> {
    let current = *phase.borrow();
    Json(Healthz { version: env!("CARGO_PKG_VERSION"), phase: current.as_str() })
}

pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// Bind and serve in the background. A bind failure is logged; the agent keeps running.
pub fn spawn(addr: SocketAddr, phase: watch::Receiver<Phase>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %addr, error = %e, "cannot bind health listener");
                return;
            }
        };
        info!(addr = %addr, "health endpoint listening on /healthz");
        if let Err(e) = serve(listener, router(phase), cancel).await {
            error!(addr = %addr, error = %e, "health endpoint failed");
        }
    });
}
