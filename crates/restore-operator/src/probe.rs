//! HTTP endpoint behind the self-registered Service
//!
//! Every replica serves these routes on the self-service port, leading or
//! not, so probes and operators can reach any replica:
//!
//! - `GET /healthz` - liveness
//! - `GET /readyz` - readiness (independent of leadership)
//! - `GET /leader` - this replica's identity and whether it leads

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// State shared with the probe handlers
#[derive(Clone)]
pub struct ProbeState {
    identity: String,
    leading: Arc<AtomicBool>,
}

impl ProbeState {
    /// Create probe state reporting on the given leadership flag
    pub fn new(identity: impl Into<String>, leading: Arc<AtomicBool>) -> Self {
        Self {
            identity: identity.into(),
            leading,
        }
    }
}

/// Body of `GET /leader`
#[derive(Debug, Serialize)]
pub struct LeaderStatus {
    /// Holder identity of this replica
    pub identity: String,
    /// Whether this replica currently holds the lease
    pub leading: bool,
}

/// Build the probe router
pub fn probe_routes(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/leader", get(leader_status))
        .with_state(state)
}

async fn leader_status(State(state): State<ProbeState>) -> Json<LeaderStatus> {
    Json(LeaderStatus {
        identity: state.identity.clone(),
        leading: state.leading.load(Ordering::SeqCst),
    })
}

/// Bind the probe listener on all interfaces
pub async fn bind_probe_listener(port: u16) -> std::io::Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Probe server listening");
    Ok(listener)
}

/// Serve probes until `shutdown` is cancelled
pub async fn serve_probes(listener: TcpListener, router: Router, shutdown: CancellationToken) {
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        error!(error = %e, "Probe server error");
    }
}
