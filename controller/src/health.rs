use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tracing::{debug, info};

/// Liveness endpoint used by the orchestrator's probe (§6). Returns success unconditionally once
/// the gRPC listener is up; this process has nothing else worth gating readiness on, since a
/// non-leader replica is still a healthy replica.
pub async fn serve(listen_addr: SocketAddr, is_leader: Arc<AtomicBool>) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/leader", get(leader_status))
        .with_state(is_leader);

    info!(%listen_addr, "liveness endpoint listening");
    axum::Server::bind(&listen_addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

async fn healthz() -> StatusCode {
    debug!("received liveness probe");
    StatusCode::OK
}

async fn leader_status(State(is_leader): State<Arc<AtomicBool>>) -> &'static str {
    if is_leader.load(Ordering::Relaxed) {
        "leader"
    } else {
        "follower"
    }
}
