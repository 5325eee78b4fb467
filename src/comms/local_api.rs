use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::comms::edge_gate::{authorize_request, EdgeGate};
use crate::comms::proxy::Upstream;

type SharedState = Arc<AppState>;

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<EdgeGate>,
    pub upstream: Upstream,
}

impl AppState {
    pub fn new(gate: Arc<EdgeGate>, upstream: Upstream) -> Self {
        Self { gate, upstream }
    }
}

// Health check
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn forward(State(state): State<SharedState>, req: Request) -> Response {
    state.upstream.forward(req).await
}

/// Every request passes the gate; whatever is not served locally goes upstream.
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .fallback(forward)
        .layer(middleware::from_fn_with_state(
            state.gate.clone(),
            authorize_request,
        ))
        .with_state(state)
}

pub async fn serve(gate: Arc<EdgeGate>, upstream: Upstream, port: u16) -> Result<()> {
    let state = Arc::new(AppState::new(gate, upstream));
    let app = create_router(state).into_make_service_with_connect_info::<SocketAddr>();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Edge gate listening on {}", addr);
    axum::serve(listener, app).into_future().await?;
    Ok(())
}
