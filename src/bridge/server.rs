//! HTTP surface of the query bridge.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{AskRequest, AskResponse, Health, QuerySessionBridge};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionRequest {
    pub call_id: String,
}

pub fn router(bridge: Arc<QuerySessionBridge>) -> Router {
    Router::new()
        .route("/ask", post(ask))
        .route("/end-session", post(end_session))
        .route("/health", get(health))
        .with_state(bridge)
}

async fn ask(
    State(bridge): State<Arc<QuerySessionBridge>>,
    Json(req): Json<AskRequest>,
) -> Json<AskResponse> {
    tracing::debug!(
        "POST /ask (call {})",
        req.call_id.as_deref().unwrap_or("-")
    );
    Json(bridge.ask(&req).await)
}

async fn end_session(
    State(bridge): State<Arc<QuerySessionBridge>>,
    Json(req): Json<EndSessionRequest>,
) -> Json<serde_json::Value> {
    bridge.end_session(&req.call_id);
    Json(serde_json::json!({ "success": true }))
}

async fn health(State(bridge): State<Arc<QuerySessionBridge>>) -> Json<Health> {
    Json(bridge.health())
}

/// Serve the bridge until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    bridge: Arc<QuerySessionBridge>,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(
        "Query bridge listening on {}",
        listener.local_addr().context("Bridge listener has no address")?
    );
    axum::serve(listener, router(bridge))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Query bridge server failed")
}
