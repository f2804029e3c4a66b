//! Orchestrator HTTP surface: the canonical inbound endpoint plus the admin
//! API consumed by ingestion and automation operators.

pub mod admin;
pub mod conversation;
pub mod dedupe;
pub mod guardrails;
pub mod pipeline;
pub mod policy;
pub mod publish;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::error;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::error::AppError;
use crate::shared::models::InboundMessage;
use crate::shared::state::AppState;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/messages/inbound", post(handle_inbound))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(admin::configure())
}

pub fn correlation_id_from(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn handle_inbound(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(msg): Json<InboundMessage>,
) -> impl IntoResponse {
    let correlation_id = correlation_id_from(&headers);
    match pipeline::process_inbound(&state, msg, &correlation_id).await {
        Ok(ack) => (StatusCode::ACCEPTED, Json(ack)).into_response(),
        Err(e) => {
            if e.is_retryable() {
                error!("inbound pipeline transient failure: {}", e);
            }
            e.with_correlation(&correlation_id).into_response()
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = state.conn.get().is_ok();
    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if db_ok { "ok" } else { "degraded" },
            "component": "orchestrator",
        })),
    )
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.render().await
}
