//! Channel gateway, inbound side: provider webhook termination.
//!
//! Verifies signatures against the channel's rotation-aware secret set,
//! normalizes provider payloads to the canonical inbound message, and
//! forwards to the orchestrator with the correlation id preserved. The
//! provider gets its 202 as soon as the event is accepted or buffered.

pub mod adapters;
pub mod forwarder;
pub mod outbound;
pub mod providers;
pub mod signature;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Json, Router};
use diesel::prelude::*;
use log::{info, warn};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::orchestrator::correlation_id_from;
use crate::shared::audit::record_audit_best_effort;
use crate::shared::error::{AppError, AppResult};
use crate::shared::models::{channels, Channel, ChannelType};
use crate::shared::state::AppState;

use forwarder::InboundForwarder;

pub fn configure(forwarder: Arc<InboundForwarder>) -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/webhooks/:channel",
            get(handshake).post(handle_webhook),
        )
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(Extension(forwarder))
}

#[derive(Debug, Deserialize)]
pub struct HandshakeQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Subscription handshake: echo the challenge verbatim.
async fn handshake(
    Path(channel): Path<String>,
    Query(query): Query<HandshakeQuery>,
) -> impl IntoResponse {
    if ChannelType::from_str(&channel).is_none() {
        return (StatusCode::NOT_FOUND, String::new());
    }
    if let Some(ref mode) = query.mode {
        if mode != "subscribe" {
            return (StatusCode::FORBIDDEN, "invalid mode".to_string());
        }
    }
    match query.challenge {
        Some(challenge) => {
            info!("webhook handshake for {}", channel);
            (StatusCode::OK, challenge)
        }
        None => (StatusCode::BAD_REQUEST, "missing hub.challenge".to_string()),
    }
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Extension(forwarder): Extension<Arc<InboundForwarder>>,
    Path(channel): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> axum::response::Response {
    let correlation_id = correlation_id_from(&headers);
    match accept_webhook(&state, &forwarder, &channel, &headers, &body, &correlation_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => e.with_correlation(&correlation_id).into_response(),
    }
}

async fn accept_webhook(
    state: &AppState,
    forwarder: &InboundForwarder,
    channel: &str,
    headers: &HeaderMap,
    body: &[u8],
    correlation_id: &str,
) -> AppResult<()> {
    let Some(channel_type) = ChannelType::from_str(channel) else {
        return Err(AppError::NotFound(format!("unknown channel {}", channel)));
    };

    let payload: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AppError::Validation(format!("unparsable body: {}", e)))?;
    let channel_id = providers::peek_channel_id(&payload)?;
    let channel_row = load_channel(state, channel_id, channel_type)?;

    let provided = headers
        .get(channel_type.signature_header())
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !verify_against_secret_set(state, &channel_row, channel_type, body, provided) {
        record_audit_best_effort(
            &state.conn,
            Some(channel_row.tenant_id),
            "gateway",
            "auth.signature_mismatch",
            serde_json::json!({
                "channel_id": channel_row.id,
                "channel_type": channel_type.as_str(),
            }),
            Some(correlation_id),
        );
        state.metrics.incr("gateway_signature_mismatches").await;
        return Err(AppError::Auth("signature mismatch".into()));
    }

    let message = providers::normalize(channel_type, &payload)?;
    if message.tenant_id != channel_row.tenant_id || message.brand_id != channel_row.brand_id {
        return Err(AppError::NotFound(format!(
            "channel {} not found",
            channel_id
        )));
    }

    forwarder
        .forward_or_buffer(message, correlation_id)
        .await?;
    state.metrics.incr("gateway_inbound_accepted").await;
    Ok(())
}

fn verify_against_secret_set(
    state: &AppState,
    channel: &Channel,
    channel_type: ChannelType,
    body: &[u8],
    provided: &str,
) -> bool {
    if provided.is_empty() {
        return false;
    }
    if signature::verify(
        body,
        provided,
        &channel.hmac_secret,
        channel.previous_hmac_secret.as_deref(),
        channel.secret_rotated_at,
    ) {
        return true;
    }
    // Statically configured secrets cover bootstrap setups where the channel
    // row has not been provisioned with its own secret yet.
    if let Some((current, previous)) = state
        .config
        .gateway
        .webhook_secrets
        .get(channel_type.as_str())
    {
        if signature::verify(body, provided, current, previous.as_deref(), None) {
            return true;
        }
    }
    warn!("signature mismatch on channel {}", channel.id);
    false
}

fn load_channel(
    state: &AppState,
    channel_id: Uuid,
    channel_type: ChannelType,
) -> AppResult<Channel> {
    let mut conn = state.conn.get()?;
    let channel: Option<Channel> = channels::table
        .find(channel_id)
        .first(&mut conn)
        .optional()?;
    let Some(channel) = channel else {
        return Err(AppError::NotFound(format!(
            "channel {} not found",
            channel_id
        )));
    };
    if channel.channel_type != channel_type.as_str() || !channel.is_active {
        return Err(AppError::NotFound(format!(
            "channel {} not found",
            channel_id
        )));
    }
    Ok(channel)
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
            "component": "gateway",
        })),
    )
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.render().await
}
