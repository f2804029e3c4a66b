//! Admin API surface mounted under /admin on the orchestrator.

pub mod auth;
pub mod automation;
pub mod knowledge;
pub mod policies;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use diesel::prelude::*;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::audit::record_audit_best_effort;
use crate::shared::error::{AppError, AppResult};
use crate::shared::events::DomainEvent;
use crate::shared::models::{channels, conversations, message_logs, Channel, Conversation, MessageLog};
use crate::shared::state::AppState;

use auth::AdminContext;

pub fn configure() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/knowledge_assets/upload", post(knowledge::upload_asset))
        .route("/admin/ingestion_jobs", get(knowledge::list_jobs))
        .route("/admin/ingestion_jobs/:id/retry", post(knowledge::retry_job))
        .route("/admin/automation/rules", post(automation::create_rule))
        .route("/admin/automation/test", post(automation::test_rule))
        .route(
            "/admin/automation/rules/:id/pause",
            post(automation::pause_rule),
        )
        .route(
            "/admin/automation/rules/:id/resume",
            post(automation::resume_rule),
        )
        .route("/admin/automation/jobs", get(automation::list_jobs))
        .route("/admin/policies/:tenant_id/draft", post(policies::create_draft))
        .route("/admin/policies/:tenant_id/publish", post(policies::publish))
        .route(
            "/admin/policies/:tenant_id/diff/:version",
            get(policies::diff),
        )
        .route(
            "/admin/conversations/:id/messages",
            get(conversation_transcript),
        )
        .route(
            "/admin/channels/:id/rotate_secret",
            post(rotate_channel_secret),
        )
}

/// Rotate a channel's webhook secret: add new, keep the old one valid for
/// the grace window. The fresh secret is returned exactly once.
async fn rotate_channel_secret(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<Uuid>,
    admin: AdminContext,
) -> AppResult<Json<serde_json::Value>> {
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
    admin.require_tenant(channel.tenant_id)?;

    let fresh: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();
    diesel::update(channels::table.find(channel_id))
        .set((
            channels::previous_hmac_secret.eq(Some(channel.hmac_secret.clone())),
            channels::hmac_secret.eq(&fresh),
            channels::secret_rotated_at.eq(diesel::dsl::now),
            channels::updated_at.eq(diesel::dsl::now),
        ))
        .execute(&mut conn)?;

    state
        .events
        .publish_best_effort(
            &DomainEvent::new(
                "channel.secret_rotated",
                channel.tenant_id,
                serde_json::json!({"channel_id": channel_id}),
            )
            .with_brand(channel.brand_id),
        )
        .await;
    record_audit_best_effort(
        &state.conn,
        Some(channel.tenant_id),
        admin.actor(),
        "channel.secret_rotated",
        serde_json::json!({"channel_id": channel_id}),
        None,
    );

    Ok(Json(serde_json::json!({
        "channel_id": channel_id,
        "hmac_secret": fresh,
        "rotated_at": chrono::Utc::now(),
    })))
}

/// Transcript review for operators.
async fn conversation_transcript(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<Uuid>,
    admin: AdminContext,
) -> AppResult<Json<Vec<MessageLog>>> {
    let mut conn = state.conn.get()?;
    let conversation: Option<Conversation> = conversations::table
        .find(conversation_id)
        .first(&mut conn)
        .optional()?;
    let Some(conversation) = conversation else {
        return Err(AppError::NotFound(format!(
            "conversation {} not found",
            conversation_id
        )));
    };
    admin.require_tenant(conversation.tenant_id)?;

    let logs: Vec<MessageLog> = message_logs::table
        .filter(message_logs::conversation_id.eq(conversation_id))
        .order(message_logs::created_at.asc())
        .load(&mut conn)?;
    Ok(Json(logs))
}
