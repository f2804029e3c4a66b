//! The inbound processing pipeline.
//!
//! RECEIVED -> DEDUPED -> CONVERSATION_READY -> POLICY_RESOLVED ->
//! CONTEXT_READY -> LLM_CALLED -> GUARDRAILED -> PERSISTED -> PUBLISHED.
//!
//! Failures before persistence abort and release the dedupe claim so the
//! provider's retry can run the event again. The request deadline covers
//! everything up to guardrails; once the transcript is committed the publish
//! proceeds regardless of caller cancellation.

use chrono::Utc;
use diesel::prelude::*;
use log::{info, warn};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

use crate::llm::assemble_prompt;
use crate::retrieval::{self, ContextSelection};
use crate::shared::error::{AppError, AppResult};
use crate::shared::events::DomainEvent;
use crate::shared::models::{channels, Channel, InboundMessage, OutboundRecord};
use crate::shared::state::AppState;

use super::conversation::ConversationStore;
use super::dedupe::{ClaimOutcome, EventDeduper};
use super::guardrails::{GuardrailChain, GuardrailOutcome};
use super::policy;

const IN_PROGRESS_WAIT: std::time::Duration = std::time::Duration::from_millis(250);
const IN_PROGRESS_WAIT_ROUNDS: u32 = 8;

#[derive(Debug, Clone, Serialize)]
pub struct InboundAck {
    pub conversation_id: Uuid,
    pub delivery_id: Uuid,
}

pub async fn process_inbound(
    state: &AppState,
    msg: InboundMessage,
    correlation_id: &str,
) -> AppResult<InboundAck> {
    let started = Instant::now();
    state.metrics.record_request();

    if msg.message.trim().is_empty() {
        return Err(AppError::Validation("message must not be empty".into()));
    }
    if msg.event_id.is_empty() {
        return Err(AppError::Validation("event_id is required".into()));
    }

    // DEDUPED. The hash covers the fields a replay must not change;
    // normalization timestamps defaulted by the gateway stay out of it.
    let payload_hash = EventDeduper::payload_hash(&serde_json::json!({
        "event_id": msg.event_id,
        "tenant_id": msg.tenant_id,
        "brand_id": msg.brand_id,
        "channel_id": msg.channel_id,
        "sender_id": msg.sender_id,
        "message": msg.message,
    }));
    match wait_for_claim(&state.deduper, &msg.event_id, &payload_hash).await? {
        ClaimOutcome::Duplicate {
            conversation_id,
            delivery_id,
        } => {
            info!(
                "event {} replayed, returning cached ack (correlation {})",
                msg.event_id, correlation_id
            );
            state.metrics.incr("inbound_deduped").await;
            return Ok(InboundAck {
                conversation_id,
                delivery_id,
            });
        }
        ClaimOutcome::InProgress => {
            return Err(AppError::Transient(format!(
                "event {} still in flight",
                msg.event_id
            )));
        }
        ClaimOutcome::New => {}
    }

    match run_pipeline(state, &msg, correlation_id).await {
        Ok(ack) => {
            state
                .deduper
                .complete(&msg.event_id, &payload_hash, ack.conversation_id, ack.delivery_id)
                .await?;
            state
                .metrics
                .observe_latency("inbound_pipeline_latency", started.elapsed().as_millis() as u64)
                .await;
            Ok(ack)
        }
        Err(e) => {
            state.metrics.record_error();
            // Release so the provider retry is not locked out.
            if let Err(release_err) = state.deduper.release(&msg.event_id).await {
                warn!(
                    "failed to release dedupe claim for {}: {}",
                    msg.event_id, release_err
                );
            }
            Err(e)
        }
    }
}

async fn run_pipeline(
    state: &AppState,
    msg: &InboundMessage,
    correlation_id: &str,
) -> AppResult<InboundAck> {
    let channel = load_channel(state, msg)?;
    let conversations = ConversationStore::new(state.conn.clone());

    // CONVERSATION_READY
    let inbound_metadata = serde_json::json!({
        "event_id": msg.event_id,
        "locale": msg.locale,
        "channel_type": channel.channel_type,
        "client_metadata": msg.metadata,
    });
    let (conversation, _inbound_log) = conversations.upsert_with_inbound(
        &channel,
        &msg.sender_id,
        &msg.message,
        inbound_metadata,
        correlation_id,
        msg.occurred_at,
    )?;

    state
        .events
        .publish_best_effort(
            &DomainEvent::new(
                "conversation.message_received",
                msg.tenant_id,
                serde_json::json!({
                    "conversation_id": conversation.id,
                    "channel_id": channel.id,
                    "sender_id": msg.sender_id,
                }),
            )
            .with_brand(msg.brand_id),
        )
        .await;

    // The request deadline covers everything that can still be abandoned:
    // policy resolution, retrieval, the LLM call, and guardrails. Once the
    // transcript commits below, cancellation no longer applies.
    let deadline = state.config.runtime.request_deadline;
    let prepared = tokio::time::timeout(
        deadline,
        prepare_reply(state, msg, &conversations, conversation.id),
    )
    .await
    .map_err(|_| AppError::Transient("request deadline exceeded".into()))??;
    let PreparedReply {
        content,
        escalated,
        require_audit,
        outbound_metadata,
    } = prepared;

    // PERSISTED
    let audit_action = require_audit.then_some("conversation.reply_sent");
    let outbound_log = conversations.persist_outbound(
        conversation.id,
        msg.tenant_id,
        &content,
        outbound_metadata.clone(),
        correlation_id,
        audit_action,
    )?;

    if escalated {
        state
            .events
            .publish_best_effort(
                &DomainEvent::new(
                    "conversation.escalated",
                    msg.tenant_id,
                    serde_json::json!({
                        "conversation_id": conversation.id,
                        "message_id": outbound_log.id,
                        "reason": outbound_metadata["guardrail"],
                    }),
                )
                .with_brand(msg.brand_id),
            )
            .await;
    }

    // PUBLISHED: strictly after commit; duplicates are deduped downstream.
    let delivery_id = Uuid::new_v4();
    let record = OutboundRecord {
        delivery_id,
        channel_id: channel.id,
        external_sender_id: msg.sender_id.clone(),
        content,
        metadata: outbound_metadata,
        attempt: 0,
    };
    state.publisher.publish_or_park(&record, correlation_id).await;

    Ok(InboundAck {
        conversation_id: conversation.id,
        delivery_id,
    })
}

struct PreparedReply {
    content: String,
    escalated: bool,
    require_audit: bool,
    outbound_metadata: serde_json::Value,
}

/// POLICY_RESOLVED -> CONTEXT_READY -> LLM_CALLED -> GUARDRAILED.
async fn prepare_reply(
    state: &AppState,
    msg: &InboundMessage,
    conversations: &ConversationStore,
    conversation_id: Uuid,
) -> AppResult<PreparedReply> {
    let resolved = state.policies.resolve(msg.tenant_id).await?;
    let document = &resolved.document;
    let decision = policy::evaluate(document, &msg.message, Utc::now());

    let mut outbound_metadata = serde_json::json!({
        "event_id": msg.event_id,
        "policy_version": resolved.version,
    });

    let (content, escalated) = if !decision.allow {
        state.metrics.incr("policy_denials").await;
        outbound_metadata["policy_denied"] = serde_json::json!(decision.reason);
        (document.fallback_reply.clone(), false)
    } else {
        let tunables = retrieval::load_tunables(&state.conn, msg.tenant_id);
        let context = retrieval::retrieve_context(
            &state.embeddings,
            &state.vectors,
            msg.tenant_id,
            msg.brand_id,
            &msg.message,
            &tunables,
        )
        .await?;
        if context.degraded {
            outbound_metadata["context_degraded"] = serde_json::json!(true);
        }

        let reply = call_llm(
            state,
            msg,
            document,
            &context,
            &mut outbound_metadata,
            conversations,
            conversation_id,
        )
        .await?;

        match GuardrailChain::evaluate(document, &msg.message, &reply) {
            GuardrailOutcome::Accept => (reply, false),
            GuardrailOutcome::Rewrite { reason } => {
                state.metrics.incr("guardrail_rewrites").await;
                outbound_metadata["guardrail"] = serde_json::json!(reason);
                (document.fallback_reply.clone(), false)
            }
            GuardrailOutcome::Escalate { reason } => {
                state.metrics.incr("guardrail_escalations").await;
                outbound_metadata["guardrail"] = serde_json::json!(reason);
                outbound_metadata["escalated"] = serde_json::json!(true);
                (reply, true)
            }
        }
    };

    Ok(PreparedReply {
        content,
        escalated,
        require_audit: document.require_audit,
        outbound_metadata,
    })
}

async fn call_llm(
    state: &AppState,
    msg: &InboundMessage,
    document: &policy::PolicyDocument,
    context: &ContextSelection,
    outbound_metadata: &mut serde_json::Value,
    conversations: &ConversationStore,
    conversation_id: Uuid,
) -> AppResult<String> {
    let Some(ref llm) = state.llm else {
        return Err(AppError::Transient("llm provider not configured".into()));
    };

    let history = conversations.history(conversation_id, document.history_turns + 1)?;
    // The freshly appended inbound message is already the prompt tail.
    let history: Vec<_> = history
        .into_iter()
        .rev()
        .skip(1)
        .rev()
        .collect();

    let request = assemble_prompt(
        &document.persona_prompt,
        &context.documents,
        &history,
        document.history_turns,
        &msg.message,
        state.config.runtime.request_deadline,
    );

    match llm.generate(&request).await {
        Ok(response) => {
            outbound_metadata["llm"] = response.metadata();
            Ok(response.content)
        }
        Err(AppError::Permanent(reason)) => {
            // Terminal provider error: answer with the policy fallback
            // instead of dropping the conversation on the floor.
            warn!("llm permanent failure, serving fallback: {}", reason);
            outbound_metadata["llm_error"] = serde_json::json!(reason);
            Ok(document.fallback_reply.clone())
        }
        Err(e) => Err(e),
    }
}

fn load_channel(state: &AppState, msg: &InboundMessage) -> AppResult<Channel> {
    let mut conn = state.conn.get()?;
    let channel: Option<Channel> = channels::table
        .find(msg.channel_id)
        .first(&mut conn)
        .optional()?;
    let Some(channel) = channel else {
        return Err(AppError::NotFound(format!(
            "channel {} not found",
            msg.channel_id
        )));
    };
    // Tenant isolation: the payload's tenant must own the channel.
    if channel.tenant_id != msg.tenant_id || channel.brand_id != msg.brand_id {
        return Err(AppError::NotFound(format!(
            "channel {} not found",
            msg.channel_id
        )));
    }
    if !channel.is_active {
        return Err(AppError::NotFound(format!(
            "channel {} is disabled",
            msg.channel_id
        )));
    }
    Ok(channel)
}

async fn wait_for_claim(
    deduper: &EventDeduper,
    event_id: &str,
    payload_hash: &str,
) -> AppResult<ClaimOutcome> {
    let mut outcome = deduper.claim(event_id, payload_hash).await?;
    let mut rounds = 0;
    while matches!(outcome, ClaimOutcome::InProgress) && rounds < IN_PROGRESS_WAIT_ROUNDS {
        tokio::time::sleep(IN_PROGRESS_WAIT).await;
        outcome = deduper.claim(event_id, payload_hash).await?;
        rounds += 1;
    }
    Ok(outcome)
}
