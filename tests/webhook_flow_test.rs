//! End-to-end checks for the gateway's signed-webhook handling that run
//! without any backing services: signature verification, normalization, and
//! replay idempotency keys.

use convoserver::gateway::{providers, signature};
use convoserver::orchestrator::dedupe::EventDeduper;
use convoserver::shared::models::ChannelType;

const WEBCHAT_BODY: &str = r#"{"event_id":"e1","tenant_id":"11111111-1111-1111-1111-111111111111","brand_id":"22222222-2222-2222-2222-222222222222","channel_id":"33333333-3333-3333-3333-333333333333","sender_id":"u-1","message":"hi","locale":"en-US","occurred_at":"2025-01-01T00:00:00Z"}"#;

#[test]
fn signed_webchat_inbound_normalizes() {
    let body = WEBCHAT_BODY.as_bytes();
    let provided = signature::sign("dev-web", body);
    assert!(signature::verify(body, &provided, "dev-web", None, None));

    let payload: serde_json::Value = serde_json::from_slice(body).unwrap();
    let channel_id = providers::peek_channel_id(&payload).unwrap();
    assert_eq!(
        channel_id.to_string(),
        "33333333-3333-3333-3333-333333333333"
    );

    let message = providers::normalize(ChannelType::Web, &payload).unwrap();
    assert_eq!(message.event_id, "e1");
    assert_eq!(
        message.tenant_id.to_string(),
        "11111111-1111-1111-1111-111111111111"
    );
    assert_eq!(message.sender_id, "u-1");
    assert_eq!(message.message, "hi");
    assert_eq!(message.locale.as_deref(), Some("en-US"));
}

#[test]
fn wrong_secret_is_unauthorized() {
    let body = WEBCHAT_BODY.as_bytes();
    let provided = signature::sign("wrong", body);
    assert!(!signature::verify(body, &provided, "dev-web", None, None));
}

#[test]
fn replayed_event_produces_identical_idempotency_key() {
    let payload: serde_json::Value = serde_json::from_str(WEBCHAT_BODY).unwrap();
    let first: serde_json::Value = serde_json::from_str(WEBCHAT_BODY).unwrap();
    let message_a = providers::normalize(ChannelType::Web, &payload).unwrap();
    let message_b = providers::normalize(ChannelType::Web, &first).unwrap();

    let hash_a = EventDeduper::payload_hash(&serde_json::to_value(&message_a).unwrap());
    let hash_b = EventDeduper::payload_hash(&serde_json::to_value(&message_b).unwrap());
    assert_eq!(message_a.event_id, message_b.event_id);
    assert_eq!(hash_a, hash_b);
}

#[test]
fn same_event_id_with_different_body_changes_hash() {
    let payload: serde_json::Value = serde_json::from_str(WEBCHAT_BODY).unwrap();
    let mut altered = payload.clone();
    altered["message"] = serde_json::json!("something else");

    let message_a = providers::normalize(ChannelType::Web, &payload).unwrap();
    let message_b = providers::normalize(ChannelType::Web, &altered).unwrap();
    assert_eq!(message_a.event_id, message_b.event_id);

    let hash_a = EventDeduper::payload_hash(&serde_json::to_value(&message_a).unwrap());
    let hash_b = EventDeduper::payload_hash(&serde_json::to_value(&message_b).unwrap());
    assert_ne!(hash_a, hash_b);
}
