//! Provider payload normalization.
//!
//! Every provider envelope is tenant-addressed (carries tenant, brand, and
//! channel ids) but the surrounding shape and field names differ per
//! provider. Each normalizer maps its payload into the canonical
//! `InboundMessage`.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::shared::error::{AppError, AppResult};
use crate::shared::models::{ChannelType, InboundMessage};

/// Webchat posts the canonical shape directly.
#[derive(Debug, Deserialize)]
struct WebchatPayload {
    event_id: String,
    tenant_id: Uuid,
    brand_id: Uuid,
    channel_id: Uuid,
    sender_id: String,
    message: String,
    #[serde(default)]
    locale: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppPayload {
    event_id: String,
    tenant_id: Uuid,
    brand_id: Uuid,
    channel_id: Uuid,
    /// The wa_id of the sender.
    sender_id: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    profile_name: Option<String>,
    #[serde(default)]
    locale: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct TelegramPayload {
    #[serde(default)]
    event_id: Option<String>,
    update_id: i64,
    tenant_id: Uuid,
    brand_id: Uuid,
    channel_id: Uuid,
    chat_id: i64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    language_code: Option<String>,
    #[serde(default)]
    date: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InstagramPayload {
    #[serde(default)]
    event_id: Option<String>,
    /// Message id assigned by the platform.
    #[serde(default)]
    mid: Option<String>,
    tenant_id: Uuid,
    brand_id: Uuid,
    channel_id: Uuid,
    sender_id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: Option<Value>,
}

/// Extract the routing channel id without fully parsing the payload, so the
/// signature can be checked against the right channel secret first.
pub fn peek_channel_id(payload: &Value) -> AppResult<Uuid> {
    payload
        .get("channel_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| AppError::Validation("payload missing channel_id".into()))
}

pub fn normalize(channel_type: ChannelType, payload: &Value) -> AppResult<InboundMessage> {
    match channel_type {
        ChannelType::Web => normalize_web(payload),
        ChannelType::WhatsApp => normalize_whatsapp(payload),
        ChannelType::Telegram => normalize_telegram(payload),
        ChannelType::Instagram => normalize_instagram(payload),
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: &Value) -> AppResult<T> {
    serde_json::from_value(payload.clone())
        .map_err(|e| AppError::Validation(format!("malformed provider payload: {}", e)))
}

fn require_message(content: Option<String>) -> AppResult<String> {
    match content {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(AppError::Validation("missing message content".into())),
    }
}

fn normalize_web(payload: &Value) -> AppResult<InboundMessage> {
    let parsed: WebchatPayload = parse(payload)?;
    Ok(InboundMessage {
        event_id: parsed.event_id,
        tenant_id: parsed.tenant_id,
        brand_id: parsed.brand_id,
        channel_id: parsed.channel_id,
        sender_id: parsed.sender_id,
        message: require_message(Some(parsed.message))?,
        locale: parsed.locale,
        metadata: parsed.metadata.unwrap_or_else(|| Value::Object(Default::default())),
        occurred_at: parsed.occurred_at.unwrap_or_else(Utc::now),
    })
}

fn normalize_whatsapp(payload: &Value) -> AppResult<InboundMessage> {
    let parsed: WhatsAppPayload = parse(payload)?;
    let message = require_message(parsed.message.or(parsed.content))?;
    let mut metadata = match parsed.metadata {
        Some(Value::Object(map)) => Value::Object(map),
        _ => Value::Object(Default::default()),
    };
    if let Some(name) = parsed.profile_name {
        metadata["profile_name"] = Value::String(name);
    }
    Ok(InboundMessage {
        event_id: parsed.event_id,
        tenant_id: parsed.tenant_id,
        brand_id: parsed.brand_id,
        channel_id: parsed.channel_id,
        sender_id: parsed.sender_id,
        message,
        locale: parsed.locale,
        metadata,
        occurred_at: parsed.timestamp.unwrap_or_else(Utc::now),
    })
}

fn normalize_telegram(payload: &Value) -> AppResult<InboundMessage> {
    let parsed: TelegramPayload = parse(payload)?;
    let message = require_message(parsed.text)?;
    let occurred_at = parsed
        .date
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);
    let mut metadata = Value::Object(Default::default());
    if let Some(username) = parsed.username {
        metadata["username"] = Value::String(username);
    }
    Ok(InboundMessage {
        // Update ids are the provider's delivery counter; they make a
        // stable idempotency key when no explicit event id is supplied.
        event_id: parsed
            .event_id
            .unwrap_or_else(|| format!("tg-{}", parsed.update_id)),
        tenant_id: parsed.tenant_id,
        brand_id: parsed.brand_id,
        channel_id: parsed.channel_id,
        sender_id: parsed.chat_id.to_string(),
        message,
        locale: parsed.language_code,
        metadata,
        occurred_at,
    })
}

fn normalize_instagram(payload: &Value) -> AppResult<InboundMessage> {
    let parsed: InstagramPayload = parse(payload)?;
    let message = require_message(parsed.text.or(parsed.message))?;
    let event_id = parsed
        .event_id
        .or(parsed.mid.map(|m| format!("ig-{}", m)))
        .ok_or_else(|| AppError::Validation("payload missing event_id or mid".into()))?;
    Ok(InboundMessage {
        event_id,
        tenant_id: parsed.tenant_id,
        brand_id: parsed.brand_id,
        channel_id: parsed.channel_id,
        sender_id: parsed.sender_id,
        message,
        locale: None,
        metadata: parsed
            .metadata
            .unwrap_or_else(|| Value::Object(Default::default())),
        occurred_at: parsed.timestamp.unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn web_payload_normalizes_verbatim() {
        let payload = json!({
            "event_id": "e1",
            "tenant_id": "11111111-1111-1111-1111-111111111111",
            "brand_id": "22222222-2222-2222-2222-222222222222",
            "channel_id": "33333333-3333-3333-3333-333333333333",
            "sender_id": "u-1",
            "message": "hi",
            "locale": "en-US",
            "occurred_at": "2025-01-01T00:00:00Z"
        });
        let msg = normalize(ChannelType::Web, &payload).unwrap();
        assert_eq!(msg.event_id, "e1");
        assert_eq!(msg.sender_id, "u-1");
        assert_eq!(msg.message, "hi");
        assert_eq!(msg.locale.as_deref(), Some("en-US"));
    }

    #[test]
    fn telegram_update_id_becomes_event_id() {
        let payload = json!({
            "update_id": 991,
            "tenant_id": Uuid::new_v4(),
            "brand_id": Uuid::new_v4(),
            "channel_id": Uuid::new_v4(),
            "chat_id": 42,
            "text": "hello",
            "language_code": "de"
        });
        let msg = normalize(ChannelType::Telegram, &payload).unwrap();
        assert_eq!(msg.event_id, "tg-991");
        assert_eq!(msg.sender_id, "42");
        assert_eq!(msg.locale.as_deref(), Some("de"));
    }

    #[test]
    fn whatsapp_accepts_message_or_content() {
        let base = json!({
            "event_id": "wa-1",
            "tenant_id": Uuid::new_v4(),
            "brand_id": Uuid::new_v4(),
            "channel_id": Uuid::new_v4(),
            "sender_id": "491701234567",
            "content": "hola",
            "profile_name": "Ana"
        });
        let msg = normalize(ChannelType::WhatsApp, &base).unwrap();
        assert_eq!(msg.message, "hola");
        assert_eq!(msg.metadata["profile_name"], "Ana");
    }

    #[test]
    fn missing_content_is_a_validation_error() {
        let payload = json!({
            "event_id": "e1",
            "tenant_id": Uuid::new_v4(),
            "brand_id": Uuid::new_v4(),
            "channel_id": Uuid::new_v4(),
            "sender_id": "u-1",
            "message": "   "
        });
        let err = normalize(ChannelType::Web, &payload).unwrap_err();
        assert_eq!(err.error_code(), "validation_error");
    }

    #[test]
    fn peek_channel_id_reads_routing_field() {
        let id = Uuid::new_v4();
        let payload = json!({"channel_id": id.to_string()});
        assert_eq!(peek_channel_id(&payload).unwrap(), id);
        assert!(peek_channel_id(&json!({})).is_err());
    }
}
