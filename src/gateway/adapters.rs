//! Provider delivery adapters used by the outbound worker.
//!
//! Registration is static at startup; every adapter implements the same
//! capability surface (name, health check, send) over its provider API.

use async_trait::async_trait;
use log::debug;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::shared::error::{AppError, AppResult};
use crate::shared::models::{Channel, ChannelType, OutboundRecord};

pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &str;
    async fn health_check(&self) -> bool;
    async fn send(&self, channel: &Channel, record: &OutboundRecord) -> AppResult<()>;
}

fn credential<'a>(channel: &'a Channel, key: &str) -> AppResult<&'a str> {
    channel
        .credentials
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            AppError::Permanent(format!(
                "channel {} missing credential {}",
                channel.id, key
            ))
        })
}

fn classify_status(provider: &str, status: reqwest::StatusCode) -> AppError {
    let message = format!("{} returned {}", provider, status);
    if status.as_u16() == 429 || status.is_server_error() {
        AppError::Transient(message)
    } else {
        AppError::Permanent(message)
    }
}

pub struct TelegramAdapter {
    http: reqwest::Client,
}

impl TelegramAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn send(&self, channel: &Channel, record: &OutboundRecord) -> AppResult<()> {
        let token = credential(channel, "bot_token")?;
        let url = format!("https://api.telegram.org/bot{}/sendMessage", token);
        let response = self
            .http
            .post(&url)
            .timeout(SEND_TIMEOUT)
            .json(&json!({
                "chat_id": record.external_sender_id,
                "text": record.content,
            }))
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("telegram unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(classify_status("telegram", response.status()));
        }
        debug!("telegram delivery {} sent", record.delivery_id);
        Ok(())
    }
}

pub struct WhatsAppAdapter {
    http: reqwest::Client,
}

impl WhatsAppAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChannelAdapter for WhatsAppAdapter {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn send(&self, channel: &Channel, record: &OutboundRecord) -> AppResult<()> {
        let phone_number_id = credential(channel, "phone_number_id")?;
        let access_token = credential(channel, "access_token")?;
        let url = format!(
            "https://graph.facebook.com/v19.0/{}/messages",
            phone_number_id
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .timeout(SEND_TIMEOUT)
            .json(&json!({
                "messaging_product": "whatsapp",
                "to": record.external_sender_id,
                "type": "text",
                "text": { "body": record.content },
            }))
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("whatsapp unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(classify_status("whatsapp", response.status()));
        }
        debug!("whatsapp delivery {} sent", record.delivery_id);
        Ok(())
    }
}

pub struct InstagramAdapter {
    http: reqwest::Client,
}

impl InstagramAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChannelAdapter for InstagramAdapter {
    fn name(&self) -> &str {
        "instagram"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn send(&self, channel: &Channel, record: &OutboundRecord) -> AppResult<()> {
        let access_token = credential(channel, "access_token")?;
        let response = self
            .http
            .post("https://graph.facebook.com/v19.0/me/messages")
            .bearer_auth(access_token)
            .timeout(SEND_TIMEOUT)
            .json(&json!({
                "recipient": { "id": record.external_sender_id },
                "message": { "text": record.content },
            }))
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("instagram unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(classify_status("instagram", response.status()));
        }
        debug!("instagram delivery {} sent", record.delivery_id);
        Ok(())
    }
}

/// Webchat delivery posts to the channel's provider-facing delivery URL.
/// The URL is opaque to the core and owned by whoever hosts the widget.
pub struct WebAdapter {
    http: reqwest::Client,
}

impl WebAdapter {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChannelAdapter for WebAdapter {
    fn name(&self) -> &str {
        "web"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn send(&self, channel: &Channel, record: &OutboundRecord) -> AppResult<()> {
        let delivery_url = credential(channel, "delivery_url")?;
        let response = self
            .http
            .post(delivery_url)
            .timeout(SEND_TIMEOUT)
            .json(&json!({
                "delivery_id": record.delivery_id,
                "recipient": record.external_sender_id,
                "content": record.content,
                "metadata": record.metadata,
            }))
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("web delivery unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(classify_status("web", response.status()));
        }
        debug!("web delivery {} sent", record.delivery_id);
        Ok(())
    }
}

/// Static adapter registry built once at worker startup.
pub fn build_adapters(http: &reqwest::Client) -> HashMap<ChannelType, Arc<dyn ChannelAdapter>> {
    let mut adapters: HashMap<ChannelType, Arc<dyn ChannelAdapter>> = HashMap::new();
    adapters.insert(
        ChannelType::Telegram,
        Arc::new(TelegramAdapter::new(http.clone())),
    );
    adapters.insert(
        ChannelType::WhatsApp,
        Arc::new(WhatsAppAdapter::new(http.clone())),
    );
    adapters.insert(
        ChannelType::Instagram,
        Arc::new(InstagramAdapter::new(http.clone())),
    );
    adapters.insert(ChannelType::Web, Arc::new(WebAdapter::new(http.clone())));
    adapters
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn channel(credentials: serde_json::Value) -> Channel {
        Channel {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            brand_id: Uuid::new_v4(),
            channel_type: "web".into(),
            display_name: "widget".into(),
            hmac_secret: "secret".into(),
            previous_hmac_secret: None,
            secret_rotated_at: None,
            credentials,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn registry_covers_every_channel_type() {
        let adapters = build_adapters(&reqwest::Client::new());
        for channel_type in [
            ChannelType::Instagram,
            ChannelType::WhatsApp,
            ChannelType::Telegram,
            ChannelType::Web,
        ] {
            assert!(adapters.contains_key(&channel_type));
        }
    }

    #[test]
    fn missing_credential_is_permanent() {
        let channel = channel(serde_json::json!({}));
        let err = credential(&channel, "bot_token").unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn status_classification() {
        assert!(classify_status("x", reqwest::StatusCode::TOO_MANY_REQUESTS).is_retryable());
        assert!(classify_status("x", reqwest::StatusCode::BAD_GATEWAY).is_retryable());
        assert!(!classify_status("x", reqwest::StatusCode::BAD_REQUEST).is_retryable());
    }
}
