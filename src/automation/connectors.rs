//! Automation action connectors: webhook, CRM, email.
//!
//! Connectors share the provider capability surface (name, health check,
//! invoke) and support dry-run invocation for the admin test endpoint.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::info;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::shared::error::{AppError, AppResult};
use crate::shared::state::AppState;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ConnectorContext {
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub dry_run: bool,
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;
    async fn health_check(&self) -> bool;
    async fn invoke(&self, payload: &Value, context: &ConnectorContext) -> AppResult<Value>;
}

fn classify_status(connector: &str, status: reqwest::StatusCode) -> AppError {
    let message = format!("{} target returned {}", connector, status);
    if status.as_u16() == 429 || status.is_server_error() {
        AppError::Transient(message)
    } else {
        AppError::Permanent(message)
    }
}

pub struct WebhookConnector {
    http: reqwest::Client,
}

impl WebhookConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Connector for WebhookConnector {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn invoke(&self, payload: &Value, context: &ConnectorContext) -> AppResult<Value> {
        let url = payload
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Validation("webhook url missing".into()))?;
        let method = payload
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("POST")
            .to_uppercase();
        let body = payload.get("body").cloned().unwrap_or(json!({}));

        if context.dry_run {
            info!(
                "webhook dry run for tenant {} ({} {})",
                context.tenant_id, method, url
            );
            return Ok(json!({"status": "dry_run", "url": url, "method": method}));
        }

        let method = reqwest::Method::from_bytes(method.as_bytes())
            .map_err(|_| AppError::Validation(format!("invalid method {}", method)))?;
        let mut request = self
            .http
            .request(method, url)
            .timeout(DEFAULT_TIMEOUT)
            .json(&body);
        if let Some(headers) = payload.get("headers").and_then(|v| v.as_object()) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("webhook target unreachable: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status("webhook", status));
        }
        Ok(json!({"status": "sent", "status_code": status.as_u16()}))
    }
}

pub struct CrmConnector {
    http: reqwest::Client,
}

impl CrmConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Connector for CrmConnector {
    fn name(&self) -> &str {
        "crm"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn invoke(&self, payload: &Value, context: &ConnectorContext) -> AppResult<Value> {
        let endpoint = payload
            .get("endpoint")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Validation("crm endpoint missing".into()))?;
        let event = payload
            .get("event")
            .and_then(|v| v.as_str())
            .unwrap_or("automation.event");

        if context.dry_run {
            info!(
                "crm dry run for tenant {} (event {})",
                context.tenant_id, event
            );
            return Ok(json!({"status": "dry_run", "endpoint": endpoint, "event": event}));
        }

        let mut request = self
            .http
            .post(endpoint)
            .timeout(DEFAULT_TIMEOUT)
            .json(&json!({
                "event": event,
                "tenant_id": context.tenant_id,
                "brand_id": context.brand_id,
                "properties": payload.get("properties").cloned().unwrap_or(json!({})),
            }));
        if let Some(api_key) = payload.get("api_key").and_then(|v| v.as_str()) {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("crm unreachable: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status("crm", status));
        }
        Ok(json!({"status": "recorded", "status_code": status.as_u16()}))
    }
}

pub struct EmailConnector {
    smtp: Option<SmtpConfig>,
}

impl EmailConnector {
    pub fn new(smtp: Option<SmtpConfig>) -> Self {
        Self { smtp }
    }
}

#[async_trait]
impl Connector for EmailConnector {
    fn name(&self) -> &str {
        "email"
    }

    async fn health_check(&self) -> bool {
        self.smtp.is_some()
    }

    async fn invoke(&self, payload: &Value, context: &ConnectorContext) -> AppResult<Value> {
        let to = payload
            .get("to")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Validation("email recipient missing".into()))?;
        let subject = payload
            .get("subject")
            .and_then(|v| v.as_str())
            .unwrap_or("Automated notification");
        let body = payload
            .get("body")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if context.dry_run {
            info!("email dry run for tenant {} (to {})", context.tenant_id, to);
            return Ok(json!({"status": "dry_run", "to": to, "subject": subject}));
        }

        let Some(ref smtp) = self.smtp else {
            return Err(AppError::Permanent("smtp transport not configured".into()));
        };
        let from: Mailbox = smtp
            .from
            .parse()
            .map_err(|e| AppError::Permanent(format!("invalid smtp from address: {}", e)))?;
        let to: Mailbox = to
            .parse()
            .map_err(|e| AppError::Validation(format!("invalid recipient: {}", e)))?;
        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| AppError::Permanent(format!("could not build message: {}", e)))?;

        let transport = AsyncSmtpTransport::<Tokio1Executor>::from_url(&smtp.url)
            .map_err(|e| AppError::Permanent(format!("invalid smtp url: {}", e)))?
            .timeout(Some(DEFAULT_TIMEOUT))
            .build();
        transport
            .send(message)
            .await
            .map_err(|e| AppError::Transient(format!("smtp send failed: {}", e)))?;
        Ok(json!({"status": "sent", "subject": subject}))
    }
}

/// Static connector registry keyed by `action_type`.
pub fn build_connector(action_type: &str, state: &AppState) -> Arc<dyn Connector> {
    match action_type {
        "crm" => Arc::new(CrmConnector::new(state.http.clone())),
        "email" => Arc::new(EmailConnector::new(state.config.smtp.clone())),
        _ => Arc::new(WebhookConnector::new(state.http.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(dry_run: bool) -> ConnectorContext {
        ConnectorContext {
            tenant_id: Uuid::new_v4(),
            brand_id: Uuid::new_v4(),
            rule_id: None,
            dry_run,
        }
    }

    #[tokio::test]
    async fn webhook_dry_run_does_not_call_out() {
        let connector = WebhookConnector::new(reqwest::Client::new());
        let result = connector
            .invoke(
                &json!({"url": "https://example.invalid/hook"}),
                &context(true),
            )
            .await
            .unwrap();
        assert_eq!(result["status"], "dry_run");
    }

    #[tokio::test]
    async fn webhook_requires_url() {
        let connector = WebhookConnector::new(reqwest::Client::new());
        let err = connector.invoke(&json!({}), &context(true)).await.unwrap_err();
        assert_eq!(err.error_code(), "validation_error");
    }

    #[tokio::test]
    async fn email_without_smtp_is_permanent() {
        let connector = EmailConnector::new(None);
        let err = connector
            .invoke(
                &json!({"to": "ops@example.com", "subject": "hi"}),
                &context(false),
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn email_dry_run_skips_transport() {
        let connector = EmailConnector::new(None);
        let result = connector
            .invoke(&json!({"to": "ops@example.com"}), &context(true))
            .await
            .unwrap();
        assert_eq!(result["status"], "dry_run");
    }
}
