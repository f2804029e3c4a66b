//! Database models and status enums shared across components.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use super::schema;
pub use super::schema::{
    audit_logs, automation_jobs, automation_rules, brands, channels, conversations,
    ingestion_jobs, knowledge_assets, message_logs, policy_versions, retrieval_configs, tenants,
};

/// Channel families supported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Instagram,
    WhatsApp,
    Telegram,
    Web,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Instagram => "instagram",
            Self::WhatsApp => "whatsapp",
            Self::Telegram => "telegram",
            Self::Web => "web",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "instagram" => Some(Self::Instagram),
            "whatsapp" => Some(Self::WhatsApp),
            "telegram" => Some(Self::Telegram),
            "web" => Some(Self::Web),
            _ => None,
        }
    }

    /// Header carrying the provider signature for this channel.
    pub fn signature_header(&self) -> &'static str {
        match self {
            Self::Instagram => "x-instagram-signature",
            Self::WhatsApp => "x-whatsapp-signature",
            Self::Telegram => "x-telegram-signature",
            Self::Web => "x-webchat-signature",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "in",
            Self::Outbound => "out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyStatus {
    Draft,
    Published,
    Archived,
}

impl PolicyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl AssetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "ready" => Some(Self::Ready),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Transitions are forward-only except the explicit failed -> pending retry.
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Ready)
                | (Self::Processing, Self::Failed)
                | (Self::Failed, Self::Pending)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutomationJobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl AutomationJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Tenant database model
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = tenants)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub timezone: String,
    pub metadata: serde_json::Value,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = brands)]
pub struct Brand {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub persona: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Channel database model. `hmac_secret` is write-mostly; rotation keeps the
/// previous secret valid for a grace window.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = channels)]
pub struct Channel {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub channel_type: String,
    pub display_name: String,
    pub hmac_secret: String,
    pub previous_hmac_secret: Option<String>,
    pub secret_rotated_at: Option<DateTime<Utc>>,
    pub credentials: serde_json::Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = conversations)]
pub struct Conversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub channel_id: Uuid,
    pub external_sender_id: String,
    pub last_message_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = conversations)]
pub struct NewConversation {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub channel_id: Uuid,
    pub external_sender_id: String,
    pub last_message_at: DateTime<Utc>,
}

/// Append-only transcript entry.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = message_logs)]
pub struct MessageLog {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub direction: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub correlation_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = message_logs)]
pub struct NewMessageLog {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub direction: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = policy_versions)]
pub struct PolicyVersion {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub version: i32,
    pub status: String,
    pub policy: serde_json::Value,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = policy_versions)]
pub struct NewPolicyVersion {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub version: i32,
    pub status: String,
    pub policy: serde_json::Value,
    pub published_at: Option<DateTime<Utc>>,
}

/// Per-tenant retrieval tunables, 1:1 with tenants.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable)]
pub struct RetrievalConfigRow {
    pub tenant_id: Uuid,
    pub hybrid_weight: f32,
    pub min_score: f32,
    pub max_documents: i32,
    pub context_budget_tokens: i32,
    pub filters: serde_json::Value,
    pub fallback_llm: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = knowledge_assets)]
pub struct KnowledgeAsset {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub object_key: String,
    pub title: String,
    pub checksum: String,
    pub visibility: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = knowledge_assets)]
pub struct NewKnowledgeAsset {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub object_key: String,
    pub title: String,
    pub checksum: String,
    pub visibility: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = ingestion_jobs)]
pub struct IngestionJob {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub total_chunks: i32,
    pub processed_chunks: i32,
    pub failure_reason: Option<String>,
    pub logs: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = ingestion_jobs)]
pub struct NewIngestionJob {
    pub id: Uuid,
    pub asset_id: Uuid,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub total_chunks: i32,
    pub processed_chunks: i32,
    pub logs: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = automation_rules)]
pub struct AutomationRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub name: String,
    pub trigger_type: String,
    pub trigger_event: Option<String>,
    pub schedule: Option<String>,
    pub condition: Option<serde_json::Value>,
    pub action_type: String,
    pub action_payload: serde_json::Value,
    pub throttle_seconds: i32,
    pub max_retries: i32,
    pub is_active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = automation_rules)]
pub struct NewAutomationRule {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub name: String,
    pub trigger_type: String,
    pub trigger_event: Option<String>,
    pub schedule: Option<String>,
    pub condition: Option<serde_json::Value>,
    pub action_type: String,
    pub action_payload: serde_json::Value,
    pub throttle_seconds: i32,
    pub max_retries: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = automation_jobs)]
pub struct AutomationJob {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub scheduled_for: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = automation_jobs)]
pub struct NewAutomationJob {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub status: String,
    pub attempts: i32,
    pub scheduled_for: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable)]
#[diesel(table_name = audit_logs)]
pub struct AuditLog {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub actor: String,
    pub action: String,
    pub metadata: serde_json::Value,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = audit_logs)]
pub struct NewAuditLog {
    pub id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub actor: String,
    pub action: String,
    pub metadata: serde_json::Value,
    pub correlation_id: Option<String>,
}

/// Canonical inbound message produced by the gateway after normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub event_id: String,
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub channel_id: Uuid,
    pub sender_id: String,
    pub message: String,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Record carried on the outbound stream from orchestrator to gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub delivery_id: Uuid,
    pub channel_id: Uuid,
    pub external_sender_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub attempt: u32,
}

impl OutboundRecord {
    /// Stream partition key preserving per-conversation ordering.
    pub fn partition_key(&self) -> String {
        format!("{}:{}", self.channel_id, self.external_sender_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_round_trip() {
        for raw in ["instagram", "whatsapp", "telegram", "web"] {
            let parsed = ChannelType::from_str(raw).unwrap();
            assert_eq!(parsed.as_str(), raw);
        }
        assert!(ChannelType::from_str("sms").is_none());
    }

    #[test]
    fn asset_status_transitions_are_forward_only() {
        assert!(AssetStatus::Pending.can_transition_to(AssetStatus::Processing));
        assert!(AssetStatus::Processing.can_transition_to(AssetStatus::Ready));
        assert!(AssetStatus::Failed.can_transition_to(AssetStatus::Pending));
        assert!(!AssetStatus::Ready.can_transition_to(AssetStatus::Pending));
        assert!(!AssetStatus::Pending.can_transition_to(AssetStatus::Ready));
    }

    #[test]
    fn job_status_terminal_states() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn partition_key_is_stable_per_conversation() {
        let channel_id = Uuid::new_v4();
        let a = OutboundRecord {
            delivery_id: Uuid::new_v4(),
            channel_id,
            external_sender_id: "u-1".into(),
            content: "hello".into(),
            metadata: serde_json::json!({}),
            attempt: 0,
        };
        let b = OutboundRecord {
            delivery_id: Uuid::new_v4(),
            channel_id,
            external_sender_id: "u-1".into(),
            content: "again".into(),
            metadata: serde_json::json!({}),
            attempt: 1,
        };
        assert_eq!(a.partition_key(), b.partition_key());
    }
}
