//! Tenant policy resolution and evaluation.
//!
//! The single `published` PolicyVersion per tenant drives persona, guardrail
//! inputs, and fallback copy. Resolutions are cached in-process with a short
//! TTL and invalidated explicitly when a policy is published.

use chrono::{DateTime, NaiveTime, Utc};
use diesel::prelude::*;
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::shared::error::AppResult;
use crate::shared::models::{policy_versions, PolicyStatus, PolicyVersion};
use crate::shared::utils::DbPool;

pub const DEFAULT_HISTORY_TURNS: usize = 6;
const DEFAULT_FALLBACK_REPLY: &str =
    "I'm sorry, I can't help with that right now. A human teammate will follow up shortly.";
const DEFAULT_PERSONA: &str =
    "You are a careful, honest customer assistant. If you are not sure, say so and offer to escalate to a human.";

#[derive(Debug, Clone)]
pub struct QuietWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Parsed view over a tenant's `policy_json`.
#[derive(Debug, Clone)]
pub struct PolicyDocument {
    pub persona_prompt: String,
    pub greeting: Option<String>,
    pub fallback_reply: String,
    pub history_turns: usize,
    pub blocked_keywords: Vec<String>,
    pub escalation_keywords: Vec<String>,
    pub quiet_hours: Vec<QuietWindow>,
    pub require_audit: bool,
    pub allowed_actions: Vec<String>,
}

impl Default for PolicyDocument {
    /// Built-in conservative policy used when a tenant has nothing published.
    fn default() -> Self {
        Self {
            persona_prompt: DEFAULT_PERSONA.to_string(),
            greeting: None,
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
            history_turns: DEFAULT_HISTORY_TURNS,
            blocked_keywords: Vec::new(),
            escalation_keywords: vec!["human".to_string(), "agent".to_string()],
            quiet_hours: Vec::new(),
            require_audit: false,
            allowed_actions: Vec::new(),
        }
    }
}

impl PolicyDocument {
    pub fn from_json(policy: &serde_json::Value) -> Self {
        let defaults = Self::default();
        let str_list = |key: &str| -> Vec<String> {
            policy
                .get(key)
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|i| i.as_str().map(|s| s.to_lowercase()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let quiet_hours = policy
            .get("quiet_hours")
            .and_then(|v| v.as_array())
            .map(|windows| {
                windows
                    .iter()
                    .filter_map(|w| {
                        let start = w.get("start")?.as_str()?;
                        let end = w.get("end")?.as_str()?;
                        Some(QuietWindow {
                            start: NaiveTime::parse_from_str(start, "%H:%M").ok()?,
                            end: NaiveTime::parse_from_str(end, "%H:%M").ok()?,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            persona_prompt: policy
                .get("persona_prompt")
                .and_then(|v| v.as_str())
                .unwrap_or(&defaults.persona_prompt)
                .to_string(),
            greeting: policy
                .get("greeting")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            fallback_reply: policy
                .get("fallback_reply")
                .and_then(|v| v.as_str())
                .unwrap_or(&defaults.fallback_reply)
                .to_string(),
            history_turns: policy
                .get("history_turns")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_HISTORY_TURNS),
            blocked_keywords: str_list("blocked_keywords"),
            escalation_keywords: {
                let listed = str_list("escalation_keywords");
                if listed.is_empty() {
                    defaults.escalation_keywords
                } else {
                    listed
                }
            },
            quiet_hours,
            require_audit: policy
                .get("require_audit")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            allowed_actions: str_list("allowed_actions"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub document: PolicyDocument,
    pub version: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDecision {
    pub allow: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allow: true,
            reason: None,
        }
    }

    fn deny(reason: &str) -> Self {
        Self {
            allow: false,
            reason: Some(reason.to_string()),
        }
    }
}

/// Evaluate an inbound message against the tenant policy.
pub fn evaluate(document: &PolicyDocument, message: &str, now: DateTime<Utc>) -> PolicyDecision {
    let current = now.time();
    for window in &document.quiet_hours {
        let inside = if window.start <= window.end {
            current >= window.start && current <= window.end
        } else {
            current >= window.start || current <= window.end
        };
        if inside {
            return PolicyDecision::deny("quiet_hours");
        }
    }

    let lowered = message.to_lowercase();
    for keyword in &document.blocked_keywords {
        if lowered.contains(keyword) {
            return PolicyDecision::deny("keyword_block");
        }
    }

    PolicyDecision::allow()
}

struct CacheSlot {
    resolved: ResolvedPolicy,
    loaded_at: Instant,
}

pub struct PolicyStore {
    pool: DbPool,
    ttl: Duration,
    cache: Arc<RwLock<HashMap<Uuid, CacheSlot>>>,
}

impl PolicyStore {
    pub fn new(pool: DbPool, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn resolve(&self, tenant_id: Uuid) -> AppResult<ResolvedPolicy> {
        {
            let cache = self.cache.read().await;
            if let Some(slot) = cache.get(&tenant_id) {
                if slot.loaded_at.elapsed() < self.ttl {
                    return Ok(slot.resolved.clone());
                }
            }
        }

        let resolved = self.load(tenant_id)?;
        let mut cache = self.cache.write().await;
        cache.insert(
            tenant_id,
            CacheSlot {
                resolved: resolved.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(resolved)
    }

    /// Called when a policy is published so the next request sees it.
    pub async fn invalidate(&self, tenant_id: Uuid) {
        let mut cache = self.cache.write().await;
        cache.remove(&tenant_id);
        debug!("policy cache invalidated for tenant {}", tenant_id);
    }

    fn load(&self, tenant_id: Uuid) -> AppResult<ResolvedPolicy> {
        let mut conn = self.pool.get()?;
        let published: Option<PolicyVersion> = policy_versions::table
            .filter(policy_versions::tenant_id.eq(tenant_id))
            .filter(policy_versions::status.eq(PolicyStatus::Published.as_str()))
            .order(policy_versions::version.desc())
            .first(&mut conn)
            .optional()?;

        Ok(match published {
            Some(row) => ResolvedPolicy {
                document: PolicyDocument::from_json(&row.policy),
                version: Some(row.version),
            },
            None => ResolvedPolicy {
                document: PolicyDocument::default(),
                version: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn default_policy_is_conservative() {
        let document = PolicyDocument::default();
        assert!(document.fallback_reply.contains("human"));
        assert!(document.allowed_actions.is_empty());
        assert_eq!(document.history_turns, DEFAULT_HISTORY_TURNS);
    }

    #[test]
    fn from_json_reads_fields_with_defaults() {
        let document = PolicyDocument::from_json(&serde_json::json!({
            "persona_prompt": "You are the Acme helper.",
            "blocked_keywords": ["Refund"],
            "history_turns": 10,
            "require_audit": true,
        }));
        assert_eq!(document.persona_prompt, "You are the Acme helper.");
        assert_eq!(document.blocked_keywords, vec!["refund"]);
        assert_eq!(document.history_turns, 10);
        assert!(document.require_audit);
        assert!(!document.fallback_reply.is_empty());
    }

    #[test]
    fn keyword_block_denies() {
        let document = PolicyDocument::from_json(&serde_json::json!({
            "blocked_keywords": ["lawsuit"],
        }));
        let now = Utc::now();
        assert!(evaluate(&document, "tell me about shipping", now).allow);
        let decision = evaluate(&document, "I will file a LAWSUIT", now);
        assert!(!decision.allow);
        assert_eq!(decision.reason.as_deref(), Some("keyword_block"));
    }

    #[test]
    fn quiet_hours_wrap_midnight() {
        let document = PolicyDocument::from_json(&serde_json::json!({
            "quiet_hours": [{"start": "22:00", "end": "06:00"}],
        }));
        let late = Utc.with_ymd_and_hms(2025, 1, 1, 23, 30, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2025, 1, 1, 5, 0, 0).unwrap();
        let midday = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        assert!(!evaluate(&document, "hi", late).allow);
        assert!(!evaluate(&document, "hi", early).allow);
        assert!(evaluate(&document, "hi", midday).allow);
    }

    #[test]
    fn malformed_quiet_hours_are_skipped() {
        let document = PolicyDocument::from_json(&serde_json::json!({
            "quiet_hours": [{"start": "not-a-time", "end": "06:00"}],
        }));
        assert!(document.quiet_hours.is_empty());
    }
}
