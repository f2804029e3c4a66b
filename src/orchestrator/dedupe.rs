//! Inbound event deduplication.
//!
//! `event_id` is the idempotency key. A short-lived seen-set short-circuits
//! webhook replays with the previously produced ack; an in-progress marker
//! makes concurrent duplicates wait instead of double-processing.

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;

use crate::shared::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SeenEntry {
    payload_hash: String,
    #[serde(default)]
    conversation_id: Option<Uuid>,
    #[serde(default)]
    delivery_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// First sighting; the caller owns processing.
    New,
    /// Same event already produced an ack; return it unchanged.
    Duplicate {
        conversation_id: Uuid,
        delivery_id: Uuid,
    },
    /// Another request is mid-pipeline for this event.
    InProgress,
}

pub struct EventDeduper {
    redis: ConnectionManager,
    ttl: Duration,
}

impl EventDeduper {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self { redis, ttl }
    }

    fn key(event_id: &str) -> String {
        format!("inbound:seen:{}", event_id)
    }

    pub fn payload_hash(payload: &serde_json::Value) -> String {
        let canonical = serde_json::to_string(payload).unwrap_or_default();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Attempt to claim the event. A replay with a different payload under
    /// the same id is an idempotency collision and surfaces as a conflict.
    pub async fn claim(&self, event_id: &str, payload_hash: &str) -> AppResult<ClaimOutcome> {
        let entry = SeenEntry {
            payload_hash: payload_hash.to_string(),
            conversation_id: None,
            delivery_id: None,
        };
        let body = serde_json::to_string(&entry).unwrap_or_default();
        let mut conn = self.redis.clone();

        let was_set: bool = redis::cmd("SET")
            .arg(Self::key(event_id))
            .arg(&body)
            .arg("NX")
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async::<Option<String>>(&mut conn)
            .await?
            .is_some();
        if was_set {
            return Ok(ClaimOutcome::New);
        }

        let existing: Option<String> = redis::cmd("GET")
            .arg(Self::key(event_id))
            .query_async(&mut conn)
            .await?;
        let Some(raw) = existing else {
            // Entry expired between SET NX and GET; treat as fresh.
            return Ok(ClaimOutcome::New);
        };
        let seen: SeenEntry = serde_json::from_str(&raw)
            .map_err(|e| AppError::Transient(format!("corrupt dedupe entry: {}", e)))?;

        if seen.payload_hash != payload_hash {
            return Err(AppError::Conflict(format!(
                "event {} replayed with a different payload",
                event_id
            )));
        }
        match (seen.conversation_id, seen.delivery_id) {
            (Some(conversation_id), Some(delivery_id)) => Ok(ClaimOutcome::Duplicate {
                conversation_id,
                delivery_id,
            }),
            _ => Ok(ClaimOutcome::InProgress),
        }
    }

    /// Record the produced ack so replays can return it.
    pub async fn complete(
        &self,
        event_id: &str,
        payload_hash: &str,
        conversation_id: Uuid,
        delivery_id: Uuid,
    ) -> AppResult<()> {
        let entry = SeenEntry {
            payload_hash: payload_hash.to_string(),
            conversation_id: Some(conversation_id),
            delivery_id: Some(delivery_id),
        };
        let body = serde_json::to_string(&entry).unwrap_or_default();
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::key(event_id))
            .arg(body)
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Drop the claim after a pipeline failure so the provider's retry can
    /// run the event again.
    pub async fn release(&self, event_id: &str) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(Self::key(event_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_hash_is_stable_and_sensitive() {
        let a = serde_json::json!({"event_id": "e1", "message": "hi"});
        let b = serde_json::json!({"event_id": "e1", "message": "hi"});
        let c = serde_json::json!({"event_id": "e1", "message": "bye"});
        assert_eq!(EventDeduper::payload_hash(&a), EventDeduper::payload_hash(&b));
        assert_ne!(EventDeduper::payload_hash(&a), EventDeduper::payload_hash(&c));
    }
}
