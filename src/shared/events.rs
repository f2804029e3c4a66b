//! Domain event bus on a Redis stream.
//!
//! Producers: orchestrator (conversation + escalation events), admin surface
//! (policy publishes, secret rotations). Consumers: automation worker (event
//! triggers) and the outbound worker (credential cache invalidation).

use chrono::{DateTime, Utc};
use log::warn;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const EVENT_STREAM: &str = "events:domain";
const EVENT_STREAM_MAXLEN: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub event: String,
    pub tenant_id: Uuid,
    #[serde(default)]
    pub brand_id: Option<Uuid>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(event: &str, tenant_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event: event.to_string(),
            tenant_id,
            brand_id: None,
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_brand(mut self, brand_id: Uuid) -> Self {
        self.brand_id = Some(brand_id);
        self
    }
}

#[derive(Clone)]
pub struct EventBus {
    redis: ConnectionManager,
}

impl EventBus {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn publish(&self, event: &DomainEvent) -> Result<(), redis::RedisError> {
        let body = serde_json::to_string(event).unwrap_or_default();
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("XADD")
            .arg(EVENT_STREAM)
            .arg("MAXLEN")
            .arg("~")
            .arg(EVENT_STREAM_MAXLEN)
            .arg("*")
            .arg("event")
            .arg(&event.event)
            .arg("body")
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Publish without letting bus failures surface to the caller.
    pub async fn publish_best_effort(&self, event: &DomainEvent) {
        if let Err(e) = self.publish(event).await {
            warn!("failed to publish domain event {}: {}", event.event, e);
        }
    }

    pub async fn ensure_group(&self, group: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        let result: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(EVENT_STREAM, group, "$")
            .await;
        match result {
            Ok(()) => Ok(()),
            // BUSYGROUP means the group already exists.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Read a batch of events for the consumer group, blocking up to
    /// `block_ms`. Entries are acked immediately; event consumers tolerate
    /// loss because rules re-materialize from the database.
    pub async fn read_batch(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
    ) -> Result<Vec<DomainEvent>, redis::RedisError> {
        use redis::streams::{StreamReadOptions, StreamReadReply};

        let mut conn = self.redis.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        let reply: StreamReadReply = conn
            .xread_options(&[EVENT_STREAM], &[">"], &options)
            .await?;

        let mut events = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                if let Some(redis::Value::BulkString(raw)) = entry.map.get("body") {
                    match serde_json::from_slice::<DomainEvent>(raw) {
                        Ok(event) => events.push(event),
                        Err(e) => warn!("dropping malformed domain event {}: {}", entry.id, e),
                    }
                }
                let _: Result<i64, _> = conn.xack(EVENT_STREAM, group, &[&entry.id]).await;
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_round_trip() {
        let event = DomainEvent::new(
            "conversation.message_received",
            Uuid::new_v4(),
            serde_json::json!({"conversation_id": "abc"}),
        )
        .with_brand(Uuid::new_v4());
        let raw = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.event, event.event);
        assert_eq!(back.tenant_id, event.tenant_id);
        assert_eq!(back.brand_id, event.brand_id);
    }
}
