//! Forwarding of normalized events to the orchestrator, with a durable
//! local retry buffer for transient orchestrator outages.
//!
//! Buffered events are keyed by `event_id` and drained with exponential
//! backoff; the orchestrator treats repeats of the same event as the same
//! event, so a forward that raced a timeout is harmless.

use chrono::Utc;
use log::{info, warn};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use crate::shared::error::{AppError, AppResult};
use crate::shared::metrics::MetricsCollector;
use crate::shared::models::InboundMessage;
use crate::shared::retry::BackoffSchedule;

const RETRY_ZSET: &str = "gateway:inbound:retry";
const RETRY_BODY_HASH: &str = "gateway:inbound:retry:payload";
const DEAD_LETTER_STREAM: &str = "gateway:inbound:dead";
const BUFFER_CAPACITY: usize = 10_000;
const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ForwardOutcome {
    Accepted,
    Buffered,
}

pub struct InboundForwarder {
    http: reqwest::Client,
    redis: ConnectionManager,
    orchestrator_url: String,
    schedule: BackoffSchedule,
    metrics: Arc<MetricsCollector>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct BufferedEvent {
    message: InboundMessage,
    correlation_id: String,
    attempt: u32,
}

impl InboundForwarder {
    pub fn new(
        http: reqwest::Client,
        redis: ConnectionManager,
        orchestrator_url: String,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            http,
            redis,
            orchestrator_url,
            schedule: BackoffSchedule::default(),
            metrics,
        }
    }

    /// Forward once; buffer on transient failure. The caller acks 202 for
    /// both outcomes.
    pub async fn forward_or_buffer(
        &self,
        message: InboundMessage,
        correlation_id: &str,
    ) -> AppResult<ForwardOutcome> {
        match self.try_forward(&message, correlation_id).await {
            Ok(()) => Ok(ForwardOutcome::Accepted),
            Err(e) if e.is_retryable() => {
                warn!(
                    "orchestrator unavailable for event {}, buffering: {}",
                    message.event_id, e
                );
                self.buffer(message, correlation_id, 1).await?;
                Ok(ForwardOutcome::Buffered)
            }
            Err(e) => {
                // Terminal responses (validation, conflict) are logged and
                // swallowed; the provider cannot fix them by retrying.
                warn!(
                    "orchestrator rejected event terminally (correlation {}): {}",
                    correlation_id, e
                );
                Ok(ForwardOutcome::Accepted)
            }
        }
    }

    async fn try_forward(&self, message: &InboundMessage, correlation_id: &str) -> AppResult<()> {
        let url = format!(
            "{}/v1/messages/inbound",
            self.orchestrator_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .header("x-request-id", correlation_id)
            .timeout(Duration::from_secs(10))
            .json(message)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("orchestrator unreachable: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message_body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(AppError::Transient(format!(
                "orchestrator returned {}: {}",
                status, message_body
            )))
        } else {
            Err(AppError::Permanent(format!(
                "orchestrator returned {}: {}",
                status, message_body
            )))
        }
    }

    async fn buffer(
        &self,
        message: InboundMessage,
        correlation_id: &str,
        attempt: u32,
    ) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let depth: usize = conn.zcard(RETRY_ZSET).await?;
        if depth >= BUFFER_CAPACITY {
            self.metrics.incr("gateway_buffer_full").await;
            return Err(AppError::Transient("inbound retry buffer full".into()));
        }

        let event_id = message.event_id.clone();
        let entry = BufferedEvent {
            message,
            correlation_id: correlation_id.to_string(),
            attempt,
        };
        let due = Utc::now().timestamp_millis()
            + self.schedule.delay_for(attempt).as_millis() as i64;
        let body = serde_json::to_string(&entry)
            .map_err(|e| AppError::Permanent(format!("unserializable event: {}", e)))?;

        let _: () = conn.hset(RETRY_BODY_HASH, &event_id, body).await?;
        let _: () = conn.zadd(RETRY_ZSET, &event_id, due).await?;
        self.metrics.incr("gateway_buffered_events").await;
        Ok(())
    }

    /// Background drain loop for the retry buffer.
    pub fn spawn_drain(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DRAIN_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(e) = self.drain_due().await {
                    warn!("gateway retry drain failed: {}", e);
                }
            }
        })
    }

    async fn drain_due(&self) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(RETRY_ZSET)
            .arg("-inf")
            .arg(now)
            .arg("LIMIT")
            .arg(0)
            .arg(50)
            .query_async(&mut conn)
            .await?;

        for event_id in due {
            let raw: Option<String> = conn.hget(RETRY_BODY_HASH, &event_id).await?;
            let Some(raw) = raw else {
                let _: i64 = conn.zrem(RETRY_ZSET, &event_id).await?;
                continue;
            };
            let entry: BufferedEvent = match serde_json::from_str(&raw) {
                Ok(e) => e,
                Err(e) => {
                    warn!("dropping malformed buffered event {}: {}", event_id, e);
                    self.remove(&mut conn, &event_id).await?;
                    continue;
                }
            };

            match self.try_forward(&entry.message, &entry.correlation_id).await {
                Ok(()) => {
                    info!("buffered event {} delivered on retry", event_id);
                    self.metrics.incr("gateway_buffer_recovered").await;
                    self.remove(&mut conn, &event_id).await?;
                }
                Err(e) if e.is_retryable() && !self.schedule.exhausted(entry.attempt) => {
                    let next_attempt = entry.attempt + 1;
                    let due = Utc::now().timestamp_millis()
                        + self.schedule.delay_for(next_attempt).as_millis() as i64;
                    let updated = BufferedEvent {
                        attempt: next_attempt,
                        ..entry
                    };
                    let body = serde_json::to_string(&updated).unwrap_or(raw);
                    let _: () = conn.hset(RETRY_BODY_HASH, &event_id, body).await?;
                    let _: () = conn.zadd(RETRY_ZSET, &event_id, due).await?;
                }
                Err(e) => {
                    warn!(
                        "buffered event {} exhausted retries, dead-lettering: {}",
                        event_id, e
                    );
                    self.metrics.incr("gateway_buffer_dead_lettered").await;
                    let _: String = redis::cmd("XADD")
                        .arg(DEAD_LETTER_STREAM)
                        .arg("*")
                        .arg("event_id")
                        .arg(&event_id)
                        .arg("body")
                        .arg(&raw)
                        .arg("reason")
                        .arg(e.to_string())
                        .query_async(&mut conn)
                        .await?;
                    self.remove(&mut conn, &event_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, conn: &mut ConnectionManager, event_id: &str) -> AppResult<()> {
        let _: i64 = conn.zrem(RETRY_ZSET, event_id).await?;
        let _: i64 = conn.hdel(RETRY_BODY_HASH, event_id).await?;
        Ok(())
    }
}
