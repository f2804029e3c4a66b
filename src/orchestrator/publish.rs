//! Outbound stream publisher.
//!
//! Publishing happens strictly after the database commit. A failed publish
//! parks the record in a Redis-backed retry queue drained by a background
//! task; the outbound worker dedupes on `delivery_id`, so duplicates from
//! recovery are harmless.

use log::{error, info, warn};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use crate::shared::error::{AppError, AppResult};
use crate::shared::metrics::MetricsCollector;
use crate::shared::models::OutboundRecord;

pub const OUTBOUND_STREAM: &str = "outbound:messages";
const PUBLISH_RETRY_QUEUE: &str = "outbound:publish:retry";
const RETRY_DRAIN_INTERVAL: Duration = Duration::from_secs(5);

pub struct OutboundPublisher {
    redis: ConnectionManager,
    metrics: Arc<MetricsCollector>,
}

impl OutboundPublisher {
    pub fn new(redis: ConnectionManager, metrics: Arc<MetricsCollector>) -> Self {
        Self { redis, metrics }
    }

    pub async fn publish(&self, record: &OutboundRecord, correlation_id: &str) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let body = serde_json::to_string(record)
            .map_err(|e| AppError::Permanent(format!("unserializable outbound record: {}", e)))?;
        let _: String = redis::cmd("XADD")
            .arg(OUTBOUND_STREAM)
            .arg("*")
            .arg("partition_key")
            .arg(record.partition_key())
            .arg("correlation_id")
            .arg(correlation_id)
            .arg("body")
            .arg(body)
            .query_async(&mut conn)
            .await?;
        self.metrics.incr("outbound_published").await;
        Ok(())
    }

    /// Publish, parking the record for the drain task when the stream is
    /// unavailable. Only called after the transcript is committed, so the
    /// record must not be lost.
    pub async fn publish_or_park(&self, record: &OutboundRecord, correlation_id: &str) {
        if let Err(e) = self.publish(record, correlation_id).await {
            warn!(
                "publish failed for delivery {}, parking for retry: {}",
                record.delivery_id, e
            );
            if let Err(park_err) = self.park(record, correlation_id).await {
                error!(
                    "failed to park delivery {}: {}",
                    record.delivery_id, park_err
                );
            }
        }
    }

    async fn park(&self, record: &OutboundRecord, correlation_id: &str) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let entry = serde_json::json!({
            "record": record,
            "correlation_id": correlation_id,
        });
        let _: i64 = conn
            .rpush(PUBLISH_RETRY_QUEUE, entry.to_string())
            .await?;
        self.metrics.incr("outbound_publish_parked").await;
        Ok(())
    }

    /// Background drain of parked publishes.
    pub fn spawn_retry_drain(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RETRY_DRAIN_INTERVAL);
            loop {
                tick.tick().await;
                if let Err(e) = self.drain_once().await {
                    warn!("outbound publish retry drain failed: {}", e);
                }
            }
        })
    }

    async fn drain_once(&self) -> AppResult<()> {
        let mut conn = self.redis.clone();
        loop {
            let raw: Option<String> = conn.lpop(PUBLISH_RETRY_QUEUE, None).await?;
            let Some(raw) = raw else {
                return Ok(());
            };
            let parsed: serde_json::Value = match serde_json::from_str(&raw) {
                Ok(v) => v,
                Err(e) => {
                    error!("dropping malformed parked publish: {}", e);
                    continue;
                }
            };
            let record: OutboundRecord =
                match serde_json::from_value(parsed["record"].clone()) {
                    Ok(r) => r,
                    Err(e) => {
                        error!("dropping malformed parked record: {}", e);
                        continue;
                    }
                };
            let correlation_id = parsed["correlation_id"].as_str().unwrap_or("").to_string();
            if let Err(e) = self.publish(&record, &correlation_id).await {
                // Still down; push it back and stop this round.
                warn!("stream still unavailable, re-parking: {}", e);
                let _: i64 = conn.rpush(PUBLISH_RETRY_QUEUE, raw).await?;
                return Ok(());
            }
            info!("recovered parked delivery {}", record.delivery_id);
        }
    }
}
