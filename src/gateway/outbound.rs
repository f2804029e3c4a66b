//! Channel gateway, outbound side: stream consumer dispatching replies to
//! provider adapters.
//!
//! Records sharing a `(channel_id, external_sender_id)` partition key are
//! routed to one in-process lane and delivered strictly in publish order;
//! distinct conversations fan out across lanes. Retries happen in-lane so
//! they cannot reorder a conversation.

use log::{error, info, warn};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::shared::audit::record_audit_best_effort;
use crate::shared::error::{AppError, AppResult};
use crate::shared::events::EventBus;
use crate::shared::models::{channels, Channel, ChannelType, OutboundRecord};
use crate::shared::retry::BackoffSchedule;
use crate::shared::state::AppState;

use super::adapters::{build_adapters, ChannelAdapter};
use crate::orchestrator::publish::OUTBOUND_STREAM;

const CONSUMER_GROUP: &str = "gateway-out";
const DEAD_LETTER_STREAM: &str = "outbound:dead";
const DELIVERED_KEY_TTL_SECS: u64 = 86_400;
const LANE_CAPACITY: usize = 128;
const READ_BLOCK_MS: usize = 1_000;
const READ_COUNT: usize = 16;

/// Channel rows cached for delivery, invalidated on secret rotation events.
pub struct CredentialCache {
    state: Arc<AppState>,
    ttl: Duration,
    cache: RwLock<HashMap<Uuid, (Channel, Instant)>>,
}

impl CredentialCache {
    pub fn new(state: Arc<AppState>) -> Self {
        let ttl = state.config.runtime.credential_cache_ttl;
        Self {
            state,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, channel_id: Uuid) -> AppResult<Channel> {
        {
            let cache = self.cache.read().await;
            if let Some((channel, loaded_at)) = cache.get(&channel_id) {
                if loaded_at.elapsed() < self.ttl {
                    return Ok(channel.clone());
                }
            }
        }

        use diesel::prelude::*;
        let mut conn = self.state.conn.get()?;
        let channel: Option<Channel> = channels::table
            .find(channel_id)
            .first(&mut conn)
            .optional()?;
        let Some(channel) = channel else {
            return Err(AppError::NotFound(format!(
                "channel {} not found",
                channel_id
            )));
        };

        let mut cache = self.cache.write().await;
        cache.insert(channel_id, (channel.clone(), Instant::now()));
        Ok(channel)
    }

    pub async fn invalidate(&self, channel_id: Uuid) {
        let mut cache = self.cache.write().await;
        cache.remove(&channel_id);
    }
}

struct LaneWork {
    stream_id: String,
    record: OutboundRecord,
}

pub struct OutboundWorker {
    state: Arc<AppState>,
    adapters: HashMap<ChannelType, Arc<dyn ChannelAdapter>>,
    credentials: Arc<CredentialCache>,
    lanes: Mutex<HashMap<String, mpsc::Sender<LaneWork>>>,
    consumer: String,
}

impl OutboundWorker {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        let adapters = build_adapters(&state.http);
        let credentials = Arc::new(CredentialCache::new(Arc::clone(&state)));
        Arc::new(Self {
            state,
            adapters,
            credentials,
            lanes: Mutex::new(HashMap::new()),
            consumer: format!("gateway-out-{}", Uuid::new_v4()),
        })
    }

    pub async fn run(self: Arc<Self>) -> AppResult<()> {
        self.ensure_group().await?;
        self.clone().spawn_rotation_listener();
        info!("outbound worker {} consuming {}", self.consumer, OUTBOUND_STREAM);

        // Pending entries from a previous crash of this consumer first.
        Arc::clone(&self).consume_round("0").await?;
        loop {
            Arc::clone(&self).consume_round(">").await?;
        }
    }

    async fn ensure_group(&self) -> AppResult<()> {
        let mut conn = self.state.redis.clone();
        let result: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(OUTBOUND_STREAM, CONSUMER_GROUP, "$")
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn consume_round(self: Arc<Self>, cursor: &str) -> AppResult<()> {
        let mut conn = self.state.redis.clone();
        let options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.consumer)
            .count(READ_COUNT)
            .block(READ_BLOCK_MS);
        let reply: StreamReadReply = conn
            .xread_options(&[OUTBOUND_STREAM], &[cursor], &options)
            .await?;

        for stream in reply.keys {
            for entry in stream.ids {
                let Some(redis::Value::BulkString(raw)) = entry.map.get("body") else {
                    warn!("outbound entry {} missing body, acking", entry.id);
                    self.ack(&entry.id).await;
                    continue;
                };
                let record: OutboundRecord = match serde_json::from_slice(raw) {
                    Ok(r) => r,
                    Err(e) => {
                        error!("malformed outbound record {}: {}", entry.id, e);
                        self.ack(&entry.id).await;
                        continue;
                    }
                };
                Arc::clone(&self).dispatch_to_lane(entry.id.clone(), record).await;
            }
        }
        Ok(())
    }

    /// Route a record to its conversation lane, creating the lane task on
    /// first use. Lane order equals stream order because this dispatcher is
    /// the only producer.
    async fn dispatch_to_lane(self: Arc<Self>, stream_id: String, record: OutboundRecord) {
        let key = record.partition_key();
        let work = LaneWork { stream_id, record };

        let mut lanes = self.lanes.lock().await;
        let work = if let Some(sender) = lanes.get(&key) {
            match sender.send(work).await {
                Ok(()) => return,
                // Lane task died; recreate it below and replay the work.
                Err(mpsc::error::SendError(work)) => {
                    lanes.remove(&key);
                    work
                }
            }
        } else {
            work
        };

        let (tx, rx) = mpsc::channel(LANE_CAPACITY);
        let worker = Arc::clone(&self);
        tokio::spawn(async move {
            worker.lane_loop(rx).await;
        });
        let _ = tx.send(work).await;
        lanes.insert(key, tx);
    }

    async fn lane_loop(self: Arc<Self>, mut rx: mpsc::Receiver<LaneWork>) {
        while let Some(work) = rx.recv().await {
            self.deliver(work).await;
        }
    }

    async fn deliver(&self, work: LaneWork) {
        let LaneWork { stream_id, record } = work;

        match self.already_delivered(record.delivery_id).await {
            Ok(true) => {
                self.state.metrics.incr("outbound_deduped").await;
                self.ack(&stream_id).await;
                return;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("delivery dedupe check failed, proceeding: {}", e);
            }
        }

        let schedule = BackoffSchedule::default()
            .with_max_attempts(self.state.config.runtime.outbound_max_attempts);
        let mut attempt = record.attempt.max(1);
        let started = Instant::now();

        loop {
            match self.send_once(&record).await {
                Ok(()) => {
                    self.mark_delivered(record.delivery_id).await;
                    self.state.metrics.incr("outbound_delivered").await;
                    self.state
                        .metrics
                        .observe_latency(
                            "outbound_delivery_latency",
                            started.elapsed().as_millis() as u64,
                        )
                        .await;
                    self.ack(&stream_id).await;
                    return;
                }
                Err(e) if e.is_retryable() && !schedule.exhausted(attempt) => {
                    warn!(
                        "delivery {} attempt {} failed: {}",
                        record.delivery_id, attempt, e
                    );
                    tokio::time::sleep(schedule.delay_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.dead_letter(&record, &e).await;
                    self.ack(&stream_id).await;
                    return;
                }
            }
        }
    }

    async fn send_once(&self, record: &OutboundRecord) -> AppResult<()> {
        let channel = self.credentials.get(record.channel_id).await?;
        let Some(channel_type) = ChannelType::from_str(&channel.channel_type) else {
            return Err(AppError::Permanent(format!(
                "channel {} has unknown type {}",
                channel.id, channel.channel_type
            )));
        };
        let Some(adapter) = self.adapters.get(&channel_type) else {
            return Err(AppError::Permanent(format!(
                "no adapter registered for {}",
                channel.channel_type
            )));
        };
        adapter.send(&channel, record).await
    }

    async fn dead_letter(&self, record: &OutboundRecord, cause: &AppError) {
        error!(
            "delivery {} exhausted, dead-lettering: {}",
            record.delivery_id, cause
        );
        self.state.metrics.incr("outbound_failed").await;
        let mut conn = self.state.redis.clone();
        let body = serde_json::to_string(record).unwrap_or_default();
        let result: Result<String, redis::RedisError> = redis::cmd("XADD")
            .arg(DEAD_LETTER_STREAM)
            .arg("*")
            .arg("body")
            .arg(body)
            .arg("reason")
            .arg(cause.to_string())
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            error!("failed to dead-letter delivery {}: {}", record.delivery_id, e);
        }
        // Audit trail for operator review.
        if let Ok(channel) = self.credentials.get(record.channel_id).await {
            record_audit_best_effort(
                &self.state.conn,
                Some(channel.tenant_id),
                "gateway-out",
                "outbound.failed",
                serde_json::json!({
                    "delivery_id": record.delivery_id,
                    "channel_id": record.channel_id,
                    "reason": cause.to_string(),
                }),
                None,
            );
        }
    }

    async fn already_delivered(&self, delivery_id: Uuid) -> AppResult<bool> {
        let mut conn = self.state.redis.clone();
        let exists: bool = conn
            .exists(format!("outbound:delivered:{}", delivery_id))
            .await?;
        Ok(exists)
    }

    async fn mark_delivered(&self, delivery_id: Uuid) {
        let mut conn = self.state.redis.clone();
        let result: Result<(), redis::RedisError> = conn
            .set_ex(
                format!("outbound:delivered:{}", delivery_id),
                1,
                DELIVERED_KEY_TTL_SECS,
            )
            .await;
        if let Err(e) = result {
            warn!("failed to mark delivery {}: {}", delivery_id, e);
        }
    }

    async fn ack(&self, stream_id: &str) {
        let mut conn = self.state.redis.clone();
        let result: Result<i64, redis::RedisError> = conn
            .xack(OUTBOUND_STREAM, CONSUMER_GROUP, &[stream_id])
            .await;
        if let Err(e) = result {
            warn!("failed to ack {}: {}", stream_id, e);
        }
    }

    /// Invalidate cached credentials when a channel secret rotates.
    fn spawn_rotation_listener(self: Arc<Self>) {
        let bus = EventBus::new(self.state.redis.clone());
        tokio::spawn(async move {
            let group = format!("gateway-creds-{}", Uuid::new_v4());
            if let Err(e) = bus.ensure_group(&group).await {
                warn!("credential listener could not create group: {}", e);
                return;
            }
            loop {
                match bus.read_batch(&group, "creds", 32, 5_000).await {
                    Ok(events) => {
                        for event in events {
                            if event.event != "channel.secret_rotated" {
                                continue;
                            }
                            if let Some(channel_id) = event
                                .payload
                                .get("channel_id")
                                .and_then(|v| v.as_str())
                                .and_then(|s| Uuid::parse_str(s).ok())
                            {
                                info!("invalidating credentials for channel {}", channel_id);
                                self.credentials.invalidate(channel_id).await;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("credential listener read failed: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });
    }
}
