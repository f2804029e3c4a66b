//! Durable ingest queue on a Redis stream with consumer-group semantics.
//!
//! A claimed entry stays pending until acked; heartbeats reset its idle time
//! so a healthy worker keeps its claim, while entries idle past the
//! visibility timeout are reclaimed by whichever worker polls next.

use log::warn;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::time::Duration;
use uuid::Uuid;

use crate::shared::error::AppResult;

pub const INGEST_STREAM: &str = "ingest:jobs";
pub const CONSUMER_GROUP: &str = "ingestion";
const DEAD_LETTER_STREAM: &str = "ingest:jobs:dead";

/// Default visibility timeout before an unacked claim is up for grabs.
pub const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub stream_id: String,
    pub job_id: Uuid,
}

#[derive(Clone)]
pub struct IngestQueue {
    redis: ConnectionManager,
}

impl IngestQueue {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    pub async fn ensure_group(&self) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let result: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(INGEST_STREAM, CONSUMER_GROUP, "$")
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn enqueue(&self, job_id: Uuid) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("XADD")
            .arg(INGEST_STREAM)
            .arg("*")
            .arg("job_id")
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Claim the next fresh entry, blocking up to `block_ms`.
    pub async fn claim(&self, consumer: &str, block_ms: usize) -> AppResult<Option<ClaimedJob>> {
        let mut conn = self.redis.clone();
        let options = StreamReadOptions::default()
            .group(CONSUMER_GROUP, consumer)
            .count(1)
            .block(block_ms);
        let reply: StreamReadReply = conn
            .xread_options(&[INGEST_STREAM], &[">"], &options)
            .await?;

        for stream in reply.keys {
            for entry in stream.ids {
                if let Some(job) = parse_entry(&entry.id, &entry.map) {
                    return Ok(Some(job));
                }
                warn!("malformed ingest entry {}, acking", entry.id);
                self.ack(&entry.id).await?;
            }
        }
        Ok(None)
    }

    /// Take over entries whose claim went stale (worker crashed or lost its
    /// heartbeat).
    pub async fn reclaim_stale(&self, consumer: &str) -> AppResult<Vec<ClaimedJob>> {
        let mut conn = self.redis.clone();
        let reply: redis::streams::StreamAutoClaimReply = redis::cmd("XAUTOCLAIM")
            .arg(INGEST_STREAM)
            .arg(CONSUMER_GROUP)
            .arg(consumer)
            .arg(VISIBILITY_TIMEOUT.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(10)
            .query_async(&mut conn)
            .await?;

        let mut claimed = Vec::new();
        for entry in reply.claimed {
            if let Some(job) = parse_entry(&entry.id, &entry.map) {
                claimed.push(job);
            } else {
                warn!("malformed reclaimed entry {}, acking", entry.id);
                self.ack(&entry.id).await?;
            }
        }
        Ok(claimed)
    }

    /// Reset the idle clock on a claim. Run every `VISIBILITY_TIMEOUT / 3`
    /// while a job is being processed.
    pub async fn heartbeat(&self, consumer: &str, stream_id: &str) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let _: redis::Value = redis::cmd("XCLAIM")
            .arg(INGEST_STREAM)
            .arg(CONSUMER_GROUP)
            .arg(consumer)
            .arg(0)
            .arg(stream_id)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn ack(&self, stream_id: &str) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn
            .xack(INGEST_STREAM, CONSUMER_GROUP, &[stream_id])
            .await?;
        let _: i64 = conn.xdel(INGEST_STREAM, &[stream_id]).await?;
        Ok(())
    }

    pub async fn dead_letter(&self, job_id: Uuid, reason: &str) -> AppResult<()> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("XADD")
            .arg(DEAD_LETTER_STREAM)
            .arg("*")
            .arg("job_id")
            .arg(job_id.to_string())
            .arg("reason")
            .arg(reason)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn depth(&self) -> AppResult<usize> {
        let mut conn = self.redis.clone();
        let len: usize = conn.xlen(INGEST_STREAM).await?;
        Ok(len)
    }
}

fn parse_entry(
    stream_id: &str,
    map: &std::collections::HashMap<String, redis::Value>,
) -> Option<ClaimedJob> {
    let redis::Value::BulkString(raw) = map.get("job_id")? else {
        return None;
    };
    let job_id = Uuid::parse_str(std::str::from_utf8(raw).ok()?).ok()?;
    Some(ClaimedJob {
        stream_id: stream_id.to_string(),
        job_id,
    })
}

/// Heartbeat cadence derived from the visibility timeout.
pub fn heartbeat_interval() -> Duration {
    VISIBILITY_TIMEOUT / 3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_a_third_of_visibility() {
        assert_eq!(heartbeat_interval(), Duration::from_secs(100));
    }

    #[test]
    fn parse_entry_requires_valid_uuid() {
        let mut map = std::collections::HashMap::new();
        map.insert(
            "job_id".to_string(),
            redis::Value::BulkString(b"not-a-uuid".to_vec()),
        );
        assert!(parse_entry("1-0", &map).is_none());

        let id = Uuid::new_v4();
        map.insert(
            "job_id".to_string(),
            redis::Value::BulkString(id.to_string().into_bytes()),
        );
        let parsed = parse_entry("1-0", &map).unwrap();
        assert_eq!(parsed.job_id, id);
        assert_eq!(parsed.stream_id, "1-0");
    }
}
