//! Ingestion worker: claims jobs from the durable queue, runs the pipeline,
//! and owns job/asset status transitions.
//!
//! queued -> running -> (succeeded | failed | cancelled). Transient failures
//! leave the claim unacked so the visibility timeout redelivers it; the
//! attempt counter decides when a job is poisoned and dead-letters.

pub mod pipeline;
pub mod queue;

use diesel::prelude::*;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::shared::error::{AppError, AppResult};
use crate::shared::events::DomainEvent;
use crate::shared::models::{
    ingestion_jobs, knowledge_assets, AssetStatus, IngestionJob, JobStatus,
};
use crate::shared::state::AppState;

use pipeline::IngestionPipeline;
use queue::{heartbeat_interval, ClaimedJob, IngestQueue};

const MAX_CONCURRENT_JOBS: usize = 4;

pub struct IngestionWorker {
    state: Arc<AppState>,
    queue: IngestQueue,
    consumer: String,
    slots: Arc<Semaphore>,
}

impl IngestionWorker {
    pub fn new(state: Arc<AppState>) -> Arc<Self> {
        let queue = IngestQueue::new(state.redis.clone());
        Arc::new(Self {
            state,
            queue,
            consumer: format!("ingestion-{}", Uuid::new_v4()),
            slots: Arc::new(Semaphore::new(MAX_CONCURRENT_JOBS)),
        })
    }

    pub async fn run(self: Arc<Self>) -> AppResult<()> {
        self.queue.ensure_group().await?;
        info!("ingestion worker {} started", self.consumer);

        loop {
            match self.queue.reclaim_stale(&self.consumer).await {
                Ok(stale) => {
                    for claim in stale {
                        warn!("reclaimed stale ingest claim {}", claim.stream_id);
                        self.clone().spawn_job(claim).await;
                    }
                }
                Err(e) => warn!("stale reclaim failed: {}", e),
            }

            match self.queue.claim(&self.consumer, 5_000).await {
                Ok(Some(claim)) => self.clone().spawn_job(claim).await,
                Ok(None) => {}
                Err(e) => {
                    warn!("ingest claim failed: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }

            if let Ok(depth) = self.queue.depth().await {
                self.state
                    .metrics
                    .set_gauge("ingest_queue_depth", depth as i64)
                    .await;
            }
        }
    }

    async fn spawn_job(self: Arc<Self>, claim: ClaimedJob) {
        let permit = match Arc::clone(&self.slots).acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        tokio::spawn(async move {
            let _permit = permit;
            self.process_claim(claim).await;
        });
    }

    async fn process_claim(&self, claim: ClaimedJob) {
        // Heartbeats keep the claim alive for the duration of the pipeline.
        let heartbeat_queue = self.queue.clone();
        let heartbeat_consumer = self.consumer.clone();
        let heartbeat_stream_id = claim.stream_id.clone();
        let heartbeat = tokio::spawn(async move {
            let mut tick = tokio::time::interval(heartbeat_interval());
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = heartbeat_queue
                    .heartbeat(&heartbeat_consumer, &heartbeat_stream_id)
                    .await
                {
                    warn!("heartbeat for {} failed: {}", heartbeat_stream_id, e);
                }
            }
        });

        let outcome = self.process_job(&claim).await;
        heartbeat.abort();

        if let Err(e) = outcome {
            error!("ingest claim {} handling failed: {}", claim.stream_id, e);
        }
    }

    async fn process_job(&self, claim: &ClaimedJob) -> AppResult<()> {
        let Some(job) = self.load_job(claim.job_id)? else {
            warn!("ingest job {} vanished, acking", claim.job_id);
            return self.queue.ack(&claim.stream_id).await;
        };
        let status = JobStatus::from_str(&job.status);
        if status.map(|s| s.is_terminal()).unwrap_or(false) {
            // Duplicate delivery of an already finished job.
            return self.queue.ack(&claim.stream_id).await;
        }

        let max_attempts = self.state.config.runtime.ingest_max_attempts as i32;
        if job.attempts >= max_attempts {
            return self.poison(claim, &job, "retry budget exhausted").await;
        }

        let job = self.mark_running(&job)?;
        let started = std::time::Instant::now();

        match IngestionPipeline::new(&self.state).run(&job).await {
            Ok(stats) => {
                self.mark_succeeded(&job, stats.total_chunks)?;
                self.state.metrics.incr("ingest_jobs_succeeded").await;
                self.state
                    .metrics
                    .observe_latency("ingest_job_latency", started.elapsed().as_millis() as u64)
                    .await;
                self.queue.ack(&claim.stream_id).await
            }
            Err(AppError::Permanent(reason)) => {
                warn!("ingest job {} failed permanently: {}", job.id, reason);
                self.mark_failed(&job, &reason)?;
                self.state.metrics.incr("ingest_jobs_failed").await;
                self.emit_failure(&job, &reason).await;
                self.queue.ack(&claim.stream_id).await
            }
            Err(e) => {
                self.state.metrics.incr("ingest_jobs_retried").await;
                if job.attempts >= max_attempts {
                    self.poison(claim, &job, &e.to_string()).await
                } else {
                    warn!(
                        "ingest job {} attempt {} hit transient failure, requeueing: {}",
                        job.id, job.attempts, e
                    );
                    // Back to queued; the unacked claim redelivers after the
                    // visibility timeout, which doubles as backoff.
                    self.mark_queued(&job)?;
                    Ok(())
                }
            }
        }
    }

    async fn poison(&self, claim: &ClaimedJob, job: &IngestionJob, reason: &str) -> AppResult<()> {
        error!("ingest job {} poisoned: {}", job.id, reason);
        self.mark_failed(job, reason)?;
        self.queue.dead_letter(job.id, reason).await?;
        self.state.metrics.incr("ingest_jobs_dead_lettered").await;
        self.emit_failure(job, reason).await;
        self.queue.ack(&claim.stream_id).await
    }

    async fn emit_failure(&self, job: &IngestionJob, reason: &str) {
        self.state
            .events
            .publish_best_effort(
                &DomainEvent::new(
                    "ingestion.failed",
                    job.tenant_id,
                    serde_json::json!({
                        "job_id": job.id,
                        "asset_id": job.asset_id,
                        "reason": reason,
                    }),
                )
                .with_brand(job.brand_id),
            )
            .await;
    }

    fn load_job(&self, job_id: Uuid) -> AppResult<Option<IngestionJob>> {
        let mut conn = self.state.conn.get()?;
        Ok(ingestion_jobs::table
            .find(job_id)
            .first(&mut conn)
            .optional()?)
    }

    fn mark_running(&self, job: &IngestionJob) -> AppResult<IngestionJob> {
        let mut conn = self.state.conn.get()?;
        let updated = conn.transaction::<IngestionJob, diesel::result::Error, _>(|conn| {
            let updated: IngestionJob = diesel::update(ingestion_jobs::table.find(job.id))
                .set((
                    ingestion_jobs::status.eq(JobStatus::Running.as_str()),
                    ingestion_jobs::attempts.eq(job.attempts + 1),
                    ingestion_jobs::updated_at.eq(diesel::dsl::now),
                ))
                .get_result(conn)?;
            diesel::update(knowledge_assets::table.find(job.asset_id))
                .set(knowledge_assets::status.eq(AssetStatus::Processing.as_str()))
                .execute(conn)?;
            Ok(updated)
        })?;
        Ok(updated)
    }

    fn mark_queued(&self, job: &IngestionJob) -> AppResult<()> {
        let mut conn = self.state.conn.get()?;
        diesel::update(ingestion_jobs::table.find(job.id))
            .set((
                ingestion_jobs::status.eq(JobStatus::Queued.as_str()),
                ingestion_jobs::updated_at.eq(diesel::dsl::now),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn mark_succeeded(&self, job: &IngestionJob, total_chunks: usize) -> AppResult<()> {
        let mut conn = self.state.conn.get()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::update(ingestion_jobs::table.find(job.id))
                .set((
                    ingestion_jobs::status.eq(JobStatus::Succeeded.as_str()),
                    ingestion_jobs::total_chunks.eq(total_chunks as i32),
                    ingestion_jobs::processed_chunks.eq(total_chunks as i32),
                    ingestion_jobs::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;
            diesel::update(knowledge_assets::table.find(job.asset_id))
                .set(knowledge_assets::status.eq(AssetStatus::Ready.as_str()))
                .execute(conn)?;
            Ok(())
        })?;
        info!("ingest job {} succeeded ({} chunks)", job.id, total_chunks);
        Ok(())
    }

    fn mark_failed(&self, job: &IngestionJob, reason: &str) -> AppResult<()> {
        let mut conn = self.state.conn.get()?;
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::update(ingestion_jobs::table.find(job.id))
                .set((
                    ingestion_jobs::status.eq(JobStatus::Failed.as_str()),
                    ingestion_jobs::failure_reason.eq(Some(reason)),
                    ingestion_jobs::updated_at.eq(diesel::dsl::now),
                ))
                .execute(conn)?;
            diesel::update(knowledge_assets::table.find(job.asset_id))
                .set(knowledge_assets::status.eq(AssetStatus::Failed.as_str()))
                .execute(conn)?;
            Ok(())
        })?;
        Ok(())
    }
}
