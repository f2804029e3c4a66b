//! Process-wide service wiring.
//!
//! All singletons are composed at startup in `main` and passed through as an
//! `Arc<AppState>`; nothing reaches for globals.

use std::sync::Arc;

use aws_sdk_s3::Client as S3Client;
use redis::aio::ConnectionManager;

use crate::config::AppConfig;
use crate::llm::LlmProvider;
use crate::orchestrator::dedupe::EventDeduper;
use crate::orchestrator::policy::PolicyStore;
use crate::orchestrator::publish::OutboundPublisher;
use crate::retrieval::embeddings::EmbeddingService;
use crate::retrieval::vector_store::VectorStoreClient;

use super::events::EventBus;
use super::metrics::MetricsCollector;
use super::utils::DbPool;

pub struct AppState {
    pub config: AppConfig,
    pub conn: DbPool,
    pub redis: ConnectionManager,
    pub s3: Option<S3Client>,
    pub http: reqwest::Client,
    pub metrics: Arc<MetricsCollector>,
    pub events: EventBus,
    pub policies: Arc<PolicyStore>,
    pub vectors: Arc<VectorStoreClient>,
    pub embeddings: Arc<EmbeddingService>,
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub publisher: Arc<OutboundPublisher>,
    pub deduper: Arc<EventDeduper>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
            redis: self.redis.clone(),
            s3: self.s3.clone(),
            http: self.http.clone(),
            metrics: Arc::clone(&self.metrics),
            events: self.events.clone(),
            policies: Arc::clone(&self.policies),
            vectors: Arc::clone(&self.vectors),
            embeddings: Arc::clone(&self.embeddings),
            llm: self.llm.clone(),
            publisher: Arc::clone(&self.publisher),
            deduper: Arc::clone(&self.deduper),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("conn", &"DbPool")
            .field("redis", &"ConnectionManager")
            .field("s3", &self.s3.is_some())
            .field("llm", &self.llm.is_some())
            .finish_non_exhaustive()
    }
}
