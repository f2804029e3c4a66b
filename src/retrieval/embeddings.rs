//! Embedding providers behind a primary/fallback pair of HTTP endpoints.

use log::{debug, warn};
use serde::Deserialize;
use std::time::Duration;

use crate::config::{EmbeddingConfig, EmbeddingProviderKind};
use crate::shared::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct EmbeddingService {
    http: reqwest::Client,
    config: EmbeddingConfig,
}

impl EmbeddingService {
    pub fn new(http: reqwest::Client, config: EmbeddingConfig) -> Self {
        Self { http, config }
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    /// Embed a batch of texts, falling back to the secondary provider when
    /// the active one fails. Both failing is a transient error; callers in
    /// the message pipeline degrade to empty context instead of failing.
    pub async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let (first, second) = self.provider_order();
        match self.embed_with(first, texts).await {
            Ok(vectors) => Ok(vectors),
            Err(primary_err) => {
                let Some(second) = second else {
                    return Err(primary_err);
                };
                warn!(
                    "embedding provider {} failed ({}), trying fallback",
                    first, primary_err
                );
                self.embed_with(second, texts).await
            }
        }
    }

    fn provider_order(&self) -> (&str, Option<&str>) {
        match self.config.provider {
            EmbeddingProviderKind::Primary => (
                self.config.primary_url.as_str(),
                self.config.fallback_url.as_deref(),
            ),
            EmbeddingProviderKind::Fallback => match self.config.fallback_url.as_deref() {
                Some(fallback) => (fallback, Some(self.config.primary_url.as_str())),
                None => (self.config.primary_url.as_str(), None),
            },
        }
    }

    async fn embed_with(&self, base_url: &str, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let mut request = self
            .http
            .post(&url)
            .timeout(Duration::from_secs(30))
            .json(&body);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("embedding request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            let message = format!("embedding provider returned {}", status);
            return Err(if retryable {
                AppError::Transient(message)
            } else {
                AppError::Permanent(message)
            });
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| AppError::Transient(format!("embedding response unreadable: {}", e)))?;
        if parsed.data.len() != texts.len() {
            return Err(AppError::Transient(format!(
                "embedding count mismatch: sent {}, received {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        debug!("embedded {} texts via {}", texts.len(), base_url);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: EmbeddingProviderKind, fallback: Option<&str>) -> EmbeddingConfig {
        EmbeddingConfig {
            provider,
            api_key: String::new(),
            primary_url: "http://primary".into(),
            fallback_url: fallback.map(|s| s.to_string()),
            model: "test-model".into(),
            batch_size: 64,
        }
    }

    #[test]
    fn provider_order_honours_configured_active() {
        let service = EmbeddingService::new(
            reqwest::Client::new(),
            config(EmbeddingProviderKind::Primary, Some("http://fallback")),
        );
        let (first, second) = service.provider_order();
        assert_eq!(first, "http://primary");
        assert_eq!(second, Some("http://fallback"));

        let service = EmbeddingService::new(
            reqwest::Client::new(),
            config(EmbeddingProviderKind::Fallback, Some("http://fallback")),
        );
        let (first, second) = service.provider_order();
        assert_eq!(first, "http://fallback");
        assert_eq!(second, Some("http://primary"));
    }

    #[tokio::test]
    async fn empty_input_short_circuits() {
        let service = EmbeddingService::new(
            reqwest::Client::new(),
            config(EmbeddingProviderKind::Primary, None),
        );
        let vectors = service.embed(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }
}
