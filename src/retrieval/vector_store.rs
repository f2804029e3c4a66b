//! Vector store client over the Qdrant-compatible REST API.
//!
//! One collection per `(tenant_id, brand_id)`; namespaces are never mixed,
//! which makes tenant isolation a property of the key, not of a filter.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use crate::shared::error::{AppError, AppResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: Uuid,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    pub text: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: serde_json::Value,
    score: f32,
    #[serde(default)]
    payload: serde_json::Value,
}

pub struct VectorStoreClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl VectorStoreClient {
    pub fn new(http: reqwest::Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn collection_name(tenant_id: Uuid, brand_id: Uuid) -> String {
        format!("kb-{}-{}", tenant_id, brand_id)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .timeout(REQUEST_TIMEOUT);
        if let Some(ref key) = self.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    pub async fn ensure_collection(
        &self,
        tenant_id: Uuid,
        brand_id: Uuid,
        dimensions: usize,
    ) -> AppResult<()> {
        let name = Self::collection_name(tenant_id, brand_id);
        let body = json!({
            "vectors": { "size": dimensions, "distance": "Cosine" }
        });
        let response = self
            .request(reqwest::Method::PUT, &format!("/collections/{}", name))
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("vector store unreachable: {}", e)))?;

        // 409 means the collection already exists; treat as success.
        if response.status().is_success() || response.status().as_u16() == 409 {
            debug!("collection {} ready", name);
            Ok(())
        } else {
            Err(AppError::Transient(format!(
                "collection create failed with {}",
                response.status()
            )))
        }
    }

    pub async fn upsert(
        &self,
        tenant_id: Uuid,
        brand_id: Uuid,
        points: &[VectorPoint],
    ) -> AppResult<()> {
        if points.is_empty() {
            return Ok(());
        }
        let name = Self::collection_name(tenant_id, brand_id);
        let body = json!({
            "points": points
                .iter()
                .map(|p| json!({
                    "id": p.id,
                    "vector": p.vector,
                    "payload": p.payload,
                }))
                .collect::<Vec<_>>()
        });
        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{}/points?wait=true", name),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("vector upsert failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "vector upsert returned {}",
                response.status()
            )));
        }
        debug!("upserted {} vectors into {}", points.len(), name);
        Ok(())
    }

    pub async fn search(
        &self,
        tenant_id: Uuid,
        brand_id: Uuid,
        vector: &[f32],
        limit: usize,
        filters: &serde_json::Value,
    ) -> AppResult<Vec<VectorMatch>> {
        let name = Self::collection_name(tenant_id, brand_id);
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = build_filter(filters) {
            body["filter"] = filter;
        }
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/search", name),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("vector search failed: {}", e)))?;

        // A missing collection is an empty knowledge base, not an error.
        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(AppError::Transient(format!(
                "vector search returned {}",
                response.status()
            )));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| AppError::Transient(format!("vector search unreadable: {}", e)))?;
        Ok(parsed
            .result
            .into_iter()
            .map(|hit| {
                let text = hit
                    .payload
                    .get("chunk_text")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                VectorMatch {
                    id: hit.id.to_string(),
                    score: hit.score,
                    text,
                    payload: hit.payload,
                }
            })
            .collect())
    }

    /// Cascade delete when a knowledge asset is removed or re-ingested.
    pub async fn delete_by_asset(
        &self,
        tenant_id: Uuid,
        brand_id: Uuid,
        asset_id: Uuid,
    ) -> AppResult<()> {
        let name = Self::collection_name(tenant_id, brand_id);
        let body = json!({
            "filter": {
                "must": [
                    { "key": "asset_id", "match": { "value": asset_id.to_string() } }
                ]
            }
        });
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/delete?wait=true", name),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("vector delete failed: {}", e)))?;
        if response.status().is_success() || response.status().as_u16() == 404 {
            info!("deleted vectors for asset {} in {}", asset_id, name);
            Ok(())
        } else {
            Err(AppError::Transient(format!(
                "vector delete returned {}",
                response.status()
            )))
        }
    }
}

/// Translate a flat `{"key": "value"}` filter map into the store's
/// must-match expression.
fn build_filter(filters: &serde_json::Value) -> Option<serde_json::Value> {
    let map = filters.as_object()?;
    if map.is_empty() {
        return None;
    }
    let must: Vec<_> = map
        .iter()
        .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
        .collect();
    Some(json!({ "must": must }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_name_is_scoped_per_tenant_brand() {
        let tenant = Uuid::new_v4();
        let brand_a = Uuid::new_v4();
        let brand_b = Uuid::new_v4();
        let a = VectorStoreClient::collection_name(tenant, brand_a);
        let b = VectorStoreClient::collection_name(tenant, brand_b);
        assert_ne!(a, b);
        assert!(a.contains(&tenant.to_string()));
    }

    #[test]
    fn empty_filters_produce_no_expression() {
        assert!(build_filter(&json!({})).is_none());
        assert!(build_filter(&json!(null)).is_none());
    }

    #[test]
    fn filters_become_must_clauses() {
        let filter = build_filter(&json!({"visibility": "public"})).unwrap();
        let must = filter.get("must").unwrap().as_array().unwrap();
        assert_eq!(must.len(), 1);
        assert_eq!(must[0]["key"], "visibility");
    }
}
