//! The per-job ingestion pipeline: fetch, parse, chunk, embed, upsert.
//!
//! Vector point ids are derived from `(asset_id, chunk_index)` so
//! reprocessing an asset upserts in place instead of duplicating vectors.

use diesel::prelude::*;
use log::info;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

use crate::retrieval::chunking::{chunk_markdown, chunk_plain, Chunk, ChunkingConfig};
use crate::retrieval::vector_store::VectorPoint;
use crate::shared::error::{AppError, AppResult};
use crate::shared::models::{ingestion_jobs, knowledge_assets, IngestionJob, KnowledgeAsset};
use crate::shared::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Markdown,
    Plain,
    Html,
    Pdf,
}

impl DocumentFormat {
    pub fn from_object_key(key: &str) -> Option<Self> {
        let ext = std::path::Path::new(key)
            .extension()
            .and_then(|e| e.to_str())?
            .to_lowercase();
        match ext.as_str() {
            "md" | "markdown" => Some(Self::Markdown),
            "txt" | "text" => Some(Self::Plain),
            "html" | "htm" => Some(Self::Html),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkStats {
    pub total_chunks: usize,
    pub vectors_upserted: usize,
}

pub struct IngestionPipeline<'a> {
    state: &'a AppState,
    chunking: ChunkingConfig,
}

impl<'a> IngestionPipeline<'a> {
    pub fn new(state: &'a AppState) -> Self {
        Self {
            state,
            chunking: ChunkingConfig::default(),
        }
    }

    pub async fn run(&self, job: &IngestionJob) -> AppResult<ChunkStats> {
        let asset = self.load_asset(job)?;

        let bytes = self.fetch_object(&asset).await?;
        let format = DocumentFormat::from_object_key(&asset.object_key).ok_or_else(|| {
            AppError::Permanent(format!("unsupported format for {}", asset.object_key))
        })?;
        let text = extract_text(format, &bytes)?;

        let chunks = self.chunk(&asset, job, &text, format);
        if chunks.is_empty() {
            return Err(AppError::Permanent("document produced no chunks".into()));
        }
        self.set_total_chunks(job.id, chunks.len())?;

        // Embed in bounded batches, recording progress after each upsert so
        // processed_chunks never exceeds total_chunks at any observation.
        let mut upserted = 0usize;
        let batch_size = self.state.embeddings.batch_size();
        let mut dimensions_checked = false;
        for batch in chunks.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = self.state.embeddings.embed(&texts).await?;

            if !dimensions_checked {
                let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
                if dims == 0 {
                    return Err(AppError::Transient("embedding returned empty vectors".into()));
                }
                self.state
                    .vectors
                    .ensure_collection(job.tenant_id, job.brand_id, dims)
                    .await?;
                dimensions_checked = true;
            }

            let points: Vec<VectorPoint> = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| VectorPoint {
                    id: deterministic_point_id(asset.id, chunk.index),
                    vector,
                    payload: point_payload(&asset, job, chunk),
                })
                .collect();
            self.state
                .vectors
                .upsert(job.tenant_id, job.brand_id, &points)
                .await?;

            upserted += points.len();
            self.set_processed_chunks(job.id, upserted)?;
        }

        info!(
            "ingested asset {} ({} chunks, {} vectors)",
            asset.id,
            chunks.len(),
            upserted
        );
        Ok(ChunkStats {
            total_chunks: chunks.len(),
            vectors_upserted: upserted,
        })
    }

    fn load_asset(&self, job: &IngestionJob) -> AppResult<KnowledgeAsset> {
        let mut conn = self.state.conn.get()?;
        let asset: Option<KnowledgeAsset> = knowledge_assets::table
            .find(job.asset_id)
            .filter(knowledge_assets::tenant_id.eq(job.tenant_id))
            .first(&mut conn)
            .optional()?;
        asset.ok_or_else(|| {
            AppError::Permanent(format!("asset {} not found for job {}", job.asset_id, job.id))
        })
    }

    async fn fetch_object(&self, asset: &KnowledgeAsset) -> AppResult<Vec<u8>> {
        let Some(ref s3) = self.state.s3 else {
            return Err(AppError::Transient("object store not configured".into()));
        };
        let object = s3
            .get_object()
            .bucket(&self.state.config.object_store.bucket)
            .key(&asset.object_key)
            .send()
            .await
            .map_err(|e| AppError::Transient(format!("object fetch failed: {}", e)))?;
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| AppError::Transient(format!("object read failed: {}", e)))?
            .into_bytes()
            .to_vec();
        if bytes.is_empty() {
            return Err(AppError::Permanent(format!(
                "object {} is empty",
                asset.object_key
            )));
        }
        Ok(bytes)
    }

    fn chunk(
        &self,
        asset: &KnowledgeAsset,
        job: &IngestionJob,
        text: &str,
        format: DocumentFormat,
    ) -> Vec<Chunk> {
        let mut metadata = HashMap::new();
        metadata.insert("asset_id".to_string(), asset.id.to_string());
        metadata.insert("tenant_id".to_string(), job.tenant_id.to_string());
        metadata.insert("brand_id".to_string(), job.brand_id.to_string());
        metadata.insert("title".to_string(), asset.title.clone());

        match format {
            DocumentFormat::Markdown => chunk_markdown(text, &self.chunking, &metadata),
            _ => chunk_plain(text, &self.chunking, &metadata),
        }
    }

    fn set_total_chunks(&self, job_id: Uuid, total: usize) -> AppResult<()> {
        let mut conn = self.state.conn.get()?;
        diesel::update(ingestion_jobs::table.find(job_id))
            .set((
                ingestion_jobs::total_chunks.eq(total as i32),
                ingestion_jobs::updated_at.eq(diesel::dsl::now),
            ))
            .execute(&mut conn)?;
        Ok(())
    }

    fn set_processed_chunks(&self, job_id: Uuid, processed: usize) -> AppResult<()> {
        let mut conn = self.state.conn.get()?;
        diesel::update(ingestion_jobs::table.find(job_id))
            .set((
                ingestion_jobs::processed_chunks.eq(processed as i32),
                ingestion_jobs::updated_at.eq(diesel::dsl::now),
            ))
            .execute(&mut conn)?;
        Ok(())
    }
}

fn point_payload(
    asset: &KnowledgeAsset,
    job: &IngestionJob,
    chunk: &Chunk,
) -> serde_json::Value {
    let tags = job
        .logs
        .as_array()
        .and_then(|entries| entries.first())
        .and_then(|entry| entry.get("tags"))
        .cloned()
        .unwrap_or(serde_json::json!([]));
    let mut payload = serde_json::json!({
        "asset_id": asset.id.to_string(),
        "chunk_index": chunk.index,
        "chunk_text": chunk.content,
        "visibility": asset.visibility,
        "tags": tags,
    });
    for (key, value) in &chunk.metadata {
        if payload.get(key).is_none() {
            payload[key] = serde_json::Value::String(value.clone());
        }
    }
    payload
}

/// Stable point id per `(asset_id, chunk_index)`.
pub fn deterministic_point_id(asset_id: Uuid, chunk_index: usize) -> Uuid {
    let digest = Sha256::digest(format!("{}:{}", asset_id, chunk_index).as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

pub fn extract_text(format: DocumentFormat, bytes: &[u8]) -> AppResult<String> {
    match format {
        DocumentFormat::Markdown | DocumentFormat::Plain => String::from_utf8(bytes.to_vec())
            .map_err(|_| AppError::Permanent("document is not valid UTF-8".into())),
        DocumentFormat::Html => {
            let raw = String::from_utf8_lossy(bytes);
            Ok(strip_html_tags(&raw))
        }
        DocumentFormat::Pdf => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| AppError::Permanent(format!("pdf extraction failed: {}", e))),
    }
}

fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detection_from_object_key() {
        assert_eq!(
            DocumentFormat::from_object_key("t/b/a/abc.md"),
            Some(DocumentFormat::Markdown)
        );
        assert_eq!(
            DocumentFormat::from_object_key("t/b/a/abc.PDF"),
            Some(DocumentFormat::Pdf)
        );
        assert_eq!(DocumentFormat::from_object_key("t/b/a/abc.docx"), None);
        assert_eq!(DocumentFormat::from_object_key("no-extension"), None);
    }

    #[test]
    fn point_ids_are_deterministic() {
        let asset = Uuid::new_v4();
        assert_eq!(
            deterministic_point_id(asset, 3),
            deterministic_point_id(asset, 3)
        );
        assert_ne!(
            deterministic_point_id(asset, 3),
            deterministic_point_id(asset, 4)
        );
    }

    #[test]
    fn html_tags_are_stripped() {
        let text = strip_html_tags("<html><body><h1>Reset</h1><p>Hold 5s.</p></body></html>");
        assert!(text.contains("Reset"));
        assert!(text.contains("Hold 5s."));
        assert!(!text.contains('<'));
    }

    #[test]
    fn non_utf8_plain_text_is_permanent() {
        let err = extract_text(DocumentFormat::Plain, &[0xff, 0xfe, 0x00]).unwrap_err();
        assert!(!err.is_retryable());
    }
}
