//! Knowledge asset uploads and ingestion job administration.
//!
//! Uploads are content-addressed under
//! `<tenant>/<brand>/<asset>/<sha256>.<ext>`; re-uploading identical content
//! returns the existing asset without enqueuing a duplicate job.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use diesel::prelude::*;
use log::info;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::ingestion::queue::IngestQueue;
use crate::shared::audit::record_audit_best_effort;
use crate::shared::error::{AppError, AppResult};
use crate::shared::models::{
    brands, ingestion_jobs, knowledge_assets, AssetStatus, Brand, IngestionJob, JobStatus,
    KnowledgeAsset, NewIngestionJob, NewKnowledgeAsset,
};
use crate::shared::state::AppState;

use super::auth::AdminContext;

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub filename: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub object_key: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub visibility: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub asset: KnowledgeAsset,
    pub job_id: Option<Uuid>,
    pub deduplicated: bool,
}

pub async fn upload_asset(
    State(state): State<Arc<AppState>>,
    admin: AdminContext,
    Json(request): Json<UploadRequest>,
) -> AppResult<(StatusCode, Json<UploadResponse>)> {
    admin.require_tenant(request.tenant_id)?;
    let brand = load_brand(&state, request.tenant_id, request.brand_id)?;

    let Some(ref s3) = state.s3 else {
        return Err(AppError::Transient("object store not configured".into()));
    };
    let bucket = &state.config.object_store.bucket;

    let (data, provided_key) = match (&request.content, &request.object_key) {
        (Some(content), _) => {
            let decoded = BASE64
                .decode(content.as_bytes())
                .map_err(|e| AppError::Validation(format!("content is not valid base64: {}", e)))?;
            (decoded, None)
        }
        (None, Some(key)) => {
            let object = s3
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| AppError::Validation(format!("object {} unreadable: {}", key, e)))?;
            let bytes = object
                .body
                .collect()
                .await
                .map_err(|e| AppError::Transient(format!("object read failed: {}", e)))?
                .into_bytes()
                .to_vec();
            (bytes, Some(key.clone()))
        }
        (None, None) => {
            return Err(AppError::Validation(
                "either content or object_key is required".into(),
            ))
        }
    };
    if data.is_empty() {
        return Err(AppError::Validation("uploaded content is empty".into()));
    }

    let checksum = hex::encode(Sha256::digest(&data));

    // Content addressing makes re-uploads idempotent per brand.
    let mut conn = state.conn.get()?;
    let existing: Option<KnowledgeAsset> = knowledge_assets::table
        .filter(knowledge_assets::brand_id.eq(brand.id))
        .filter(knowledge_assets::checksum.eq(&checksum))
        .first(&mut conn)
        .optional()?;
    if let Some(asset) = existing {
        info!(
            "duplicate upload for brand {} (checksum {}), reusing asset {}",
            brand.id, checksum, asset.id
        );
        return Ok((
            StatusCode::OK,
            Json(UploadResponse {
                asset,
                job_id: None,
                deduplicated: true,
            }),
        ));
    }

    let asset_id = Uuid::new_v4();
    let object_key = match provided_key {
        Some(key) => key,
        None => {
            let key = format!(
                "{}/{}/{}/{}.{}",
                request.tenant_id,
                request.brand_id,
                asset_id,
                checksum,
                extension_of(&request.filename)
            );
            s3.put_object()
                .bucket(bucket)
                .key(&key)
                .body(data.into())
                .send()
                .await
                .map_err(|e| AppError::Transient(format!("object store write failed: {}", e)))?;
            key
        }
    };

    let asset = NewKnowledgeAsset {
        id: asset_id,
        tenant_id: request.tenant_id,
        brand_id: request.brand_id,
        object_key: object_key.clone(),
        title: request.filename.clone(),
        checksum,
        visibility: request.visibility.unwrap_or_else(|| "internal".to_string()),
        status: AssetStatus::Pending.as_str().to_string(),
    };
    let job = NewIngestionJob {
        id: Uuid::new_v4(),
        asset_id,
        tenant_id: request.tenant_id,
        brand_id: request.brand_id,
        status: JobStatus::Queued.as_str().to_string(),
        attempts: 0,
        total_chunks: 0,
        processed_chunks: 0,
        logs: serde_json::json!([{"stage": "queued", "tags": request.tags}]),
    };

    let (asset, job): (KnowledgeAsset, IngestionJob) =
        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            let asset = diesel::insert_into(knowledge_assets::table)
                .values(&asset)
                .get_result(conn)?;
            let job = diesel::insert_into(ingestion_jobs::table)
                .values(&job)
                .get_result(conn)?;
            Ok((asset, job))
        })?;

    IngestQueue::new(state.redis.clone()).enqueue(job.id).await?;
    record_audit_best_effort(
        &state.conn,
        Some(request.tenant_id),
        admin.actor(),
        "knowledge.asset_uploaded",
        serde_json::json!({"asset_id": asset.id, "object_key": object_key}),
        None,
    );

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            asset,
            job_id: Some(job.id),
            deduplicated: false,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub tenant_id: Uuid,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_per_page")]
    pub per_page: i64,
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    20
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub items: Vec<IngestionJob>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    admin: AdminContext,
    Query(query): Query<JobListQuery>,
) -> AppResult<Json<JobListResponse>> {
    admin.require_tenant(query.tenant_id)?;
    let page = query.page.max(1);
    let per_page = query.per_page.clamp(1, 100);

    let mut conn = state.conn.get()?;
    let (total, items): (i64, Vec<IngestionJob>) = match query.status {
        Some(ref status) => {
            let total = ingestion_jobs::table
                .filter(ingestion_jobs::tenant_id.eq(query.tenant_id))
                .filter(ingestion_jobs::status.eq(status))
                .count()
                .first(&mut conn)?;
            let items = ingestion_jobs::table
                .filter(ingestion_jobs::tenant_id.eq(query.tenant_id))
                .filter(ingestion_jobs::status.eq(status))
                .order(ingestion_jobs::created_at.desc())
                .offset((page - 1) * per_page)
                .limit(per_page)
                .load(&mut conn)?;
            (total, items)
        }
        None => {
            let total = ingestion_jobs::table
                .filter(ingestion_jobs::tenant_id.eq(query.tenant_id))
                .count()
                .first(&mut conn)?;
            let items = ingestion_jobs::table
                .filter(ingestion_jobs::tenant_id.eq(query.tenant_id))
                .order(ingestion_jobs::created_at.desc())
                .offset((page - 1) * per_page)
                .limit(per_page)
                .load(&mut conn)?;
            (total, items)
        }
    };

    Ok(Json(JobListResponse {
        items,
        page,
        per_page,
        total,
    }))
}

/// Explicit retry of a failed job: attempts reset, job queued, asset back to
/// pending.
pub async fn retry_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    admin: AdminContext,
) -> AppResult<Json<IngestionJob>> {
    let mut conn = state.conn.get()?;
    let job: Option<IngestionJob> = ingestion_jobs::table
        .find(job_id)
        .first(&mut conn)
        .optional()?;
    let Some(job) = job else {
        return Err(AppError::NotFound(format!("ingestion job {} not found", job_id)));
    };
    admin.require_tenant(job.tenant_id)?;
    if JobStatus::from_str(&job.status) != Some(JobStatus::Failed) {
        return Err(AppError::Conflict(format!(
            "job {} is {} and cannot be retried",
            job_id, job.status
        )));
    }

    let updated = conn.transaction::<IngestionJob, diesel::result::Error, _>(|conn| {
        let updated: IngestionJob = diesel::update(ingestion_jobs::table.find(job_id))
            .set((
                ingestion_jobs::status.eq(JobStatus::Queued.as_str()),
                ingestion_jobs::attempts.eq(0),
                ingestion_jobs::failure_reason.eq(None::<String>),
                ingestion_jobs::updated_at.eq(diesel::dsl::now),
            ))
            .get_result(conn)?;
        diesel::update(knowledge_assets::table.find(job.asset_id))
            .set(knowledge_assets::status.eq(AssetStatus::Pending.as_str()))
            .execute(conn)?;
        Ok(updated)
    })?;

    IngestQueue::new(state.redis.clone()).enqueue(job_id).await?;
    record_audit_best_effort(
        &state.conn,
        Some(job.tenant_id),
        admin.actor(),
        "knowledge.job_retried",
        serde_json::json!({"job_id": job_id}),
        None,
    );
    Ok(Json(updated))
}

fn load_brand(state: &AppState, tenant_id: Uuid, brand_id: Uuid) -> AppResult<Brand> {
    let mut conn = state.conn.get()?;
    let brand: Option<Brand> = brands::table
        .find(brand_id)
        .filter(brands::tenant_id.eq(tenant_id))
        .first(&mut conn)
        .optional()?;
    brand.ok_or_else(|| AppError::NotFound(format!("brand {} not found", brand_id)))
}

fn extension_of(filename: &str) -> String {
    std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_detection() {
        assert_eq!(extension_of("faq.md"), "md");
        assert_eq!(extension_of("manual.PDF"), "pdf");
        assert_eq!(extension_of("no_extension"), "bin");
    }
}
