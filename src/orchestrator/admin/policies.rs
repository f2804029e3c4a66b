//! Policy lifecycle: draft, publish, diff.
//!
//! At most one `published` version exists per tenant; publishing archives
//! the previous one in the same transaction and invalidates the in-process
//! policy cache.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use diesel::prelude::*;
use log::info;
use std::sync::Arc;
use uuid::Uuid;

use crate::shared::audit::record_audit_best_effort;
use crate::shared::error::{AppError, AppResult};
use crate::shared::events::DomainEvent;
use crate::shared::models::{policy_versions, NewPolicyVersion, PolicyStatus, PolicyVersion};
use crate::shared::state::AppState;

use super::auth::AdminContext;

#[derive(Debug, serde::Deserialize)]
pub struct DraftRequest {
    pub policy: serde_json::Value,
}

pub async fn create_draft(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    admin: AdminContext,
    Json(request): Json<DraftRequest>,
) -> AppResult<(StatusCode, Json<PolicyVersion>)> {
    admin.require_tenant(tenant_id)?;
    if !request.policy.is_object() {
        return Err(AppError::Validation("policy must be a JSON object".into()));
    }

    let mut conn = state.conn.get()?;
    let draft = conn.transaction::<PolicyVersion, diesel::result::Error, _>(|conn| {
        let latest: Option<i32> = policy_versions::table
            .filter(policy_versions::tenant_id.eq(tenant_id))
            .select(diesel::dsl::max(policy_versions::version))
            .first(conn)?;
        let row = NewPolicyVersion {
            id: Uuid::new_v4(),
            tenant_id,
            version: latest.unwrap_or(0) + 1,
            status: PolicyStatus::Draft.as_str().to_string(),
            policy: request.policy.clone(),
            published_at: None,
        };
        diesel::insert_into(policy_versions::table)
            .values(&row)
            .get_result(conn)
    })?;

    record_audit_best_effort(
        &state.conn,
        Some(tenant_id),
        admin.actor(),
        "policy.draft_created",
        serde_json::json!({"version": draft.version}),
        None,
    );
    Ok((StatusCode::CREATED, Json(draft)))
}

#[derive(Debug, serde::Deserialize)]
pub struct PublishRequest {
    pub version: i32,
}

pub async fn publish(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<Uuid>,
    admin: AdminContext,
    Json(request): Json<PublishRequest>,
) -> AppResult<Json<PolicyVersion>> {
    admin.require_tenant(tenant_id)?;

    let mut conn = state.conn.get()?;
    let published = conn.transaction::<PolicyVersion, AppError, _>(|conn| {
        let draft: Option<PolicyVersion> = policy_versions::table
            .filter(policy_versions::tenant_id.eq(tenant_id))
            .filter(policy_versions::version.eq(request.version))
            .for_update()
            .first(conn)
            .optional()?;
        let Some(draft) = draft else {
            return Err(AppError::NotFound(format!(
                "policy version {} not found",
                request.version
            )));
        };
        match draft.status.as_str() {
            "draft" => {}
            "published" => {
                return Err(AppError::Conflict(format!(
                    "version {} is already published",
                    request.version
                )))
            }
            _ => {
                return Err(AppError::Conflict(format!(
                    "version {} is archived and immutable",
                    request.version
                )))
            }
        }

        // Retire the current published version first; the partial unique
        // index allows at most one published row per tenant.
        diesel::update(
            policy_versions::table
                .filter(policy_versions::tenant_id.eq(tenant_id))
                .filter(policy_versions::status.eq(PolicyStatus::Published.as_str())),
        )
        .set(policy_versions::status.eq(PolicyStatus::Archived.as_str()))
        .execute(conn)?;

        let updated: PolicyVersion = diesel::update(policy_versions::table.find(draft.id))
            .set((
                policy_versions::status.eq(PolicyStatus::Published.as_str()),
                policy_versions::published_at.eq(diesel::dsl::now),
            ))
            .get_result(conn)?;
        Ok(updated)
    })?;

    state.policies.invalidate(tenant_id).await;
    state
        .events
        .publish_best_effort(&DomainEvent::new(
            "policy.published",
            tenant_id,
            serde_json::json!({"version": published.version}),
        ))
        .await;
    record_audit_best_effort(
        &state.conn,
        Some(tenant_id),
        admin.actor(),
        "policy.published",
        serde_json::json!({"version": published.version}),
        None,
    );
    info!(
        "tenant {} published policy version {}",
        tenant_id, published.version
    );
    Ok(Json(published))
}

#[derive(Debug, serde::Serialize)]
pub struct PolicyDiff {
    pub base_version: Option<i32>,
    pub target_version: i32,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub changed: Vec<String>,
}

/// Diff a version against the currently published policy.
pub async fn diff(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, version)): Path<(Uuid, i32)>,
    admin: AdminContext,
) -> AppResult<Json<PolicyDiff>> {
    admin.require_tenant(tenant_id)?;

    let mut conn = state.conn.get()?;
    let target: Option<PolicyVersion> = policy_versions::table
        .filter(policy_versions::tenant_id.eq(tenant_id))
        .filter(policy_versions::version.eq(version))
        .first(&mut conn)
        .optional()?;
    let Some(target) = target else {
        return Err(AppError::NotFound(format!(
            "policy version {} not found",
            version
        )));
    };
    let published: Option<PolicyVersion> = policy_versions::table
        .filter(policy_versions::tenant_id.eq(tenant_id))
        .filter(policy_versions::status.eq(PolicyStatus::Published.as_str()))
        .first(&mut conn)
        .optional()?;

    let base = published
        .as_ref()
        .map(|p| p.policy.clone())
        .unwrap_or(serde_json::json!({}));
    let (added, removed, changed) = diff_objects(&base, &target.policy);

    Ok(Json(PolicyDiff {
        base_version: published.map(|p| p.version),
        target_version: version,
        added,
        removed,
        changed,
    }))
}

fn diff_objects(
    base: &serde_json::Value,
    target: &serde_json::Value,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let empty = serde_json::Map::new();
    let base_map = base.as_object().unwrap_or(&empty);
    let target_map = target.as_object().unwrap_or(&empty);

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut changed = Vec::new();

    for key in target_map.keys() {
        match base_map.get(key) {
            None => added.push(key.clone()),
            Some(value) if value != &target_map[key] => changed.push(key.clone()),
            Some(_) => {}
        }
    }
    for key in base_map.keys() {
        if !target_map.contains_key(key) {
            removed.push(key.clone());
        }
    }
    added.sort();
    removed.sort();
    changed.sort();
    (added, removed, changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_reports_added_removed_changed() {
        let base = serde_json::json!({"a": 1, "b": 2, "c": 3});
        let target = serde_json::json!({"a": 1, "b": 9, "d": 4});
        let (added, removed, changed) = diff_objects(&base, &target);
        assert_eq!(added, vec!["d"]);
        assert_eq!(removed, vec!["c"]);
        assert_eq!(changed, vec!["b"]);
    }

    #[test]
    fn diff_against_empty_base_marks_everything_added() {
        let (added, removed, changed) = diff_objects(
            &serde_json::json!({}),
            &serde_json::json!({"persona_prompt": "hi"}),
        );
        assert_eq!(added, vec!["persona_prompt"]);
        assert!(removed.is_empty());
        assert!(changed.is_empty());
    }
}
