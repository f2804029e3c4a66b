//! Automation rule administration: create, dry-run test, pause/resume, and
//! job listings.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use cron::Schedule;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::automation::connectors::{build_connector, ConnectorContext};
use crate::shared::audit::record_audit_best_effort;
use crate::shared::error::{AppError, AppResult};
use crate::shared::models::{
    automation_jobs, automation_rules, brands, AutomationJob, AutomationRule, Brand,
    NewAutomationRule,
};
use crate::shared::state::AppState;

use super::auth::AdminContext;

const ACTION_TYPES: &[&str] = &["webhook", "crm", "email"];
const TRIGGER_TYPES: &[&str] = &["cron", "event"];

#[derive(Debug, Deserialize)]
pub struct CreateRuleRequest {
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub name: String,
    pub trigger_type: String,
    #[serde(default)]
    pub trigger_event: Option<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub condition: Option<serde_json::Value>,
    pub action_type: String,
    pub action_payload: serde_json::Value,
    #[serde(default)]
    pub throttle_seconds: i32,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_max_retries() -> i32 {
    3
}

fn default_active() -> bool {
    true
}

pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    admin: AdminContext,
    Json(request): Json<CreateRuleRequest>,
) -> AppResult<(StatusCode, Json<AutomationRule>)> {
    admin.require_tenant(request.tenant_id)?;
    load_brand(&state, request.tenant_id, request.brand_id)?;
    validate_rule(&request)?;

    let row = NewAutomationRule {
        id: Uuid::new_v4(),
        tenant_id: request.tenant_id,
        brand_id: request.brand_id,
        name: request.name,
        trigger_type: request.trigger_type,
        trigger_event: request.trigger_event,
        schedule: request.schedule,
        condition: request.condition,
        action_type: request.action_type,
        action_payload: request.action_payload,
        throttle_seconds: request.throttle_seconds.max(0),
        max_retries: request.max_retries.max(0),
        is_active: request.is_active,
    };
    let mut conn = state.conn.get()?;
    let rule: AutomationRule = diesel::insert_into(automation_rules::table)
        .values(&row)
        .get_result(&mut conn)?;

    record_audit_best_effort(
        &state.conn,
        Some(rule.tenant_id),
        admin.actor(),
        "automation.rule_created",
        serde_json::json!({"rule_id": rule.id, "name": rule.name}),
        None,
    );
    Ok((StatusCode::CREATED, Json(rule)))
}

fn validate_rule(request: &CreateRuleRequest) -> AppResult<()> {
    if !TRIGGER_TYPES.contains(&request.trigger_type.as_str()) {
        return Err(AppError::Validation(format!(
            "trigger_type must be one of {:?}",
            TRIGGER_TYPES
        )));
    }
    if !ACTION_TYPES.contains(&request.action_type.as_str()) {
        return Err(AppError::Validation(format!(
            "action_type must be one of {:?}",
            ACTION_TYPES
        )));
    }
    match request.trigger_type.as_str() {
        "cron" => {
            let Some(ref schedule) = request.schedule else {
                return Err(AppError::Validation(
                    "cron rules require a schedule expression".into(),
                ));
            };
            Schedule::from_str(&normalize_cron(schedule)).map_err(|e| {
                AppError::Validation(format!("invalid schedule expression: {}", e))
            })?;
        }
        "event" => {
            if request.trigger_event.is_none() {
                return Err(AppError::Validation(
                    "event rules require a trigger_event".into(),
                ));
            }
        }
        _ => unreachable!(),
    }
    Ok(())
}

/// The cron crate expects a seconds field; operators write standard
/// five-field expressions.
pub fn normalize_cron(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => format!("0 {}", fields.join(" ")),
        _ => expression.trim().to_string(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub tenant_id: Uuid,
    pub brand_id: Uuid,
    pub action_type: String,
    pub action_payload: serde_json::Value,
}

/// Dry-run a connector without persisting anything.
pub async fn test_rule(
    State(state): State<Arc<AppState>>,
    admin: AdminContext,
    Json(request): Json<TestRequest>,
) -> AppResult<Json<serde_json::Value>> {
    admin.require_tenant(request.tenant_id)?;
    if !ACTION_TYPES.contains(&request.action_type.as_str()) {
        return Err(AppError::Validation(format!(
            "action_type must be one of {:?}",
            ACTION_TYPES
        )));
    }
    let connector = build_connector(&request.action_type, &state);
    let context = ConnectorContext {
        tenant_id: request.tenant_id,
        brand_id: request.brand_id,
        rule_id: None,
        dry_run: true,
    };
    let result = connector.invoke(&request.action_payload, &context).await?;
    Ok(Json(result))
}

pub async fn pause_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<Uuid>,
    admin: AdminContext,
) -> AppResult<Json<AutomationRule>> {
    set_rule_active(&state, rule_id, &admin, false).await
}

pub async fn resume_rule(
    State(state): State<Arc<AppState>>,
    Path(rule_id): Path<Uuid>,
    admin: AdminContext,
) -> AppResult<Json<AutomationRule>> {
    set_rule_active(&state, rule_id, &admin, true).await
}

async fn set_rule_active(
    state: &AppState,
    rule_id: Uuid,
    admin: &AdminContext,
    active: bool,
) -> AppResult<Json<AutomationRule>> {
    let mut conn = state.conn.get()?;
    let rule: Option<AutomationRule> = automation_rules::table
        .find(rule_id)
        .first(&mut conn)
        .optional()?;
    let Some(rule) = rule else {
        return Err(AppError::NotFound(format!("rule {} not found", rule_id)));
    };
    admin.require_tenant(rule.tenant_id)?;

    let updated: AutomationRule = diesel::update(automation_rules::table.find(rule_id))
        .set((
            automation_rules::is_active.eq(active),
            automation_rules::updated_at.eq(diesel::dsl::now),
        ))
        .get_result(&mut conn)?;

    record_audit_best_effort(
        &state.conn,
        Some(rule.tenant_id),
        admin.actor(),
        if active {
            "automation.rule_resumed"
        } else {
            "automation.rule_paused"
        },
        serde_json::json!({"rule_id": rule_id}),
        None,
    );
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
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
pub struct JobsResponse {
    pub items: Vec<AutomationJob>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
}

pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    admin: AdminContext,
    Query(query): Query<JobsQuery>,
) -> AppResult<Json<JobsResponse>> {
    admin.require_tenant(query.tenant_id)?;
    let page = query.page.max(1);
    let per_page = query.per_page.clamp(1, 100);

    let mut conn = state.conn.get()?;
    let (total, items): (i64, Vec<AutomationJob>) = match query.status {
        Some(ref status) => {
            let total = automation_jobs::table
                .filter(automation_jobs::tenant_id.eq(query.tenant_id))
                .filter(automation_jobs::status.eq(status))
                .count()
                .first(&mut conn)?;
            let items = automation_jobs::table
                .filter(automation_jobs::tenant_id.eq(query.tenant_id))
                .filter(automation_jobs::status.eq(status))
                .order(automation_jobs::created_at.desc())
                .offset((page - 1) * per_page)
                .limit(per_page)
                .load(&mut conn)?;
            (total, items)
        }
        None => {
            let total = automation_jobs::table
                .filter(automation_jobs::tenant_id.eq(query.tenant_id))
                .count()
                .first(&mut conn)?;
            let items = automation_jobs::table
                .filter(automation_jobs::tenant_id.eq(query.tenant_id))
                .order(automation_jobs::created_at.desc())
                .offset((page - 1) * per_page)
                .limit(per_page)
                .load(&mut conn)?;
            (total, items)
        }
    };

    Ok(Json(JobsResponse {
        items,
        page,
        per_page,
        total,
    }))
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_cron_gains_seconds() {
        assert_eq!(normalize_cron("*/5 * * * *"), "0 */5 * * * *");
        assert_eq!(normalize_cron("0 */5 * * * *"), "0 */5 * * * *");
    }

    #[test]
    fn normalized_cron_parses() {
        assert!(Schedule::from_str(&normalize_cron("*/1 * * * *")).is_ok());
        assert!(Schedule::from_str(&normalize_cron("not a cron")).is_err());
    }
}
