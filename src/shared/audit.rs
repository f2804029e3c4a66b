//! Audit trail written on admin mutations and security events.

use diesel::prelude::*;
use log::warn;
use uuid::Uuid;

use super::models::{audit_logs, NewAuditLog};
use super::utils::DbPool;

pub fn record_audit(
    pool: &DbPool,
    tenant_id: Option<Uuid>,
    actor: &str,
    action: &str,
    metadata: serde_json::Value,
    correlation_id: Option<&str>,
) -> Result<(), diesel::result::Error> {
    let mut conn = pool.get().map_err(|e| {
        diesel::result::Error::DatabaseError(
            diesel::result::DatabaseErrorKind::UnableToSendCommand,
            Box::new(e.to_string()),
        )
    })?;
    let entry = NewAuditLog {
        id: Uuid::new_v4(),
        tenant_id,
        actor: actor.to_string(),
        action: action.to_string(),
        metadata,
        correlation_id: correlation_id.map(|s| s.to_string()),
    };
    diesel::insert_into(audit_logs::table)
        .values(&entry)
        .execute(&mut conn)?;
    Ok(())
}

/// Audit failures must never take down the request that triggered them.
pub fn record_audit_best_effort(
    pool: &DbPool,
    tenant_id: Option<Uuid>,
    actor: &str,
    action: &str,
    metadata: serde_json::Value,
    correlation_id: Option<&str>,
) {
    if let Err(e) = record_audit(pool, tenant_id, actor, action, metadata, correlation_id) {
        warn!("failed to write audit entry {}: {}", action, e);
    }
}
