//! Admin bearer-token authentication.
//!
//! HS256 JWTs with issuer/audience pinning. `platform_admin` acts across
//! tenants; `tenant_operator` is confined to the tenant baked into its
//! claims.

use axum::extract::FromRequestParts;
use axum::http::{header::AUTHORIZATION, request::Parts};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::AdminJwtConfig;
use crate::shared::error::AppError;
use crate::shared::state::AppState;

pub const SCOPE_PLATFORM_ADMIN: &str = "platform_admin";
pub const SCOPE_TENANT_OPERATOR: &str = "tenant_operator";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminClaims {
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub tenant_id: Option<Uuid>,
}

impl AdminClaims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Whether the caller may act on the given tenant.
    pub fn can_access_tenant(&self, tenant_id: Uuid) -> bool {
        if self.has_scope(SCOPE_PLATFORM_ADMIN) {
            return true;
        }
        self.has_scope(SCOPE_TENANT_OPERATOR) && self.tenant_id == Some(tenant_id)
    }
}

pub fn issue_token(
    config: &AdminJwtConfig,
    subject: &str,
    scopes: &[&str],
    tenant_id: Option<Uuid>,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = chrono::Utc::now().timestamp();
    let claims = AdminClaims {
        sub: subject.to_string(),
        iss: config.issuer.clone(),
        aud: config.audience.clone(),
        iat: now,
        exp: now + config.ttl_seconds as i64,
        scopes: scopes.iter().map(|s| s.to_string()).collect(),
        tenant_id,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )
}

pub fn validate_token(config: &AdminJwtConfig, token: &str) -> Result<AdminClaims, AppError> {
    let mut validation = Validation::default();
    validation.set_issuer(&[&config.issuer]);
    validation.set_audience(&[&config.audience]);
    decode::<AdminClaims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| AppError::Auth(format!("invalid admin token: {}", e)))
}

/// Extractor used by every admin handler.
#[derive(Debug, Clone)]
pub struct AdminContext {
    pub claims: AdminClaims,
}

impl AdminContext {
    pub fn actor(&self) -> &str {
        &self.claims.sub
    }

    pub fn require_tenant(&self, tenant_id: Uuid) -> Result<(), AppError> {
        if self.claims.can_access_tenant(tenant_id) {
            Ok(())
        } else {
            Err(AppError::Auth(format!(
                "caller may not act on tenant {}",
                tenant_id
            )))
        }
    }
}

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for AdminContext {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Auth("missing bearer token".into()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Auth("authorization header must be Bearer".into()))?;
        let claims = validate_token(&state.config.admin_jwt, token)?;
        if !claims.has_scope(SCOPE_PLATFORM_ADMIN) && !claims.has_scope(SCOPE_TENANT_OPERATOR) {
            return Err(AppError::Auth("token carries no admin scope".into()));
        }
        Ok(AdminContext { claims })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AdminJwtConfig {
        AdminJwtConfig {
            secret: "super-secret-test-key-0001".into(),
            issuer: "convoserver".into(),
            audience: "admin".into(),
            ttl_seconds: 600,
        }
    }

    #[test]
    fn token_round_trip() {
        let config = config();
        let tenant = Uuid::new_v4();
        let token = issue_token(
            &config,
            "ops@example.com",
            &[SCOPE_TENANT_OPERATOR],
            Some(tenant),
        )
        .unwrap();
        let claims = validate_token(&config, &token).unwrap();
        assert_eq!(claims.sub, "ops@example.com");
        assert!(claims.can_access_tenant(tenant));
        assert!(!claims.can_access_tenant(Uuid::new_v4()));
    }

    #[test]
    fn platform_admin_crosses_tenants() {
        let config = config();
        let token = issue_token(&config, "root", &[SCOPE_PLATFORM_ADMIN], None).unwrap();
        let claims = validate_token(&config, &token).unwrap();
        assert!(claims.can_access_tenant(Uuid::new_v4()));
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let mut issuing = config();
        issuing.issuer = "someone-else".into();
        let token = issue_token(&issuing, "root", &[SCOPE_PLATFORM_ADMIN], None).unwrap();
        assert!(validate_token(&config(), &token).is_err());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let config = config();
        let token = issue_token(&config, "root", &[SCOPE_PLATFORM_ADMIN], None).unwrap();
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(validate_token(&config, &tampered).is_err());
    }
}
