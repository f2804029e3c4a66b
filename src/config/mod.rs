//! Explicit configuration structs hydrated from the environment.
//!
//! Every component loads `AppConfig::from_env()` at process start and fails
//! fast on missing or invalid values. An optional `--config <path>` file is
//! applied to the environment first; unknown keys in that file are a fatal
//! error.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub outbound_url: String,
    pub ingest_url: String,
    pub event_bus_url: String,
}

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct VectorStoreConfig {
    pub url: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider_url: String,
    pub api_key: String,
    pub model: String,
    pub fallback_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingProviderKind {
    Primary,
    Fallback,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub api_key: String,
    pub primary_url: String,
    pub fallback_url: Option<String>,
    pub model: String,
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct AdminJwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub orchestrator_url: String,
    /// Static fallback secrets per channel type, rotation-aware:
    /// `WEBHOOK_SECRET_<CHANNEL>` and `WEBHOOK_SECRET_<CHANNEL>_PREV`.
    pub webhook_secrets: HashMap<String, (String, Option<String>)>,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub url: String,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub http_bind: String,
    pub request_deadline: Duration,
    pub outbound_max_attempts: u32,
    pub ingest_max_attempts: u32,
    pub automation_max_concurrency_per_tenant: usize,
    pub policy_cache_ttl: Duration,
    pub credential_cache_ttl: Duration,
    pub dedupe_ttl: Duration,
    pub drain_deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub streams: StreamConfig,
    pub object_store: ObjectStoreConfig,
    pub vector_store: VectorStoreConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub admin_jwt: AdminJwtConfig,
    pub gateway: GatewayConfig,
    pub smtp: Option<SmtpConfig>,
    pub runtime: RuntimeConfig,
}

const RECOGNIZED_KEYS: &[&str] = &[
    "DB_URL",
    "DB_POOL_SIZE",
    "OUTBOUND_STREAM_URL",
    "INGEST_QUEUE_URL",
    "EVENT_BUS_URL",
    "OBJECT_STORE_ENDPOINT",
    "OBJECT_STORE_BUCKET",
    "OBJECT_STORE_ACCESS",
    "OBJECT_STORE_SECRET",
    "OBJECT_STORE_REGION",
    "VECTOR_STORE_URL",
    "VECTOR_STORE_API_KEY",
    "LLM_PROVIDER_URL",
    "LLM_API_KEY",
    "LLM_MODEL",
    "LLM_FALLBACK_MODEL",
    "EMBEDDING_PROVIDER",
    "EMBEDDING_API_KEY",
    "EMBEDDING_PRIMARY_URL",
    "EMBEDDING_FALLBACK_URL",
    "EMBEDDING_MODEL",
    "EMBEDDING_BATCH_SIZE",
    "ADMIN_JWT_SECRET",
    "ADMIN_JWT_ISSUER",
    "ADMIN_JWT_AUDIENCE",
    "ADMIN_JWT_TTL_SECONDS",
    "HTTP_BIND",
    "GATEWAY_ORCHESTRATOR_URL",
    "REQUEST_DEADLINE_MS",
    "OUTBOUND_MAX_ATTEMPTS",
    "INGEST_MAX_ATTEMPTS",
    "AUTOMATION_MAX_CONCURRENCY_PER_TENANT",
    "POLICY_CACHE_TTL_SECS",
    "CREDENTIAL_CACHE_TTL_SECS",
    "DEDUPE_TTL_SECS",
    "DRAIN_DEADLINE_SECS",
    "SMTP_URL",
    "SMTP_FROM",
    "RUST_LOG",
];

/// Load a config file into the process environment, rejecting unknown keys.
pub fn apply_config_file(path: &Path) -> Result<(), ConfigError> {
    let iter = dotenvy::from_path_iter(path)
        .map_err(|e| ConfigError(format!("cannot read {}: {}", path.display(), e)))?;
    for item in iter {
        let (key, value) =
            item.map_err(|e| ConfigError(format!("bad line in {}: {}", path.display(), e)))?;
        if !RECOGNIZED_KEYS.contains(&key.as_str())
            && !key.starts_with("WEBHOOK_SECRET_")
        {
            return Err(ConfigError(format!("unknown configuration key: {}", key)));
        }
        std::env::set_var(key, value);
    }
    Ok(())
}

fn required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError(format!("{} is required", key)))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match optional(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database = DatabaseConfig {
            url: required("DB_URL")?,
            pool_size: parse_or("DB_POOL_SIZE", 10u32)?,
        };

        let redis_default = optional("OUTBOUND_STREAM_URL")
            .unwrap_or_else(|| "redis://localhost:6379/0".to_string());
        let streams = StreamConfig {
            outbound_url: redis_default.clone(),
            ingest_url: optional("INGEST_QUEUE_URL").unwrap_or_else(|| redis_default.clone()),
            event_bus_url: optional("EVENT_BUS_URL").unwrap_or_else(|| redis_default.clone()),
        };

        let object_store = ObjectStoreConfig {
            endpoint: optional("OBJECT_STORE_ENDPOINT")
                .unwrap_or_else(|| "http://localhost:9000".to_string()),
            bucket: optional("OBJECT_STORE_BUCKET").unwrap_or_else(|| "knowledge".to_string()),
            access_key: optional("OBJECT_STORE_ACCESS").unwrap_or_default(),
            secret_key: optional("OBJECT_STORE_SECRET").unwrap_or_default(),
            region: optional("OBJECT_STORE_REGION").unwrap_or_else(|| "us-east-1".to_string()),
        };

        let vector_store = VectorStoreConfig {
            url: optional("VECTOR_STORE_URL").unwrap_or_else(|| "http://localhost:6333".to_string()),
            api_key: optional("VECTOR_STORE_API_KEY"),
        };

        let llm = LlmConfig {
            provider_url: optional("LLM_PROVIDER_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: optional("LLM_API_KEY").unwrap_or_default(),
            model: optional("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            fallback_model: optional("LLM_FALLBACK_MODEL"),
        };

        let provider = match optional("EMBEDDING_PROVIDER").as_deref() {
            None | Some("primary") => EmbeddingProviderKind::Primary,
            Some("fallback") => EmbeddingProviderKind::Fallback,
            Some(other) => {
                return Err(ConfigError(format!(
                    "EMBEDDING_PROVIDER must be primary or fallback, got {}",
                    other
                )))
            }
        };
        let embedding = EmbeddingConfig {
            provider,
            api_key: optional("EMBEDDING_API_KEY").unwrap_or_default(),
            primary_url: optional("EMBEDDING_PRIMARY_URL")
                .unwrap_or_else(|| "http://localhost:8082".to_string()),
            fallback_url: optional("EMBEDDING_FALLBACK_URL"),
            model: optional("EMBEDDING_MODEL").unwrap_or_else(|| "bge-small-en-v1.5".to_string()),
            batch_size: parse_or("EMBEDDING_BATCH_SIZE", 64usize)?.clamp(1, 64),
        };

        let admin_jwt = AdminJwtConfig {
            secret: required("ADMIN_JWT_SECRET")?,
            issuer: optional("ADMIN_JWT_ISSUER").unwrap_or_else(|| "convoserver".to_string()),
            audience: optional("ADMIN_JWT_AUDIENCE").unwrap_or_else(|| "admin".to_string()),
            ttl_seconds: parse_or("ADMIN_JWT_TTL_SECONDS", 3600u64)?,
        };

        let gateway = GatewayConfig {
            orchestrator_url: optional("GATEWAY_ORCHESTRATOR_URL")
                .unwrap_or_else(|| "http://localhost:8081".to_string()),
            webhook_secrets: collect_webhook_secrets(),
        };

        let smtp = match (optional("SMTP_URL"), optional("SMTP_FROM")) {
            (Some(url), Some(from)) => Some(SmtpConfig { url, from }),
            (None, None) => None,
            _ => {
                return Err(ConfigError(
                    "SMTP_URL and SMTP_FROM must be set together".to_string(),
                ))
            }
        };

        let runtime = RuntimeConfig {
            http_bind: optional("HTTP_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            request_deadline: Duration::from_millis(parse_or("REQUEST_DEADLINE_MS", 30_000u64)?),
            outbound_max_attempts: parse_or("OUTBOUND_MAX_ATTEMPTS", 5u32)?,
            ingest_max_attempts: parse_or("INGEST_MAX_ATTEMPTS", 5u32)?,
            automation_max_concurrency_per_tenant: parse_or(
                "AUTOMATION_MAX_CONCURRENCY_PER_TENANT",
                4usize,
            )?,
            policy_cache_ttl: Duration::from_secs(parse_or("POLICY_CACHE_TTL_SECS", 30u64)?),
            credential_cache_ttl: Duration::from_secs(parse_or(
                "CREDENTIAL_CACHE_TTL_SECS",
                60u64,
            )?),
            dedupe_ttl: Duration::from_secs(parse_or("DEDUPE_TTL_SECS", 600u64)?),
            drain_deadline: Duration::from_secs(parse_or("DRAIN_DEADLINE_SECS", 30u64)?),
        };

        let config = Self {
            database,
            streams,
            object_store,
            vector_store,
            llm,
            embedding,
            admin_jwt,
            gateway,
            smtp,
            runtime,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.pool_size == 0 {
            return Err(ConfigError("DB_POOL_SIZE must be at least 1".into()));
        }
        if self.runtime.request_deadline.is_zero() {
            return Err(ConfigError("REQUEST_DEADLINE_MS must be positive".into()));
        }
        if self.runtime.outbound_max_attempts == 0 || self.runtime.ingest_max_attempts == 0 {
            return Err(ConfigError("retry attempt limits must be at least 1".into()));
        }
        if self.runtime.automation_max_concurrency_per_tenant == 0 {
            return Err(ConfigError(
                "AUTOMATION_MAX_CONCURRENCY_PER_TENANT must be at least 1".into(),
            ));
        }
        if self.admin_jwt.secret.len() < 16 {
            return Err(ConfigError(
                "ADMIN_JWT_SECRET must be at least 16 bytes".into(),
            ));
        }
        Ok(())
    }
}

fn collect_webhook_secrets() -> HashMap<String, (String, Option<String>)> {
    let mut secrets = HashMap::new();
    for channel in ["instagram", "whatsapp", "telegram", "web"] {
        let key = format!("WEBHOOK_SECRET_{}", channel.to_uppercase());
        if let Some(current) = optional(&key) {
            let previous = optional(&format!("{}_PREV", key));
            secrets.insert(channel.to_string(), (current, previous));
        }
    }
    secrets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_zero_pool() {
        let config = AppConfig {
            database: DatabaseConfig {
                url: "postgres://localhost/app".into(),
                pool_size: 0,
            },
            streams: StreamConfig {
                outbound_url: "redis://localhost".into(),
                ingest_url: "redis://localhost".into(),
                event_bus_url: "redis://localhost".into(),
            },
            object_store: ObjectStoreConfig {
                endpoint: "http://localhost:9000".into(),
                bucket: "knowledge".into(),
                access_key: String::new(),
                secret_key: String::new(),
                region: "us-east-1".into(),
            },
            vector_store: VectorStoreConfig {
                url: "http://localhost:6333".into(),
                api_key: None,
            },
            llm: LlmConfig {
                provider_url: "http://localhost:8081".into(),
                api_key: String::new(),
                model: "test".into(),
                fallback_model: None,
            },
            embedding: EmbeddingConfig {
                provider: EmbeddingProviderKind::Primary,
                api_key: String::new(),
                primary_url: "http://localhost:8082".into(),
                fallback_url: None,
                model: "test".into(),
                batch_size: 64,
            },
            admin_jwt: AdminJwtConfig {
                secret: "0123456789abcdef0123".into(),
                issuer: "convoserver".into(),
                audience: "admin".into(),
                ttl_seconds: 3600,
            },
            gateway: GatewayConfig {
                orchestrator_url: "http://localhost:8081".into(),
                webhook_secrets: HashMap::new(),
            },
            smtp: None,
            runtime: RuntimeConfig {
                http_bind: "0.0.0.0:8080".into(),
                request_deadline: Duration::from_secs(30),
                outbound_max_attempts: 5,
                ingest_max_attempts: 5,
                automation_max_concurrency_per_tenant: 4,
                policy_cache_ttl: Duration::from_secs(30),
                credential_cache_ttl: Duration::from_secs(60),
                dedupe_ttl: Duration::from_secs(600),
                drain_deadline: Duration::from_secs(30),
            },
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_config_file_key_is_fatal() {
        let dir = std::env::temp_dir();
        let path = dir.join("convoserver_test_config.env");
        std::fs::write(&path, "DB_URL=postgres://localhost/app\nBOGUS_KEY=1\n").unwrap();
        let result = apply_config_file(&path);
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
        assert!(result.unwrap_err().0.contains("BOGUS_KEY"));
    }
}
