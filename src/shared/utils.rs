use aws_config::BehaviorVersion;
use aws_sdk_s3::{config::Builder as S3ConfigBuilder, Client as S3Client};
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::info;

use crate::config::ObjectStoreConfig;

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

pub fn create_pool(database_url: &str, max_size: u32) -> Result<DbPool, diesel::r2d2::PoolError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .max_size(max_size)
        .connection_timeout(std::time::Duration::from_secs(5))
        .build(manager)
}

pub async fn create_s3_client(config: &ObjectStoreConfig) -> S3Client {
    let endpoint = if config.endpoint.ends_with('/') {
        config.endpoint.clone()
    } else {
        format!("{}/", config.endpoint)
    };
    let base_config = aws_config::defaults(BehaviorVersion::latest())
        .endpoint_url(endpoint)
        .region(aws_sdk_s3::config::Region::new(config.region.clone()))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            config.access_key.clone(),
            config.secret_key.clone(),
            None,
            None,
            "static",
        ))
        .load()
        .await;
    let s3_config = S3ConfigBuilder::from(&base_config)
        .force_path_style(true)
        .build();
    S3Client::from_conf(s3_config)
}

/// Characters per token assumed by context budgeting and chunk sizing.
/// Coarse, but retrieval budgets and chunk windows only need the same
/// yardstick on both sides.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token cost of a text span for budget decisions.
pub fn estimate_token_count(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN).max(1)
}

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Apply pending schema migrations before a component starts serving.
pub fn run_pending_migrations(pool: &DbPool) -> anyhow::Result<()> {
    let mut conn = pool.get()?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("migration failed: {}", e))?;
    for version in &applied {
        info!("applied migration {}", version);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_scales_with_length() {
        assert_eq!(estimate_token_count(""), 1);
        assert_eq!(estimate_token_count("abcd"), 1);
        // 25 chars rounds up to 7 tokens at 4 chars per token.
        assert_eq!(estimate_token_count("hello world, this is text"), 7);
        assert_eq!(
            estimate_token_count(&"x".repeat(3 * CHARS_PER_TOKEN)),
            3
        );
    }
}
