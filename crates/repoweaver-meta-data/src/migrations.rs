//! Database migration utilities

use crate::error::{DatabaseError, DatabaseResult};
use crate::pool_manager::PoolManager;
use repoweaver_config::DatabaseConfig;
use sqlx::PgPool;
use std::time::Duration;

const MAX_CONNECT_ATTEMPTS: u32 = 30;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Run all pending database migrations
///
/// # Errors
/// Returns `DatabaseError::MigrationFailed` if any migration fails to apply
pub async fn run_migrations(pool: &PgPool) -> DatabaseResult<()> {
    tracing::info!("Running database migrations");

    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|source| DatabaseError::MigrationFailed {
            message: source.to_string(),
            correlation_id: None,
            source,
        })?;

    tracing::info!("Database migrations completed");
    Ok(())
}

/// Wait for the database to accept connections, then migrate if configured
///
/// # Errors
/// Returns the last connection error after all attempts are used, or a
/// migration error
pub async fn wait_for_migrations(config: &DatabaseConfig) -> anyhow::Result<PoolManager> {
    let mut attempts = 0_u32;

    let pools = loop {
        match PoolManager::from_config(config).await {
            Ok(pools) => break pools,
            Err(e) if attempts < MAX_CONNECT_ATTEMPTS => {
                attempts = attempts.saturating_add(1);
                tracing::warn!(
                    attempt = attempts,
                    max_attempts = MAX_CONNECT_ATTEMPTS,
                    "Database not ready: {e}"
                );
                tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            }
            Err(e) => return Err(e),
        }
    };

    if config.auto_migrate {
        run_migrations(pools.write_pool()).await?;
    } else {
        tracing::info!("Skipping migrations (auto_migrate disabled)");
    }

    Ok(pools)
}
