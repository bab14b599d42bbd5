//! Connection pool management with read/write separation
//!
//! Job state transitions go through the write pool. Lookups use the read
//! pool, and the periodic scheduling scans run on their own analytics pool so
//! a slow scan cannot starve workers of connections.

use anyhow::{Context, Result};
use repoweaver_config::DatabaseConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Configuration for connection pools
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections for write pool
    pub write_pool_size: u32,
    /// Maximum connections for read pool
    pub read_pool_size: u32,
    /// Maximum connections for the scheduling scans
    pub analytics_pool_size: u32,
    /// Minimum idle connections kept in the write pool
    pub min_connections: u32,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Idle timeout in seconds
    pub idle_timeout: u64,
    /// Maximum lifetime in seconds
    pub max_lifetime: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            write_pool_size: 10,
            read_pool_size: 10,
            analytics_pool_size: 2,
            min_connections: 2,
            connect_timeout: 30,
            idle_timeout: 600,
            max_lifetime: 1800,
        }
    }
}

impl From<&DatabaseConfig> for PoolConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            write_pool_size: config.max_connections,
            read_pool_size: config.max_connections,
            analytics_pool_size: (config.max_connections / 4).max(1),
            min_connections: config.min_connections.min(config.max_connections),
            connect_timeout: config.timeout_seconds,
            idle_timeout: config.idle_timeout_seconds,
            ..Self::default()
        }
    }
}

/// Manages multiple connection pools for different operation types
#[derive(Clone)]
#[allow(clippy::struct_field_names)]
pub struct PoolManager {
    /// Pool for job and repository state transitions
    write_pool: PgPool,
    /// Pool for lookups
    read_pool: PgPool,
    /// Pool for scheduling scans
    analytics_pool: PgPool,
}

impl PoolManager {
    /// Create a new pool manager with the given configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable, authentication fails,
    /// or any of the three pools cannot establish its first connection
    pub async fn new(db_config: &DatabaseConfig, config: PoolConfig) -> Result<Self> {
        let base_options = db_config.connect_options().application_name("repoweaver");

        let write_pool = PgPoolOptions::new()
            .max_connections(config.write_pool_size)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .idle_timeout(Duration::from_secs(config.idle_timeout))
            .max_lifetime(Duration::from_secs(config.max_lifetime))
            .connect_with(base_options.clone())
            .await
            .context("Failed to create write pool")?;

        let read_pool = PgPoolOptions::new()
            .max_connections(config.read_pool_size)
            .acquire_timeout(Duration::from_secs(config.connect_timeout))
            .idle_timeout(Duration::from_secs(config.idle_timeout))
            .max_lifetime(Duration::from_secs(config.max_lifetime))
            .connect_with(base_options.clone())
            .await
            .context("Failed to create read pool")?;

        let analytics_pool = PgPoolOptions::new()
            .max_connections(config.analytics_pool_size)
            .acquire_timeout(Duration::from_secs(
                config.connect_timeout.saturating_mul(2),
            ))
            .idle_timeout(Duration::from_secs(config.idle_timeout))
            .max_lifetime(Duration::from_secs(config.max_lifetime))
            .connect_with(base_options)
            .await
            .context("Failed to create analytics pool")?;

        Ok(Self {
            write_pool,
            read_pool,
            analytics_pool,
        })
    }

    /// Create pools sized from the database section of the configuration
    ///
    /// # Errors
    ///
    /// See [`PoolManager::new`]
    pub async fn from_config(db_config: &DatabaseConfig) -> Result<Self> {
        Self::new(db_config, PoolConfig::from(db_config)).await
    }

    /// Serve all three roles from one existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            write_pool: pool.clone(),
            read_pool: pool.clone(),
            analytics_pool: pool,
        }
    }

    /// Get the write pool for state transitions
    pub const fn write_pool(&self) -> &PgPool {
        &self.write_pool
    }

    /// Get the read pool for lookups
    pub const fn read_pool(&self) -> &PgPool {
        &self.read_pool
    }

    /// Get the pool for scheduling scans
    pub const fn analytics_pool(&self) -> &PgPool {
        &self.analytics_pool
    }

    /// Close all pools
    pub async fn close(&self) {
        self.write_pool.close().await;
        self.read_pool.close().await;
        self.analytics_pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_follows_database_config() {
        let mut db = DatabaseConfig::from_env();
        db.max_connections = 20;
        db.min_connections = 50;
        db.timeout_seconds = 7;

        let config = PoolConfig::from(&db);
        assert_eq!(config.write_pool_size, 20);
        assert_eq!(config.analytics_pool_size, 5);
        assert_eq!(config.min_connections, 20);
        assert_eq!(config.connect_timeout, 7);
    }
}
