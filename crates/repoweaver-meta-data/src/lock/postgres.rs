//! `PostgreSQL` lease store over the `repo_locks` table

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;

use super::LeaseStore;
use crate::error::{DatabaseErrorExt, DatabaseOperation, DatabaseResult};
use crate::job_queue::millis;

pub struct PostgresLeaseStore {
    name: String,
    pool: PgPool,
}

impl PostgresLeaseStore {
    pub fn new(name: impl Into<String>, pool: PgPool) -> Self {
        Self {
            name: name.into(),
            pool,
        }
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> DatabaseResult<bool> {
        let operation = DatabaseOperation::Lease {
            key: key.to_string(),
            action: "acquire",
        };

        // The conflict branch only fires for expired leases
        let row = sqlx::query(
            r"
            INSERT INTO repo_locks (key, owner, expires_at)
            VALUES ($1, $2, NOW() + $3 * INTERVAL '1 millisecond')
            ON CONFLICT (key) DO UPDATE
            SET owner = EXCLUDED.owner,
                expires_at = EXCLUDED.expires_at
            WHERE repo_locks.expires_at < NOW()
            RETURNING key
            ",
        )
        .bind(key)
        .bind(owner)
        .bind(millis(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_db_err(operation, None)?;

        Ok(row.is_some())
    }

    async fn extend(&self, key: &str, owner: &str, ttl: Duration) -> DatabaseResult<bool> {
        let operation = DatabaseOperation::Lease {
            key: key.to_string(),
            action: "extend",
        };

        let result = sqlx::query(
            r"
            UPDATE repo_locks
            SET expires_at = NOW() + $3 * INTERVAL '1 millisecond'
            WHERE key = $1 AND owner = $2 AND expires_at >= NOW()
            ",
        )
        .bind(key)
        .bind(owner)
        .bind(millis(ttl))
        .execute(&self.pool)
        .await
        .map_db_err(operation, None)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, key: &str, owner: &str) -> DatabaseResult<()> {
        let operation = DatabaseOperation::Lease {
            key: key.to_string(),
            action: "release",
        };

        sqlx::query("DELETE FROM repo_locks WHERE key = $1 AND owner = $2")
            .bind(key)
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_db_err(operation, None)?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
