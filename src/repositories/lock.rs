//! Rows backing the supervisor's advisory lock

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use std::time::Duration;

use crate::errors::RepositoryResult;

#[derive(Clone)]
pub struct LockRepository {
    pool: Pool<Sqlite>,
}

impl LockRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Claim `name` for `owner`.
    ///
    /// Succeeds when the lock is free, already ours, or its heartbeat is
    /// older than `ttl`.
    pub async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let stale_before = now.timestamp() - ttl.as_secs() as i64;
        let result = sqlx::query(
            "INSERT INTO queue_locks (name, owner, acquired_at, heartbeat_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET
                 owner = excluded.owner,
                 acquired_at = CASE WHEN queue_locks.owner = excluded.owner
                                    THEN queue_locks.acquired_at ELSE excluded.acquired_at END,
                 heartbeat_at = excluded.heartbeat_at
             WHERE queue_locks.owner = excluded.owner OR queue_locks.heartbeat_at < ?",
        )
        .bind(name)
        .bind(owner)
        .bind(now.timestamp())
        .bind(now.timestamp())
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Refresh the heartbeat; false when the lock was taken over
    pub async fn heartbeat(
        &self,
        name: &str,
        owner: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let result =
            sqlx::query("UPDATE queue_locks SET heartbeat_at = ? WHERE name = ? AND owner = ?")
                .bind(now.timestamp())
                .bind(name)
                .bind(owner)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn release(&self, name: &str, owner: &str) -> RepositoryResult<bool> {
        let result = sqlx::query("DELETE FROM queue_locks WHERE name = ? AND owner = ?")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}
