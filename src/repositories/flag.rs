//! Named values persisted across supervisor restarts

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};

use crate::errors::{RepositoryError, RepositoryResult};
use crate::models::from_unix;

pub const LAST_PLAN_TIME: &str = "last_plan_time";

#[derive(Clone)]
pub struct FlagRepository {
    pool: Pool<Sqlite>,
}

impl FlagRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn get(&self, name: &str) -> RepositoryResult<Option<String>> {
        let value = sqlx::query_scalar("SELECT value FROM queue_flags WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn set(&self, name: &str, value: &str, now: DateTime<Utc>) -> RepositoryResult<()> {
        sqlx::query(
            "INSERT INTO queue_flags (name, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(name)
        .bind(value)
        .bind(now.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read a flag holding unix seconds
    pub async fn get_time(&self, name: &str) -> RepositoryResult<Option<DateTime<Utc>>> {
        let Some(value) = self.get(name).await? else {
            return Ok(None);
        };
        let seconds: i64 = value
            .parse()
            .map_err(|_| RepositoryError::decode(name, format!("'{value}' is not a timestamp")))?;
        from_unix(name, seconds).map(Some)
    }

    pub async fn set_time(
        &self,
        name: &str,
        time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        self.set(name, &time.timestamp().to_string(), now).await
    }
}
