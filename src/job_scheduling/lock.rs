//! Advisory lock keeping a single supervisor per database

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{QueueError, QueueResult};
use crate::repositories::LockRepository;

pub struct AdvisoryLock {
    repository: LockRepository,
    name: String,
    owner: String,
    ttl: Duration,
}

impl AdvisoryLock {
    pub fn new(repository: LockRepository, name: &str, ttl: Duration) -> Self {
        Self {
            repository,
            name: name.to_string(),
            owner: Uuid::new_v4().to_string(),
            ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claim the lock, failing with `LockContention` while another live
    /// supervisor holds it
    pub async fn try_lock(&self, now: DateTime<Utc>) -> QueueResult<()> {
        if self
            .repository
            .try_acquire(&self.name, &self.owner, self.ttl, now)
            .await?
        {
            info!("Acquired queue lock '{}' as {}", self.name, self.owner);
            Ok(())
        } else {
            Err(QueueError::LockContention {
                name: self.name.clone(),
            })
        }
    }

    /// Keep the lock fresh; errors when another supervisor took it over
    pub async fn refresh(&self, now: DateTime<Utc>) -> QueueResult<()> {
        if self
            .repository
            .heartbeat(&self.name, &self.owner, now)
            .await?
        {
            Ok(())
        } else {
            Err(QueueError::LockContention {
                name: self.name.clone(),
            })
        }
    }

    pub async fn unlock(&self) -> QueueResult<()> {
        if self.repository.release(&self.name, &self.owner).await? {
            info!("Released queue lock '{}'", self.name);
        } else {
            warn!("Queue lock '{}' was no longer held by this supervisor", self.name);
        }
        Ok(())
    }
}
