//! Labour lifecycle: the transitions driven by a worker process and by the
//! supervisor once a labour has left the queue.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::types::{ExecutionContext, Outcome};
use super::worker_registry::WorkerRegistry;
use crate::config::defaults::{DEFAULT_WORKER_ATTEMPTS, DEFAULT_WORKER_RESCHEDULE_SECS};
use crate::errors::{QueueError, QueueResult};
use crate::models::{Labour, LabourStatus};
use crate::repositories::{Bundle, LabourRepository, Transition};

/// Service responsible for executing labours and recording their outcome
pub struct JobExecutor {
    labours: LabourRepository,
    registry: Arc<WorkerRegistry>,
}

impl JobExecutor {
    pub fn new(labours: LabourRepository, registry: Arc<WorkerRegistry>) -> Self {
        Self { labours, registry }
    }

    /// `deployed -> running`, counting one attempt
    pub async fn start(&self, id: i64, pid: Option<u32>, now: DateTime<Utc>) -> QueueResult<Bundle> {
        let bundle = self
            .labours
            .transition(id, &Transition::Start { pid }, now)
            .await?;
        info!(
            "Labour {} ({}) started, attempt {}",
            id, bundle.representative.worker, bundle.representative.attempts
        );
        Ok(bundle)
    }

    pub async fn finish(&self, id: i64, now: DateTime<Utc>) -> QueueResult<Bundle> {
        let bundle = self.labours.transition(id, &Transition::Finish, now).await?;
        info!(
            "Labour {} ({}) finished{}",
            id,
            bundle.representative.worker,
            Self::members_suffix(&bundle)
        );
        Ok(bundle)
    }

    pub async fn fail(&self, id: i64, reason: &str, now: DateTime<Utc>) -> QueueResult<Bundle> {
        let bundle = self
            .labours
            .transition(
                id,
                &Transition::Fail {
                    error: reason.to_string(),
                },
                now,
            )
            .await?;
        error!(
            "Labour {} ({}) failed{}: {}",
            id,
            bundle.representative.worker,
            Self::members_suffix(&bundle),
            reason
        );
        Ok(bundle)
    }

    /// Return a labour to `pending` after the worker's reschedule delay,
    /// or fail it once its attempts exceed the worker's ceiling.
    ///
    /// With `detach` the labour drops its retry lineage.
    pub async fn reschedule(
        &self,
        id: i64,
        reason: Option<&str>,
        detach: bool,
        now: DateTime<Utc>,
    ) -> QueueResult<Labour> {
        let labour = self.labours.get(id).await?;
        let definition = self.registry.resolve(&labour.worker);
        let ceiling = definition.map_or(DEFAULT_WORKER_ATTEMPTS, |d| d.attempts);

        if labour.attempts > ceiling {
            let message = match reason {
                Some(reason) => format!("gave up after {} attempts: {reason}", labour.attempts),
                None => format!("gave up after {} attempts", labour.attempts),
            };
            return Ok(self.fail(id, &message, now).await?.representative);
        }

        let delay = definition.map_or(
            std::time::Duration::from_secs(DEFAULT_WORKER_RESCHEDULE_SECS),
            |d| d.reschedule,
        );
        let execute_at = now
            + chrono::Duration::from_std(delay).map_err(|e| {
                QueueError::configuration(format!("Reschedule delay {delay:?} is too large: {e}"))
            })?;

        let bundle = self
            .labours
            .transition(
                id,
                &Transition::Reschedule {
                    execute_at,
                    detach,
                    error: reason.map(str::to_string),
                },
                now,
            )
            .await?;

        warn!(
            "Labour {} ({}) rescheduled for {} after attempt {}/{}{}",
            id,
            bundle.representative.worker,
            execute_at.format("%Y-%m-%d %H:%M:%S UTC"),
            bundle.representative.attempts,
            ceiling,
            reason.map(|r| format!(": {r}")).unwrap_or_default()
        );
        Ok(bundle.representative)
    }

    /// Record the pid of the process the supervisor spawned for `id`
    pub async fn assign_pid(&self, id: i64, pid: u32, now: DateTime<Utc>) -> QueueResult<()> {
        self.labours
            .transition(id, &Transition::AssignPid { pid }, now)
            .await?;
        Ok(())
    }

    /// Supervisor-side recovery for a labour whose process ended without
    /// reporting an outcome.
    ///
    /// A labour still `deployed` never reached `start`, so its attempt is
    /// counted here, for every bundle member too. Labours that already
    /// reported are left alone and `None` is returned. With `pid`, so is a
    /// labour that has since been handed to another process.
    pub async fn abandon(
        &self,
        id: i64,
        pid: Option<u32>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Labour>> {
        let labour = self.labours.get(id).await?;
        if !labour.status.is_in_flight() {
            return Ok(None);
        }
        if let (Some(exited), Some(current)) = (pid, labour.pid) {
            if exited != current {
                debug!(
                    "Labour {} moved on to pid {}, ignoring exit of pid {}",
                    id, current, exited
                );
                return Ok(None);
            }
        }

        if labour.status == LabourStatus::Deployed {
            self.labours
                .transition(id, &Transition::CountAttempt, now)
                .await?;
        }
        self.reschedule(id, Some(reason), false, now).await.map(Some)
    }

    /// Run a deployed labour in this process and record its outcome.
    ///
    /// Worker errors, panics included, always end as a state transition;
    /// only persistence problems are returned as errors.
    pub async fn execute(&self, id: i64, pid: Option<u32>) -> QueueResult<Labour> {
        let labour = self
            .labours
            .find_by_id(id)
            .await?
            .ok_or_else(|| QueueError::not_found("labour", id))?;

        if labour.status != LabourStatus::Deployed {
            return Err(QueueError::internal(format!(
                "Labour {id} is {}, only deployed labours can be executed",
                labour.status
            )));
        }

        let Some(definition) = self.registry.resolve(&labour.worker) else {
            let reason = QueueError::no_such_worker(&labour.worker).to_string();
            return Ok(self.fail(id, &reason, Utc::now()).await?.representative);
        };

        let bundle = self.start(id, pid, Utc::now()).await?;
        let ctx = ExecutionContext {
            bundle,
            params: definition.params.clone(),
        };

        let worker = Arc::clone(&definition.worker);
        let outcome = match tokio::spawn(async move { worker.execute(&ctx).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Outcome::failed(format!("worker panicked: {e}")),
        };

        self.record_outcome(id, outcome, Utc::now()).await
    }

    pub async fn record_outcome(
        &self,
        id: i64,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> QueueResult<Labour> {
        match outcome {
            Outcome::Finished => Ok(self.finish(id, now).await?.representative),
            Outcome::Reschedule(reason) => self.reschedule(id, Some(&reason), false, now).await,
            Outcome::Failed(reason) => Ok(self.fail(id, &reason, now).await?.representative),
        }
    }

    fn members_suffix(bundle: &Bundle) -> String {
        if bundle.members.is_empty() {
            String::new()
        } else {
            format!(" with {} bundled labour(s)", bundle.members.len())
        }
    }
}
