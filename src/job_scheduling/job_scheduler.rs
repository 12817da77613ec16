//! Recurring planner: expands cron schedules into concrete labours

use chrono::{DateTime, Duration, DurationRound, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::job_queue::JobQueue;
use super::types::PlanReport;
use crate::errors::{QueueError, QueueResult};
use crate::repositories::{FlagRepository, LabourRepository, LAST_PLAN_TIME};

/// Parsed cron schedule
///
/// Accepts the classic five-field form (minute precision) as well as the
/// six/seven-field form with seconds understood by the `cron` crate.
#[derive(Clone)]
pub struct CronExpression {
    source: String,
    schedule: Schedule,
}

impl CronExpression {
    pub fn parse(expression: &str) -> QueueResult<Self> {
        let trimmed = expression.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };

        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| QueueError::cron(expression, e.to_string()))?;

        Ok(Self {
            source: expression.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the schedule fires exactly at `time`
    pub fn matches(&self, time: DateTime<Utc>) -> bool {
        let just_before = time - Duration::seconds(1);
        self.schedule.after(&just_before).next() == Some(time)
    }

    /// Matching instants in `[from, from + horizon)`, checked every `resolution`
    pub fn run_dates(
        &self,
        from: DateTime<Utc>,
        horizon: Duration,
        resolution: Duration,
    ) -> Vec<DateTime<Utc>> {
        let end = from + horizon;
        let mut dates = Vec::new();
        let mut tick = from;
        while tick < end {
            if self.matches(tick) {
                dates.push(tick);
            }
            tick += resolution;
        }
        dates
    }
}

impl std::fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CronExpression").field(&self.source).finish()
    }
}

/// Service responsible for turning recurring schedules into labours
pub struct JobScheduler {
    job_queue: Arc<JobQueue>,
    labours: LabourRepository,
    flags: FlagRepository,
    horizon: Duration,
    resolution: Duration,
}

impl JobScheduler {
    pub fn new(
        job_queue: Arc<JobQueue>,
        labours: LabourRepository,
        flags: FlagRepository,
        plan_ahead_minutes: u32,
        resolution_minutes: u32,
    ) -> Self {
        Self {
            job_queue,
            labours,
            flags,
            horizon: Duration::minutes(i64::from(plan_ahead_minutes.max(1))),
            resolution: Duration::minutes(i64::from(resolution_minutes.max(1))),
        }
    }

    /// Plan the window starting at `now` unless the previous window
    /// (starting at `last_plan_time`) is still open.
    ///
    /// Returns `None` when planning was not due.
    pub async fn plan(
        &self,
        now: DateTime<Utc>,
        last_plan_time: Option<DateTime<Utc>>,
    ) -> QueueResult<Option<PlanReport>> {
        if let Some(last) = last_plan_time {
            if now < last + self.horizon {
                return Ok(None);
            }
        }

        let skipped_missed = self
            .labours
            .skip_missed_recurring(now - self.horizon, now)
            .await?;
        if skipped_missed > 0 {
            warn!("Skipped {} missed recurring labour(s)", skipped_missed);
        }

        let window_start = now
            .duration_trunc(Duration::minutes(1))
            .map_err(|e| QueueError::internal(format!("Cannot truncate {now}: {e}")))?;

        let mut created = 0;
        for definition in self.job_queue.registry().recurring() {
            let Some(cron) = &definition.recurring else {
                continue;
            };

            if !definition.worker.is_allowed() {
                debug!("Recurring worker {} not allowed this cycle", definition.code);
                continue;
            }

            for run_at in cron.run_dates(window_start, self.horizon, self.resolution) {
                let request = definition.worker.recurring_request(run_at);
                let mut options = request.options.by_recurring();
                options.delay = Some((run_at - now).num_seconds());

                match self
                    .job_queue
                    .add_at(&definition.code, request.payload, options, now)
                    .await
                {
                    Ok(Some(labour)) => {
                        debug!(
                            "Planned recurring labour {} for {} at {}",
                            labour.id,
                            definition.code,
                            run_at.format("%Y-%m-%d %H:%M:%S UTC")
                        );
                        created += 1;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_configuration() => {
                        warn!("Recurring worker {} rejected a run: {}", definition.code, e);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if created > 0 {
            info!(
                "Planned {} recurring labour(s) for the next {} minute(s)",
                created,
                self.horizon.num_minutes()
            );
        }

        Ok(Some(PlanReport {
            planned_at: window_start,
            created,
            skipped_missed,
        }))
    }

    /// Plan using the persisted `last_plan_time` and store the new one
    pub async fn plan_due(&self, now: DateTime<Utc>) -> QueueResult<Option<PlanReport>> {
        let last_plan_time = self.flags.get_time(LAST_PLAN_TIME).await?;
        let report = self.plan(now, last_plan_time).await?;
        if let Some(report) = &report {
            self.flags
                .set_time(LAST_PLAN_TIME, report.planned_at, now)
                .await?;
        }
        Ok(report)
    }
}
