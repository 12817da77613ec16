//! Dispatch supervisor: polls the queue and runs each labour in its own
//! worker process

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job_executor::JobExecutor;
use super::job_queue::JobQueue;
use super::job_scheduler::JobScheduler;
use super::lock::AdvisoryLock;
use super::process::{ProcessExit, ProcessSpawner, WorkerProcess};
use super::types::TickReport;
use crate::config::ServerConfig;
use crate::errors::{QueueError, QueueResult};
use crate::models::Labour;

/// A worker process spawned by this supervisor
struct TrackedProcess {
    labour_id: i64,
    worker: String,
    process: Box<dyn WorkerProcess>,
    started_at: DateTime<Utc>,
    timeout: Option<chrono::Duration>,
    killed: bool,
}

impl TrackedProcess {
    fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.timeout
            .is_some_and(|timeout| now - self.started_at >= timeout)
    }
}

/// Service responsible for dispatching labours to worker processes
pub struct JobQueueRunner {
    job_queue: Arc<JobQueue>,
    job_executor: Arc<JobExecutor>,
    job_scheduler: Arc<JobScheduler>,
    spawner: Arc<dyn ProcessSpawner>,
    lock: AdvisoryLock,
    threads: usize,
    poll_interval: Duration,
    processes: Vec<TrackedProcess>,
}

impl JobQueueRunner {
    pub fn new(
        job_queue: Arc<JobQueue>,
        job_executor: Arc<JobExecutor>,
        job_scheduler: Arc<JobScheduler>,
        spawner: Arc<dyn ProcessSpawner>,
        lock: AdvisoryLock,
        config: &ServerConfig,
    ) -> Self {
        Self {
            job_queue,
            job_executor,
            job_scheduler,
            spawner,
            lock,
            threads: config.threads.max(1),
            poll_interval: config.poll_interval,
            processes: Vec::new(),
        }
    }

    /// Number of worker processes currently tracked
    pub fn running_count(&self) -> usize {
        self.processes.len()
    }

    /// Take the advisory lock and recover labours orphaned by a previous
    /// supervisor.
    ///
    /// Fails with `LockContention` when another supervisor is active.
    pub async fn start(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.lock.try_lock(now).await?;
        let recovered = self.recover_orphans(now).await?;
        if recovered > 0 {
            warn!(
                "Marked {} labour(s) left in flight by a previous supervisor as unknown",
                recovered
            );
        }
        Ok(())
    }

    /// In-flight labours whose process is gone are marked `unknown`
    async fn recover_orphans(&self, now: DateTime<Utc>) -> QueueResult<usize> {
        let in_flight = self.job_queue.labours().find_in_flight(false).await?;
        let mut recovered = 0;
        for labour in in_flight {
            if let Some(pid) = labour.pid {
                if self.spawner.is_alive(pid) {
                    info!(
                        "Labour {} ({}) is still running as pid {}, leaving it alone",
                        labour.id, labour.worker, pid
                    );
                    continue;
                }
            }
            self.job_queue.labours().mark_unknown(labour.id, now).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Run the supervisor loop until cancelled, then release the lock.
    ///
    /// Tracked processes are left running on shutdown.
    pub async fn run(&mut self, cancellation_token: CancellationToken) -> QueueResult<()> {
        self.start(Utc::now()).await?;
        info!(
            "Starting job queue runner (threads: {}, poll interval: {:?})",
            self.threads, self.poll_interval
        );

        let result = loop {
            if cancellation_token.is_cancelled() {
                info!("Job queue runner received cancellation signal");
                break Ok(());
            }

            let report = match self.tick(Utc::now()).await {
                Ok(report) => report,
                Err(e) => {
                    error!("Job queue runner stopping: {}", e);
                    break Err(e);
                }
            };

            // Loop straight back while there is work and room for it
            if report.dispatched > 0 && self.running_count() < self.threads {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = cancellation_token.cancelled() => {
                    info!("Job queue runner received cancellation signal");
                    break Ok(());
                }
            }
        };

        if !self.processes.is_empty() {
            info!(
                "Leaving {} worker process(es) running: {:?}",
                self.processes.len(),
                self.processes.iter().map(|p| p.labour_id).collect::<Vec<_>>()
            );
        }
        if let Err(e) = self.lock.unlock().await {
            warn!("Failed to release queue lock '{}': {}", self.lock.name(), e);
        }
        info!("Job queue runner stopped");
        result
    }

    /// One supervisor iteration: reap, plan, then dispatch up to capacity
    pub async fn tick(&mut self, now: DateTime<Utc>) -> QueueResult<TickReport> {
        self.lock.refresh(now).await?;

        let mut report = TickReport::default();
        self.reap(now, &mut report).await?;

        if let Some(plan) = self.job_scheduler.plan_due(now).await? {
            report.planned = plan.created;
        }

        let capacity = self.threads.saturating_sub(self.processes.len());
        if capacity == 0 {
            debug!("At maximum worker processes ({}), waiting", self.threads);
            return Ok(report);
        }

        let Some(labours) = self.job_queue.receive_at(capacity, now).await? else {
            return Ok(report);
        };

        for labour in labours {
            if self.dispatch(labour, now).await? {
                report.dispatched += 1;
            }
        }
        Ok(report)
    }

    /// Drop finished processes, killing those past their timeout, and
    /// reschedule labours whose process never reported an outcome
    async fn reap(&mut self, now: DateTime<Utc>, report: &mut TickReport) -> QueueResult<()> {
        let mut still_running = Vec::with_capacity(self.processes.len());

        for mut tracked in std::mem::take(&mut self.processes) {
            let mut exit = Self::poll_exit(&mut tracked);

            if exit.is_none() && !tracked.killed && tracked.is_overdue(now) {
                warn!(
                    "Labour {} ({}) exceeded its timeout, killing pid {:?}",
                    tracked.labour_id,
                    tracked.worker,
                    tracked.process.pid()
                );
                if let Err(e) = tracked.process.kill() {
                    error!("Failed to kill worker for labour {}: {}", tracked.labour_id, e);
                }
                tracked.killed = true;
                report.timed_out += 1;
                exit = Self::poll_exit(&mut tracked);
            }

            let Some(exit) = exit else {
                still_running.push(tracked);
                continue;
            };

            report.reaped += 1;
            debug!(
                "Worker for labour {} ({}) exited: {}",
                tracked.labour_id, tracked.worker, exit
            );

            let reason = if tracked.killed {
                format!("worker process killed after timeout ({exit})")
            } else {
                format!("worker process ended without recording an outcome ({exit})")
            };
            if let Some(labour) = self
                .job_executor
                .abandon(tracked.labour_id, tracked.process.pid(), &reason, now)
                .await?
            {
                debug!("Labour {} is now {}", labour.id, labour.status);
                report.rescheduled += 1;
            }
        }

        self.processes = still_running;
        Ok(())
    }

    fn poll_exit(tracked: &mut TrackedProcess) -> Option<ProcessExit> {
        match tracked.process.try_exit() {
            Ok(exit) => exit,
            Err(e) => {
                // Treat an unobservable process as gone
                error!(
                    "Failed to poll worker for labour {}: {}",
                    tracked.labour_id, e
                );
                Some(ProcessExit { code: None })
            }
        }
    }

    /// Spawn a worker process for a received labour.
    ///
    /// Returns whether a process is now tracked for it.
    async fn dispatch(&mut self, labour: Labour, now: DateTime<Utc>) -> QueueResult<bool> {
        let Some(definition) = self.job_queue.registry().resolve(&labour.worker) else {
            let reason = QueueError::no_such_worker(&labour.worker).to_string();
            self.job_executor.fail(labour.id, &reason, now).await?;
            return Ok(false);
        };
        let timeout = definition
            .timeout
            .map(chrono::Duration::from_std)
            .transpose()
            .map_err(|e| {
                QueueError::configuration(format!(
                    "Timeout of worker {} is too large: {e}",
                    definition.code
                ))
            })?;
        let worker = definition.code.clone();

        let process = match self.spawner.spawn(&labour) {
            Ok(process) => process,
            Err(e) => {
                let err = QueueError::spawn(labour.id, e.to_string());
                error!("{}", err);
                self.job_executor
                    .abandon(labour.id, None, &err.to_string(), now)
                    .await?;
                return Ok(false);
            }
        };

        if let Some(pid) = process.pid() {
            self.job_executor.assign_pid(labour.id, pid, now).await?;
        }
        info!(
            "Dispatched labour {} ({}) to pid {:?}",
            labour.id,
            worker,
            process.pid()
        );

        self.processes.push(TrackedProcess {
            labour_id: labour.id,
            worker,
            process,
            started_at: now,
            timeout,
            killed: false,
        });
        Ok(true)
    }
}
