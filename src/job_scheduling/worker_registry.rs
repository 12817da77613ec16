//! Typed worker registry
//!
//! Worker implementations are registered in code under a worker code; their
//! rule, retry policy, timeout and recurring schedule come from the
//! `[worker_default]` and `[workers.<code>]` configuration sections, with the
//! per-worker section winning.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::job_scheduler::CronExpression;
use super::types::{ExecutionContext, Outcome, RecurringRequest, ResolvedOptions};
use crate::config::{Config, WorkerDefaults, WorkerSettings};
use crate::errors::{QueueError, QueueResult};
use crate::models::Rule;

/// Business logic executed inside a worker process
#[async_trait]
pub trait Worker: Send + Sync {
    async fn execute(&self, ctx: &ExecutionContext) -> Outcome;

    /// Consulted once per planning cycle; `false` suppresses recurring runs
    fn is_allowed(&self) -> bool {
        true
    }

    /// Payload and options for a recurring run planned at `scheduled_for`
    fn recurring_request(&self, _scheduled_for: DateTime<Utc>) -> RecurringRequest {
        RecurringRequest::default()
    }

    /// Reject merged enqueue options before anything is persisted
    fn validate_options(
        &self,
        _options: &ResolvedOptions,
        _payload: &serde_json::Value,
    ) -> Result<(), String> {
        Ok(())
    }
}

/// A registered worker with its configuration resolved
#[derive(Clone)]
pub struct WorkerDefinition {
    pub code: String,
    pub rule: Rule,
    pub limit: Option<usize>,
    /// Retry ceiling
    pub attempts: u32,
    pub reschedule: Duration,
    pub timeout: Option<Duration>,
    pub priority: i64,
    pub recurring: Option<CronExpression>,
    pub params: BTreeMap<String, toml::Value>,
    pub worker: Arc<dyn Worker>,
}

impl fmt::Debug for WorkerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDefinition")
            .field("code", &self.code)
            .field("rule", &self.rule)
            .field("limit", &self.limit)
            .field("attempts", &self.attempts)
            .field("reschedule", &self.reschedule)
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .field("recurring", &self.recurring.as_ref().map(|c| c.as_str()))
            .finish_non_exhaustive()
    }
}

impl WorkerDefinition {
    fn build(
        code: String,
        defaults: &WorkerDefaults,
        settings: Option<&WorkerSettings>,
        worker: Arc<dyn Worker>,
    ) -> QueueResult<Self> {
        let empty = WorkerSettings::default();
        let settings = settings.unwrap_or(&empty);

        let timeout = settings.timeout.unwrap_or(defaults.timeout);
        let recurring = match &settings.recurring {
            Some(recurring) if recurring.enabled => Some(CronExpression::parse(&recurring.schedule)?),
            _ => None,
        };

        Ok(Self {
            code,
            rule: settings.rule.unwrap_or(defaults.rule),
            limit: settings.limit.or(defaults.limit).map(|l| l as usize),
            attempts: settings.attempts.unwrap_or(defaults.attempts),
            reschedule: settings.reschedule.unwrap_or(defaults.reschedule),
            timeout: (!timeout.is_zero()).then_some(timeout),
            priority: i64::from(settings.priority.unwrap_or(defaults.priority)),
            recurring,
            params: settings.params.clone(),
            worker,
        })
    }
}

pub struct WorkerRegistry {
    defaults: WorkerDefaults,
    settings: BTreeMap<String, WorkerSettings>,
    workers: BTreeMap<String, WorkerDefinition>,
}

impl WorkerRegistry {
    pub fn new(config: &Config) -> Self {
        let settings = config
            .workers
            .iter()
            .map(|(code, settings)| (code.to_lowercase(), settings.clone()))
            .collect();

        Self {
            defaults: config.worker_default.clone(),
            settings,
            workers: BTreeMap::new(),
        }
    }

    /// Register an implementation under `code` (case-insensitive)
    pub fn register<W: Worker + 'static>(&mut self, code: &str, worker: W) -> QueueResult<()> {
        self.register_arc(code, Arc::new(worker))
    }

    pub fn register_arc(&mut self, code: &str, worker: Arc<dyn Worker>) -> QueueResult<()> {
        let code = code.to_lowercase();
        if self.workers.contains_key(&code) {
            return Err(QueueError::configuration(format!(
                "Worker '{code}' is already registered"
            )));
        }

        let definition =
            WorkerDefinition::build(code.clone(), &self.defaults, self.settings.get(&code), worker)?;
        debug!("Registered worker {:?}", definition);
        self.workers.insert(code, definition);
        Ok(())
    }

    pub fn resolve(&self, code: &str) -> Option<&WorkerDefinition> {
        self.workers.get(&code.to_lowercase())
    }

    pub fn get(&self, code: &str) -> QueueResult<&WorkerDefinition> {
        self.resolve(code)
            .ok_or_else(|| QueueError::no_such_worker(code))
    }

    /// Workers with an enabled recurring schedule
    pub fn recurring(&self) -> impl Iterator<Item = &WorkerDefinition> {
        self.workers.values().filter(|w| w.recurring.is_some())
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    /// Log configuration sections that no registered worker picked up
    pub fn warn_unregistered_sections(&self) -> Vec<String> {
        let orphaned: Vec<String> = self
            .settings
            .keys()
            .filter(|code| !self.workers.contains_key(*code))
            .cloned()
            .collect();
        for code in &orphaned {
            warn!(
                "Configuration section [workers.{}] has no registered worker implementation",
                code
            );
        }
        orphaned
    }
}
