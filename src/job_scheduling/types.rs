//! Job scheduling type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{Labour, Rule};
use crate::repositories::Bundle;

/// Longest identity a producer may attach to a labour
pub const MAX_IDENTITY_LENGTH: usize = 255;

/// Producer-supplied overrides for `JobQueue::add`
///
/// Anything left unset falls back to the worker's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddOptions {
    /// Deduplication/batching key
    pub identity: Option<String>,
    /// Lower values are dequeued first
    pub priority: Option<i64>,
    /// Seconds from now; zero or negative means immediately eligible
    pub delay: Option<i64>,
    pub rule: Option<Rule>,
    #[serde(default)]
    pub by_recurring: bool,
}

impl AddOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn identity<S: Into<String>>(mut self, identity: S) -> Self {
        self.identity = Some(identity.into());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay(mut self, seconds: i64) -> Self {
        self.delay = Some(seconds);
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn by_recurring(mut self) -> Self {
        self.by_recurring = true;
        self
    }
}

/// Options after merging producer overrides over worker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    pub identity: String,
    pub priority: i64,
    pub delay: i64,
    pub rule: Rule,
    pub by_recurring: bool,
}

/// Result of running worker logic for one labour
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    /// Recoverable failure; retried after the worker's reschedule delay
    Reschedule(String),
    /// Terminal failure; no further retries
    Failed(String),
}

impl Outcome {
    pub fn reschedule<S: Into<String>>(reason: S) -> Self {
        Outcome::Reschedule(reason.into())
    }

    pub fn failed<S: Into<String>>(reason: S) -> Self {
        Outcome::Failed(reason.into())
    }
}

/// Everything a worker sees while executing a labour
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub bundle: Bundle,
    /// Free-form `params` from the worker's configuration section
    pub params: BTreeMap<String, toml::Value>,
}

impl ExecutionContext {
    pub fn labour(&self) -> &Labour {
        &self.bundle.representative
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.bundle.representative.payload
    }

    /// Labours bundled under this one by the `batch` rule
    pub fn members(&self) -> &[Labour] {
        &self.bundle.members
    }
}

/// A payload and options for one planned recurring run
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringRequest {
    pub payload: serde_json::Value,
    pub options: AddOptions,
}

impl Default for RecurringRequest {
    fn default() -> Self {
        Self {
            payload: serde_json::json!({}),
            options: AddOptions::default(),
        }
    }
}

/// Summary of one recurring planning cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanReport {
    /// Persist this as the next `last_plan_time`
    pub planned_at: DateTime<Utc>,
    pub created: usize,
    pub skipped_missed: u64,
}

/// Summary of one supervisor iteration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reaped: usize,
    pub rescheduled: usize,
    pub timed_out: usize,
    pub planned: usize,
    pub dispatched: usize,
}
