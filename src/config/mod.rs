use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub mod defaults;
pub mod duration_serde;

use crate::models::Rule;
use defaults::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Values every worker inherits unless its own section overrides them
    #[serde(default)]
    pub worker_default: WorkerDefaults,
    /// Per-worker sections keyed by worker code
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_busy_timeout", with = "duration_serde::duration")]
    pub busy_timeout: Duration,
}

/// Supervisor loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Maximum number of concurrently running worker processes
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Sleep between supervisor iterations
    #[serde(default = "default_poll_interval", with = "duration_serde::duration")]
    pub poll_interval: Duration,
    /// Recurring planning horizon in minutes
    #[serde(default = "default_plan_ahead_minutes")]
    pub plan_ahead_minutes: u32,
    /// Step between candidate run dates in minutes
    #[serde(default = "default_resolution_minutes")]
    pub resolution_minutes: u32,
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
    /// A lock whose heartbeat is older than this may be taken over
    #[serde(default = "default_lock_ttl", with = "duration_serde::duration")]
    pub lock_ttl: Duration,
    /// Count labours in `unknown` state as in flight for dedup and limits
    #[serde(default = "default_include_unknown_in_flight")]
    pub include_unknown_in_flight: bool,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDefaults {
    #[serde(default)]
    pub rule: Rule,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default = "default_worker_attempts")]
    pub attempts: u32,
    #[serde(default = "default_worker_reschedule", with = "duration_serde::duration")]
    pub reschedule: Duration,
    /// Zero disables the timeout
    #[serde(default = "default_worker_timeout", with = "duration_serde::duration")]
    pub timeout: Duration,
    #[serde(default = "default_worker_priority")]
    pub priority: i32,
}

/// Overrides for a single worker code
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<Rule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_serde::option_duration"
    )]
    pub reschedule: Option<Duration>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration_serde::option_duration"
    )]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurring: Option<RecurringSettings>,
    /// Free-form settings handed to the worker implementation
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringSettings {
    /// Five or six field cron expression
    pub schedule: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(DEFAULT_BUSY_TIMEOUT_SECS)
}

fn default_threads() -> usize {
    DEFAULT_THREADS
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)
}

fn default_plan_ahead_minutes() -> u32 {
    DEFAULT_PLAN_AHEAD_MINUTES
}

fn default_resolution_minutes() -> u32 {
    DEFAULT_RESOLUTION_MINUTES
}

fn default_lock_name() -> String {
    DEFAULT_LOCK_NAME.to_string()
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(DEFAULT_LOCK_TTL_SECS)
}

fn default_include_unknown_in_flight() -> bool {
    DEFAULT_INCLUDE_UNKNOWN_IN_FLIGHT
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_worker_attempts() -> u32 {
    DEFAULT_WORKER_ATTEMPTS
}

fn default_worker_reschedule() -> Duration {
    Duration::from_secs(DEFAULT_WORKER_RESCHEDULE_SECS)
}

fn default_worker_timeout() -> Duration {
    Duration::from_secs(DEFAULT_WORKER_TIMEOUT_SECS)
}

fn default_worker_priority() -> i32 {
    DEFAULT_WORKER_PRIORITY
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            poll_interval: default_poll_interval(),
            plan_ahead_minutes: default_plan_ahead_minutes(),
            resolution_minutes: default_resolution_minutes(),
            lock_name: default_lock_name(),
            lock_ttl: default_lock_ttl(),
            include_unknown_in_flight: default_include_unknown_in_flight(),
            page_size: default_page_size(),
        }
    }
}

impl Default for WorkerDefaults {
    fn default() -> Self {
        Self {
            rule: Rule::default(),
            limit: None,
            attempts: default_worker_attempts(),
            reschedule: default_worker_reschedule(),
            timeout: default_worker_timeout(),
            priority: default_worker_priority(),
        }
    }
}

impl ServerConfig {
    /// Reject values the supervisor cannot run with
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.threads >= 1, "server.threads must be at least 1");
        anyhow::ensure!(
            self.poll_interval >= Duration::from_secs(1),
            "server.poll_interval must be at least 1s"
        );
        anyhow::ensure!(
            self.plan_ahead_minutes >= 1,
            "server.plan_ahead_minutes must be at least 1"
        );
        anyhow::ensure!(
            self.resolution_minutes >= 1,
            "server.resolution_minutes must be at least 1"
        );
        anyhow::ensure!(self.page_size >= 1, "server.page_size must be at least 1");
        // A sleeping supervisor must still look alive to a second one
        anyhow::ensure!(
            self.lock_ttl >= self.poll_interval * 2,
            "server.lock_ttl ({:?}) must be at least twice server.poll_interval ({:?})",
            self.lock_ttl,
            self.poll_interval
        );
        Ok(())
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file = std::env::var("LABOUR_QUEUE_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::load_from_file(&config_file)
    }

    /// Read the TOML file (writing the defaults first when it is missing)
    /// and overlay `LABOUR_QUEUE__SECTION__KEY` environment variables.
    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if !Path::new(config_file).exists() {
            let contents = toml::to_string_pretty(&Self::default())?;
            std::fs::write(config_file, contents)
                .with_context(|| format!("Failed to write default config to {config_file}"))?;
            info!("Created default config file: {}", config_file);
        }

        let settings = config::Config::builder()
            .add_source(config::File::new(config_file, config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read config from {config_file}"))?;

        let config: Self = settings
            .try_deserialize()
            .with_context(|| format!("Invalid configuration in {config_file}"))?;
        config.server.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without touching the filesystem or environment
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.server.validate()?;
        Ok(config)
    }
}
