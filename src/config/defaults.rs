/// Configuration default values
///
/// This module contains all the default values for configuration options,
/// making them easily changeable in one central location.
// Database defaults
pub const DEFAULT_DATABASE_URL: &str = "sqlite://./labour-queue.db";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_BUSY_TIMEOUT_SECS: u64 = 30;

// Server defaults
pub const DEFAULT_THREADS: usize = 2;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
pub const DEFAULT_PLAN_AHEAD_MINUTES: u32 = 10;
pub const DEFAULT_RESOLUTION_MINUTES: u32 = 1;
pub const DEFAULT_LOCK_NAME: &str = "labour-queue";
pub const DEFAULT_LOCK_TTL_SECS: u64 = 300;
pub const DEFAULT_INCLUDE_UNKNOWN_IN_FLIGHT: bool = false;
pub const DEFAULT_PAGE_SIZE: u32 = 50;

// Worker defaults
pub const DEFAULT_WORKER_ATTEMPTS: u32 = 3;
pub const DEFAULT_WORKER_RESCHEDULE_SECS: u64 = 60;
pub const DEFAULT_WORKER_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_WORKER_PRIORITY: i32 = 100;

// Config file
pub const DEFAULT_CONFIG_FILE: &str = "labour-queue.toml";
pub const ENV_PREFIX: &str = "LABOUR_QUEUE";
