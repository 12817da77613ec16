//! Job scheduling subsystem for labour-queue
//!
//! The system is built around four main components:
//! - `JobQueue`: persistent queue with deduplication rules and priority ordering
//! - `JobScheduler`: cron-based planner feeding recurring labours into the queue
//! - `JobQueueRunner`: dispatch supervisor running each labour in its own process
//! - `JobExecutor`: labour lifecycle, driven by worker processes and the supervisor

pub mod job_executor;
pub mod job_queue;
pub mod job_queue_runner;
pub mod job_scheduler;
pub mod lock;
pub mod process;
pub mod types;
pub mod worker_registry;
pub mod workers;

pub use job_executor::JobExecutor;
pub use job_queue::JobQueue;
pub use job_queue_runner::JobQueueRunner;
pub use job_scheduler::{CronExpression, JobScheduler};
pub use lock::AdvisoryLock;
pub use process::{
    CommandSpawner, ProcessExit, ProcessSpawner, WorkerProcess, EXIT_OUTCOME_NOT_RECORDED,
};
pub use types::*;
pub use worker_registry::{Worker, WorkerDefinition, WorkerRegistry};
