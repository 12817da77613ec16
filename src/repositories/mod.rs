//! Data access for the queue tables
//!
//! Each repository wraps the shared SQLite pool and returns
//! `RepositoryResult`, leaving state-machine decisions to the callers in
//! `job_scheduling`.

pub mod flag;
pub mod labour;
pub mod lock;

pub use flag::{FlagRepository, LAST_PLAN_TIME};
pub use labour::{Bundle, LabourRepository, ScanPosition, Transition};
pub use lock::LockRepository;
