pub mod assets;
pub mod config;
pub mod database;
pub mod errors;
pub mod job_scheduling;
pub mod models;
pub mod repositories;
