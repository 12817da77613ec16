//! Error type definitions for the labour queue
//!
//! Errors are split by layer: `RepositoryError` covers persistence, while
//! `QueueError` is what the queue engine, the planner and the supervisor
//! surface to their callers.

use thiserror::Error;

/// Top-level queue error type
///
/// Configuration errors (unknown worker, invalid options) are returned to the
/// producer calling `add`; infrastructure errors (spawn, lock, database) are
/// surfaced to the supervisor loop.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Worker code does not resolve in the worker registry
    #[error("Unable to find worker with name '{worker}'")]
    NoSuchWorker { worker: String },

    /// Merged enqueue options failed validation
    #[error("Invalid options for worker '{worker}': {message}")]
    InvalidOptions { worker: String, message: String },

    /// Labour or other resource not found
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Worker process could not be started
    #[error("Unable to spawn worker process for labour {labour_id}: {message}")]
    Spawn { labour_id: i64, message: String },

    /// Another supervisor holds the advisory lock
    #[error("Queue is already running (lock '{name}' is held)")]
    LockContention { name: String },

    /// Cron expression could not be parsed
    #[error("Invalid cron expression '{expression}': {message}")]
    Cron { expression: String, message: String },

    /// Repository layer errors
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Payload serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Repository layer specific errors
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// SQL query execution failures
    #[error("Query failed: {query} - {message}")]
    QueryFailed { query: String, message: String },

    /// Record not found
    #[error("Record not found: {table} with {field} = {value}")]
    RecordNotFound {
        table: String,
        field: String,
        value: String,
    },

    /// Stored value could not be decoded into a model
    #[error("Decode failed: {column} - {message}")]
    Decode { column: String, message: String },

    /// Underlying database failures
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl QueueError {
    /// Create a no-such-worker error
    pub fn no_such_worker<S: Into<String>>(worker: S) -> Self {
        Self::NoSuchWorker {
            worker: worker.into(),
        }
    }

    /// Create an invalid options error
    pub fn invalid_options<W: Into<String>, M: Into<String>>(worker: W, message: M) -> Self {
        Self::InvalidOptions {
            worker: worker.into(),
            message: message.into(),
        }
    }

    /// Create a not found error for a specific resource
    pub fn not_found<R: Into<String>, I: ToString>(resource: R, id: I) -> Self {
        Self::NotFound {
            resource: resource.into(),
            id: id.to_string(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a spawn error
    pub fn spawn<S: Into<String>>(labour_id: i64, message: S) -> Self {
        Self::Spawn {
            labour_id,
            message: message.into(),
        }
    }

    /// Create a cron expression error
    pub fn cron<E: Into<String>, M: Into<String>>(expression: E, message: M) -> Self {
        Self::Cron {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this error is a producer-side configuration problem
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoSuchWorker { .. } | Self::InvalidOptions { .. } | Self::Configuration { .. }
        )
    }
}

impl RepositoryError {
    /// Create a query failed error
    pub fn query_failed<Q: Into<String>, M: Into<String>>(query: Q, message: M) -> Self {
        Self::QueryFailed {
            query: query.into(),
            message: message.into(),
        }
    }

    /// Create a record not found error
    pub fn record_not_found<T: Into<String>, F: Into<String>, V: ToString>(
        table: T,
        field: F,
        value: V,
    ) -> Self {
        Self::RecordNotFound {
            table: table.into(),
            field: field.into(),
            value: value.to_string(),
        }
    }

    /// Create a decode error
    pub fn decode<C: Into<String>, M: Into<String>>(column: C, message: M) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }
}
