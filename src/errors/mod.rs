//! Centralized error handling for the labour queue
//!
//! # Error Categories
//!
//! - **Configuration Errors**: unknown worker codes, invalid enqueue options
//! - **Repository Errors**: SQLite operations and row decoding
//! - **Infrastructure Errors**: process spawning, advisory lock contention
//!
//! # Usage
//!
//! ```rust
//! use labour_queue::errors::{QueueError, QueueResult};
//!
//! fn example_function() -> QueueResult<String> {
//!     Err(QueueError::no_such_worker("mailer"))
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using QueueError
pub type QueueResult<T> = Result<T, QueueError>;

/// Convenience type alias for Repository Results
pub type RepositoryResult<T> = Result<T, RepositoryError>;
