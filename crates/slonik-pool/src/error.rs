//! Pool error types.

use std::time::Duration;

use slonik_driver::DriverError;
use thiserror::Error;

/// Errors returned by the connection pool.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// The pool is ending and no longer hands out connections.
    #[error("connection pool is shutting down")]
    PoolTerminating,

    /// The pool has ended.
    #[error("connection pool has ended")]
    PoolEnded,

    /// The driver failed to establish a connection.
    #[error("failed to establish connection: {0}")]
    Driver(#[from] DriverError),

    /// Establishing a connection took too long.
    #[error("connection establishment timed out after {0:?}")]
    ConnectionTimeout(Duration),

    /// Internal bookkeeping invariant violated.
    #[error("unexpected pool state: {0}")]
    UnexpectedState(String),

    /// Invalid configuration.
    #[error("invalid pool configuration: {0}")]
    Config(String),
}

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
