//! # slonik-pool
//!
//! Bounded async connection pool with lifecycle management.
//!
//! The pool sits on top of a [`slonik_driver::Driver`] and knows nothing
//! about queries beyond the optional reset statement it runs when a
//! connection is returned.
//!
//! ## Features
//!
//! - Hard `max_connections` bound that counts establishments in flight
//! - FIFO hand-off to waiting callers without a detour through idle
//! - Replenishment towards `min_connections` after a connection is lost
//! - Idle timeout for connections above the minimum
//! - Reset statement (e.g. `DISCARD ALL`) on release
//! - Graceful `end()` with a termination timeout
//! - Per-connection metadata (transaction depth, termination, statement queue)
//! - Metrics for observability
//!
//! ## Example
//!
//! ```rust,ignore
//! use slonik_pool::{Pool, PoolConfig};
//! use std::time::Duration;
//!
//! let config = PoolConfig::new()
//!     .max_connections(20)
//!     .idle_timeout(Some(Duration::from_secs(60)));
//!
//! let pool = Pool::new(driver, config)?;
//!
//! let conn = pool.acquire().await?;
//! conn.client().query("SELECT 1", &[]).await?;
//! conn.release().await;
//!
//! let status = pool.status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//!
//! pool.end().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pool;

pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use lifecycle::{
    ConnectionMetadata, ConnectionState, SessionState, StatementQueue, StatementTurn,
};
pub use pool::{Pool, PoolBuilder, PoolLifecycle, PoolMetrics, PoolStatus, PooledConnection};
