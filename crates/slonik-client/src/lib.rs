//! # slonik-client
//!
//! Pooled database client with an interceptor pipeline and savepoint-based
//! transactions.
//!
//! ## Features
//!
//! - Connection checkout scoped to a handler; the connection is returned (or
//!   destroyed, if the backend went away) when the handler finishes
//! - Statements on one connection run one at a time, in submission order
//! - Automatic retry of serialization failures and deadlocks outside of
//!   transactions, and of whole transactions inside them
//! - Nested transactions via `SAVEPOINT slonik_savepoint_<depth>`
//! - Interceptors that observe or rewrite connections, queries and rows
//! - Typed errors for integrity constraint violations and other SQLSTATE classes
//! - Result-shape helpers: `one`, `maybe_one`, `many`, `exists`, ...
//!
//! ## Example
//!
//! ```rust,ignore
//! use slonik_client::{ClientConfig, DatabasePool, Query, QueryMethods};
//!
//! let pool = DatabasePool::new(driver, ClientConfig::new())?;
//!
//! let name = pool
//!     .one_first(Query::new("SELECT name FROM users WHERE id = $1").bind(1i64))
//!     .await?;
//!
//! pool.transaction(|tx| async move {
//!     tx.query(Query::new("INSERT INTO audit (event) VALUES ($1)").bind("login"))
//!         .await?;
//!     tx.transaction(|savepoint| async move {
//!         savepoint.query("DELETE FROM sessions".into()).await
//!     })
//!     .await?;
//!     Ok(())
//! })
//! .await?;
//!
//! pool.end().await;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
mod execution;
pub mod instrumentation;
pub mod interceptor;
pub mod pool;
pub mod query;
pub mod routines;
pub mod transaction;

pub use config::{ClientConfig, DISABLE_TIMEOUT};
pub use connection::{ConnectionContext, ConnectionType, DatabaseConnection};
pub use error::{Error, IntegrityViolation, Result};
pub use execution::QueryStream;
pub use instrumentation::SanitizationConfig;
pub use interceptor::{Interceptor, ResultParserInterceptor};
pub use pool::{DatabasePool, create_pool};
pub use query::{Query, QueryContext, ResultParser, Sandbox};
pub use routines::QueryMethods;
pub use transaction::{Transaction, current_transaction_id};

pub use slonik_driver::{Field, Notice, QueryResult, Row, Value};
pub use slonik_pool::{PoolLifecycle, PoolMetrics, PoolStatus};
