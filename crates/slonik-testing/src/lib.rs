//! # slonik-testing
//!
//! Test infrastructure for the slonik crates.
//!
//! ## Mock driver
//!
//! [`MockDriver`] is an in-memory [`slonik_driver::Driver`] that records every
//! statement and lets tests inject failures, stall connection establishment
//! and publish backend events:
//!
//! ```rust,ignore
//! use slonik_testing::{MockDriver, result_set};
//! use slonik_driver::{DriverError, Value};
//!
//! let driver = MockDriver::with_responder(|sql, _values| {
//!     if sql.contains("FROM users") {
//!         Ok(result_set(&["id"], vec![vec![Value::Int(1)]]))
//!     } else {
//!         Err(DriverError::server("42P01", "relation does not exist"))
//!     }
//! });
//!
//! driver.pause_connections();
//! // ... start an acquire, then
//! driver.resume_connections();
//!
//! assert_eq!(driver.sql_log(), vec!["SELECT id FROM users"]);
//! ```
//!
//! ## Logging
//!
//! Call [`init_tracing`] at the start of a test to see pool and engine logs.
//! The filter comes from `RUST_LOG` and defaults to `warn`.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod mock_driver;

pub use mock_driver::{
    Classifier, LoggedStatement, MockClient, MockDriver, Responder, command_result, result_set,
};

use tracing_subscriber::EnvFilter;

/// Install a test-friendly tracing subscriber.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
