//! # slonik-driver
//!
//! The driver capability consumed by the slonik pool and client.
//!
//! This crate defines the boundary between the connection pool / query engine
//! and whatever actually speaks the database wire protocol. A driver creates
//! raw client sessions; a client session executes statements, streams rows,
//! tears down its transport and publishes out-of-band events (notices and
//! backend errors).
//!
//! Nothing here performs I/O. Implementations live elsewhere (a real
//! PostgreSQL protocol implementation, or the in-memory driver in
//! `slonik-testing`).
//!
//! ## Error classification
//!
//! Which driver errors are transient ("transaction rollback class") or map to
//! integrity-constraint kinds is database specific, so classification is a
//! method on [`Driver`] with a PostgreSQL SQLSTATE default:
//!
//! ```rust,ignore
//! use slonik_driver::{Driver, ErrorClass};
//!
//! match driver.classify(&error) {
//!     ErrorClass::TransactionRollback => { /* safe to retry */ }
//!     ErrorClass::UniqueViolation => { /* duplicate key */ }
//!     _ => {}
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod driver;
pub mod error;
pub mod result;
pub mod row;
pub mod value;

pub use driver::{ClientEvent, Driver, DriverClient, RowStream, SessionSettings};
pub use error::{DriverError, DriverErrorKind, ErrorClass, TypeError};
pub use result::{Notice, QueryResult, parse_rows_affected};
pub use row::{Field, Row};
pub use value::{FromValue, Value};
