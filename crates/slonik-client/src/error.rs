//! Client error types.
//!
//! Pool and driver errors are translated into [`Error`] exactly once: pool
//! errors when a connection is established, driver errors in the execution
//! engine. Callers never see a raw [`DriverError`].

use std::sync::Arc;

use slonik_driver::{DriverError, Notice};
use slonik_pool::PoolError;
use thiserror::Error;

/// Offending objects of an integrity constraint violation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityViolation {
    /// Table the constraint belongs to.
    pub table: Option<String>,
    /// Column involved, if reported.
    pub column: Option<String>,
    /// Constraint name.
    pub constraint: Option<String>,
    /// The underlying driver error.
    pub source: DriverError,
}

impl From<DriverError> for IntegrityViolation {
    fn from(source: DriverError) -> Self {
        Self {
            table: source.table.clone(),
            column: source.column.clone(),
            constraint: source.constraint.clone(),
            source,
        }
    }
}

impl std::fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source.message)?;
        if let Some(constraint) = &self.constraint {
            write!(f, " (constraint {constraint})")?;
        }
        Ok(())
    }
}

/// Errors returned by the client.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The pool is ending.
    #[error("connection pool is shutting down")]
    PoolTerminating,

    /// The pool has ended.
    #[error("connection pool has ended")]
    PoolEnded,

    /// A connection could not be established within the retry limit.
    #[error("failed to establish a connection: {source}")]
    Connection {
        /// Error of the last attempt.
        #[source]
        source: PoolError,
    },

    /// The backend terminated the session.
    #[error("backend terminated: {0}")]
    BackendTerminated(#[source] DriverError),

    /// A statement was issued on a connection that does not belong to the
    /// transaction the caller is in.
    #[error(
        "cannot run a query using a connection that is not part of the current transaction; \
         enable dangerously_allow_foreign_connections to allow this"
    )]
    UnexpectedForeignConnection,

    /// The query itself is unusable (empty, degenerate or malformed bindings).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// `NOT NULL` constraint violated.
    #[error("not null integrity constraint violation: {0}")]
    NotNullIntegrityConstraintViolation(IntegrityViolation),

    /// Foreign key constraint violated.
    #[error("foreign key integrity constraint violation: {0}")]
    ForeignKeyIntegrityConstraintViolation(IntegrityViolation),

    /// Unique constraint violated.
    #[error("unique integrity constraint violation: {0}")]
    UniqueIntegrityConstraintViolation(IntegrityViolation),

    /// Check constraint violated.
    #[error("check integrity constraint violation: {0}")]
    CheckIntegrityConstraintViolation(IntegrityViolation),

    /// Exclusion constraint violated.
    #[error("exclusion integrity constraint violation: {0}")]
    ExclusionIntegrityConstraintViolation(IntegrityViolation),

    /// The row to be locked was moved to another partition concurrently.
    #[error("tuple moved to another partition: {0}")]
    TupleMovedToAnotherPartition(#[source] DriverError),

    /// Serialization failure, deadlock or another rollback-class error that
    /// outlived the retry budget.
    #[error("transaction rollback: {0}")]
    TransactionRollback(#[source] DriverError),

    /// The statement was cancelled.
    #[error("statement cancelled: {0}")]
    StatementCancelled(#[source] DriverError),

    /// The statement exceeded `statement_timeout`.
    #[error("statement timeout: {0}")]
    StatementTimeout(#[source] DriverError),

    /// The server could not parse the statement.
    #[error("syntax error: {0}")]
    InputSyntax(#[source] DriverError),

    /// Any other statement failure.
    #[error("query failed: {source}")]
    Query {
        /// The driver error.
        #[source]
        source: DriverError,
        /// Notices raised before the failure.
        notices: Vec<Notice>,
    },

    /// A query shape expected rows and got none.
    #[error("resource not found")]
    NotFound,

    /// The result does not have the expected shape.
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// A row failed result-parser validation.
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Internal invariant violated or API misuse.
    #[error("unexpected state: {0}")]
    UnexpectedState(String),

    /// Application error returned from a handler.
    #[error(transparent)]
    Custom(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wrap an application error.
    pub fn custom(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(error))
    }

    /// The driver error behind this error, if there is one.
    #[must_use]
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Self::BackendTerminated(e)
            | Self::TupleMovedToAnotherPartition(e)
            | Self::TransactionRollback(e)
            | Self::StatementCancelled(e)
            | Self::StatementTimeout(e)
            | Self::InputSyntax(e)
            | Self::Query { source: e, .. } => Some(e),
            Self::NotNullIntegrityConstraintViolation(v)
            | Self::ForeignKeyIntegrityConstraintViolation(v)
            | Self::UniqueIntegrityConstraintViolation(v)
            | Self::CheckIntegrityConstraintViolation(v)
            | Self::ExclusionIntegrityConstraintViolation(v) => Some(&v.source),
            _ => None,
        }
    }

    /// Check whether this is an integrity constraint violation.
    #[must_use]
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            Self::NotNullIntegrityConstraintViolation(_)
                | Self::ForeignKeyIntegrityConstraintViolation(_)
                | Self::UniqueIntegrityConstraintViolation(_)
                | Self::CheckIntegrityConstraintViolation(_)
                | Self::ExclusionIntegrityConstraintViolation(_)
        )
    }

    /// Check whether re-running the whole transaction may succeed.
    #[must_use]
    pub fn is_transaction_rollback(&self) -> bool {
        matches!(self, Self::TransactionRollback(_))
    }
}

impl From<PoolError> for Error {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::PoolTerminating => Self::PoolTerminating,
            PoolError::PoolEnded => Self::PoolEnded,
            source => Self::Connection { source },
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;
