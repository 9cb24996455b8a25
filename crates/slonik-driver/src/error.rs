//! Driver-level error types and their classification.

use thiserror::Error;

/// SQLSTATE class prefix of transaction rollback errors (serialization
/// failure, deadlock detected, ...).
pub const TRANSACTION_ROLLBACK_CLASS: &str = "40";

const TUPLE_MOVED_MESSAGE: &str =
    "tuple to be locked was already moved to another partition due to concurrent update";

/// Broad category of a driver error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// The server rejected the statement (carries a SQLSTATE code).
    Server,
    /// The transport went away underneath the session.
    ConnectionLost,
    /// I/O failure while talking to the server.
    Io,
    /// Unexpected protocol traffic.
    Protocol,
    /// Anything else.
    Other,
}

/// An error reported by a driver.
///
/// Cloneable so that a backend-termination error can be remembered on the
/// connection and reported to every later statement.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct DriverError {
    /// Category.
    pub kind: DriverErrorKind,
    /// SQLSTATE code, if the server sent one.
    pub code: Option<String>,
    /// Primary message.
    pub message: String,
    /// Optional detail message.
    pub detail: Option<String>,
    /// Table the error relates to.
    pub table: Option<String>,
    /// Column the error relates to.
    pub column: Option<String>,
    /// Constraint the error relates to.
    pub constraint: Option<String>,
}

impl DriverError {
    fn with_kind(kind: DriverErrorKind, code: Option<String>, message: String) -> Self {
        Self {
            kind,
            code,
            message,
            detail: None,
            table: None,
            column: None,
            constraint: None,
        }
    }

    /// A server error with a SQLSTATE code.
    #[must_use]
    pub fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_kind(DriverErrorKind::Server, Some(code.into()), message.into())
    }

    /// The connection was lost (terminated unexpectedly).
    #[must_use]
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::with_kind(DriverErrorKind::ConnectionLost, None, message.into())
    }

    /// An I/O failure.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::with_kind(DriverErrorKind::Io, None, message.into())
    }

    /// A protocol failure.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::with_kind(DriverErrorKind::Protocol, None, message.into())
    }

    /// Any other failure.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::with_kind(DriverErrorKind::Other, None, message.into())
    }

    /// Attach a detail message.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach the table name.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Attach the column name.
    #[must_use]
    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }

    /// Attach the constraint name.
    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }

    /// Get the SQLSTATE code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// Classify using PostgreSQL SQLSTATE semantics.
    ///
    /// This is the default behaviour of [`Driver::classify`](crate::Driver::classify).
    #[must_use]
    pub fn sqlstate_class(&self) -> ErrorClass {
        if self.kind == DriverErrorKind::ConnectionLost {
            return ErrorClass::BackendTerminated;
        }

        // Reported with SQLSTATE 40001, so this must be checked before the class prefix.
        if self.message.contains(TUPLE_MOVED_MESSAGE) {
            return ErrorClass::TupleMovedToAnotherPartition;
        }

        let Some(code) = self.code() else {
            return ErrorClass::Other;
        };

        match code {
            "57P01" | "57P02" => ErrorClass::BackendTerminated,
            "57014" if self.message.contains("statement timeout") => ErrorClass::StatementTimeout,
            "57014" => ErrorClass::StatementCancelled,
            "23502" => ErrorClass::NotNullViolation,
            "23503" => ErrorClass::ForeignKeyViolation,
            "23505" => ErrorClass::UniqueViolation,
            "23514" => ErrorClass::CheckViolation,
            "23P01" => ErrorClass::ExclusionViolation,
            "42601" => ErrorClass::InputSyntax,
            c if c.starts_with(TRANSACTION_ROLLBACK_CLASS) => ErrorClass::TransactionRollback,
            _ => ErrorClass::Other,
        }
    }
}

/// Driver-agnostic classification of a [`DriverError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transient transaction failure that is safe to retry.
    TransactionRollback,
    /// The backend terminated the session.
    BackendTerminated,
    /// NOT NULL constraint violated.
    NotNullViolation,
    /// Foreign key constraint violated.
    ForeignKeyViolation,
    /// Unique constraint violated.
    UniqueViolation,
    /// CHECK constraint violated.
    CheckViolation,
    /// Exclusion constraint violated.
    ExclusionViolation,
    /// Row moved to another partition by a concurrent update.
    TupleMovedToAnotherPartition,
    /// Statement cancelled on request.
    StatementCancelled,
    /// Statement exceeded the statement timeout.
    StatementTimeout,
    /// SQL syntax error.
    InputSyntax,
    /// Not recognised.
    Other,
}

/// Errors converting values into Rust types.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TypeError {
    /// Value was NULL where a non-null type was requested.
    #[error("unexpected NULL value")]
    UnexpectedNull,

    /// Value has a different type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        /// Expected type.
        expected: &'static str,
        /// What was found.
        actual: String,
    },

    /// No column with the given name.
    #[error("column '{0}' not found")]
    ColumnNotFound(String),

    /// Column index past the end of the row.
    #[error("column index {index} out of bounds (row has {len} columns)")]
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Number of columns.
        len: usize,
    },
}
