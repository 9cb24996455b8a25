//! Statement results and server notices.

use crate::row::{Field, Row};

/// A notice (non-error message) raised by the server while a statement ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Severity (`NOTICE`, `WARNING`, `INFO`, ...).
    pub severity: String,
    /// SQLSTATE code, if any.
    pub code: Option<String>,
    /// Message text.
    pub message: String,
}

impl Notice {
    /// Create a `NOTICE` severity notice.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            severity: "NOTICE".to_string(),
            code: None,
            message: message.into(),
        }
    }
}

/// The result of a single statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Command tag verb (`SELECT`, `INSERT`, ...).
    pub command: String,
    /// Column metadata.
    pub fields: Vec<Field>,
    /// Rows returned.
    pub rows: Vec<Row>,
    /// Rows affected (or returned, for `SELECT`).
    pub row_count: u64,
    /// Notices collected while the statement executed.
    pub notices: Vec<Notice>,
}

impl QueryResult {
    /// Build a result from rows, deriving the row count.
    #[must_use]
    pub fn from_rows(command: impl Into<String>, fields: Vec<Field>, rows: Vec<Row>) -> Self {
        let row_count = rows.len() as u64;
        Self {
            command: command.into(),
            fields,
            rows,
            row_count,
            notices: Vec::new(),
        }
    }

    /// Build a result for a command that returns no rows.
    #[must_use]
    pub fn command(command: impl Into<String>, row_count: u64) -> Self {
        Self {
            command: command.into(),
            row_count,
            ..Self::default()
        }
    }
}

/// Parse the rows-affected count from a command tag.
///
/// `INSERT 0 5` → 5, `UPDATE 3` → 3, anything unrecognised → 0.
#[must_use]
pub fn parse_rows_affected(tag: &str) -> u64 {
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n] | ["UPDATE", n] | ["DELETE", n] | ["SELECT", n] | ["MERGE", n]
        | ["COPY", n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}
