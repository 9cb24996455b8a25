//! Tracing instrumentation for database operations.
//!
//! Statements, transactions and connection checkouts run inside `tracing`
//! spans named after [`span_names`]. Span and event fields follow the
//! OpenTelemetry database conventions:
//!
//! - `db.system`: "postgresql"
//! - `db.statement`: SQL statement (sanitized if configured)
//! - `db.operation`: statement verb (SELECT, INSERT, ...)
//! - `db.connection_id`: identifier of the connection checkout
//! - `db.query_id`: identifier of the statement
//! - `db.transaction_id`: identifier of the enclosing transaction
//! - `db.rows_affected`: row count of the result
//!
//! No subscriber is installed here; that is up to the application.

/// Database system identifier.
pub const DB_SYSTEM: &str = "postgresql";

/// Span names for database operations.
pub mod span_names {
    /// Span name for a connection checkout.
    pub const CONNECT: &str = "slonik.connect";
    /// Span name for statement execution.
    pub const QUERY: &str = "slonik.query";
    /// Span name for streamed statement execution.
    pub const STREAM: &str = "slonik.stream";
    /// Span name for a top-level transaction.
    pub const TRANSACTION: &str = "slonik.transaction";
    /// Span name for a nested transaction.
    pub const SAVEPOINT: &str = "slonik.savepoint";
}

/// Configuration for SQL statement sanitization.
#[derive(Debug, Clone)]
pub struct SanitizationConfig {
    /// Whether to sanitize SQL statements.
    pub enabled: bool,
    /// Maximum length of statement to record.
    pub max_length: usize,
}

impl Default for SanitizationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_length: 2048,
        }
    }
}

impl SanitizationConfig {
    /// Sanitize a SQL statement according to the configuration.
    #[must_use]
    pub fn sanitize(&self, sql: &str) -> String {
        if !self.enabled {
            return truncate_string(sql, self.max_length);
        }

        let sanitized = sanitize_sql(sql);
        truncate_string(&sanitized, self.max_length)
    }
}

/// Replace string and numeric literals with `?`.
///
/// Positional parameters (`$1`) and digits inside identifiers are kept.
fn sanitize_sql(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            if c == '\'' {
                // '' is an escaped quote
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    continue;
                }
                in_string = false;
                result.push('?');
            }
            continue;
        }

        if c == '\'' {
            in_string = true;
            continue;
        }

        if c.is_ascii_digit()
            && !result.ends_with(|ch: char| ch.is_alphanumeric() || ch == '_' || ch == '$')
        {
            while chars
                .peek()
                .is_some_and(|ch| ch.is_ascii_digit() || *ch == '.')
            {
                chars.next();
            }
            result.push('?');
            continue;
        }

        result.push(c);
    }

    if in_string {
        result.push('?');
    }

    result
}

/// Truncate a string to at most `max_len` bytes, on a character boundary.
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let limit = max_len.saturating_sub(3);
    let end = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= limit)
        .last()
        .unwrap_or(0);
    format!("{}...", &s[..end])
}

/// Extract the operation type from a SQL statement.
#[must_use]
pub fn extract_operation(sql: &str) -> &'static str {
    let sql_upper = sql.trim_start().to_uppercase();

    const OPERATIONS: &[(&str, &str)] = &[
        ("SELECT", "SELECT"),
        ("INSERT", "INSERT"),
        ("UPDATE", "UPDATE"),
        ("DELETE", "DELETE"),
        ("WITH", "WITH"),
        ("START TRANSACTION", "BEGIN"),
        ("BEGIN", "BEGIN"),
        ("COMMIT", "COMMIT"),
        ("ROLLBACK TO SAVEPOINT", "ROLLBACK TO SAVEPOINT"),
        ("ROLLBACK", "ROLLBACK"),
        ("SAVEPOINT", "SAVEPOINT"),
        ("CREATE", "CREATE"),
        ("ALTER", "ALTER"),
        ("DROP", "DROP"),
    ];

    OPERATIONS
        .iter()
        .find(|(prefix, _)| sql_upper.starts_with(*prefix))
        .map_or("OTHER", |&(_, operation)| operation)
}
