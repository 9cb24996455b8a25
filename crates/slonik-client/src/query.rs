//! Queries and the per-statement context threaded through interceptors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use slonik_driver::{Row, Value};

/// Validates or rewrites a single result row.
///
/// Attach one to a query with [`Query::parse_with`]; it is exposed to
/// interceptors as [`QueryContext::result_parser`] and applied by
/// [`ResultParserInterceptor`](crate::ResultParserInterceptor).
pub trait ResultParser: Send + Sync {
    /// Parse a row, returning a description of the problem on failure.
    fn parse(&self, row: Row) -> Result<Row, String>;
}

impl<F> ResultParser for F
where
    F: Fn(Row) -> Result<Row, String> + Send + Sync,
{
    fn parse(&self, row: Row) -> Result<Row, String> {
        self(row)
    }
}

/// A SQL statement with its bound values.
///
/// Values are bound positionally (`$1`, `$2`, ...).
#[derive(Clone)]
pub struct Query {
    /// SQL text.
    pub sql: String,
    /// Bound values.
    pub values: Vec<Value>,
    /// Optional row parser.
    pub parser: Option<Arc<dyn ResultParser>>,
}

impl Query {
    /// Create a query without bound values.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            values: Vec::new(),
            parser: None,
        }
    }

    /// Bind the next positional value.
    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.values.push(value.into());
        self
    }

    /// Replace all bound values.
    #[must_use]
    pub fn with_values(mut self, values: Vec<Value>) -> Self {
        self.values = values;
        self
    }

    /// Attach a row parser.
    #[must_use]
    pub fn parse_with(mut self, parser: impl ResultParser + 'static) -> Self {
        self.parser = Some(Arc::new(parser));
        self
    }
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("sql", &self.sql)
            .field("values", &self.values)
            .field("parser", &self.parser.is_some())
            .finish()
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.sql == other.sql && self.values == other.values
    }
}

impl From<&str> for Query {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Query {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

/// Scratch space shared by the interceptors of one statement.
///
/// The engine never reads it.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    entries: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl Sandbox {
    /// Get a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.lock().get(key).cloned()
    }

    /// Set a value, returning the previous one.
    pub fn insert(
        &self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Option<serde_json::Value> {
        self.entries.lock().insert(key.into(), value.into())
    }

    /// Remove a value.
    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.lock().remove(key)
    }
}

/// Per-statement context passed to every query hook.
#[derive(Clone)]
pub struct QueryContext {
    /// Identifier of the current checkout of the connection.
    pub connection_id: String,
    /// Identifier of the pool.
    pub pool_id: String,
    /// Identifier of this statement.
    pub query_id: String,
    /// Transaction the connection is in, if any.
    pub transaction_id: Option<String>,
    /// When the statement entered the engine.
    pub query_input_time: Instant,
    /// The query as submitted, before any rewrite.
    pub original_query: Query,
    /// Row parser attached to the query.
    pub result_parser: Option<Arc<dyn ResultParser>>,
    /// Interceptor scratch space.
    pub sandbox: Sandbox,
}

impl std::fmt::Debug for QueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryContext")
            .field("connection_id", &self.connection_id)
            .field("pool_id", &self.pool_id)
            .field("query_id", &self.query_id)
            .field("transaction_id", &self.transaction_id)
            .field("original_query", &self.original_query)
            .finish_non_exhaustive()
    }
}
