//! Interceptors: hooks that observe or rewrite connections, queries and results.
//!
//! Every hook has a no-op default, so an interceptor implements only the
//! hooks it cares about. Interceptors run in the order they were configured.
//!
//! ```rust,ignore
//! use slonik_client::{Interceptor, Query, QueryContext, Result};
//!
//! struct Comment;
//!
//! #[async_trait::async_trait]
//! impl Interceptor for Comment {
//!     async fn transform_query(&self, ctx: &QueryContext, query: Query) -> Result<Query> {
//!         let sql = format!("/* {} */ {}", ctx.query_id, query.sql);
//!         Ok(Query { sql, ..query })
//!     }
//! }
//! ```

use async_trait::async_trait;
use slonik_driver::{Field, Notice, QueryResult, Row};

use crate::connection::{ConnectionContext, DatabaseConnection};
use crate::error::{Error, Result};
use crate::pool::DatabasePool;
use crate::query::{Query, QueryContext};

/// A set of optional hooks.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "interceptor"
    }

    /// Runs before a connection is taken from the pool.
    ///
    /// Returning a pool routes the whole operation (handler included) to that
    /// pool, whose own interceptors then run.
    async fn before_pool_connection(
        &self,
        _context: &ConnectionContext,
    ) -> Result<Option<DatabasePool>> {
        Ok(None)
    }

    /// Runs after a connection was taken from the pool. An error destroys the
    /// connection.
    async fn after_pool_connection(
        &self,
        _context: &ConnectionContext,
        _connection: &DatabaseConnection,
    ) -> Result<()> {
        Ok(())
    }

    /// Runs before a connection is returned to the pool. An error destroys
    /// the connection.
    async fn before_pool_connection_release(
        &self,
        _context: &ConnectionContext,
        _connection: &DatabaseConnection,
    ) -> Result<()> {
        Ok(())
    }

    /// Observes the query before any rewrite.
    async fn before_transform_query(&self, _context: &QueryContext, _query: &Query) -> Result<()> {
        Ok(())
    }

    /// Rewrites the query. Each interceptor sees the previous one's output.
    async fn transform_query(&self, _context: &QueryContext, query: Query) -> Result<Query> {
        Ok(query)
    }

    /// Runs right before the statement is sent. Returning a result skips the
    /// statement and every later hook.
    async fn before_query_execution(
        &self,
        _context: &QueryContext,
        _query: &Query,
    ) -> Result<Option<QueryResult>> {
        Ok(None)
    }

    /// Observes the raw result.
    async fn after_query_execution(
        &self,
        _context: &QueryContext,
        _query: &Query,
        _result: &QueryResult,
    ) -> Result<()> {
        Ok(())
    }

    /// Rewrites a result row. Each interceptor sees the previous one's output.
    async fn transform_row(
        &self,
        _context: &QueryContext,
        _query: &Query,
        row: Row,
        _fields: &[Field],
    ) -> Result<Row> {
        Ok(row)
    }

    /// Observes the final result before it is returned.
    async fn before_query_result(
        &self,
        _context: &QueryContext,
        _query: &Query,
        _result: &QueryResult,
    ) -> Result<()> {
        Ok(())
    }

    /// Observes the error a statement finally failed with.
    async fn query_execution_error(
        &self,
        _context: &QueryContext,
        _query: &Query,
        _error: &Error,
        _notices: &[Notice],
    ) {
    }
}

/// Applies the query's [`ResultParser`](crate::ResultParser) to every row.
///
/// Rows the parser rejects fail the statement with
/// [`Error::SchemaValidation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultParserInterceptor;

#[async_trait]
impl Interceptor for ResultParserInterceptor {
    fn name(&self) -> &str {
        "result-parser"
    }

    async fn transform_row(
        &self,
        context: &QueryContext,
        _query: &Query,
        row: Row,
        _fields: &[Field],
    ) -> Result<Row> {
        match &context.result_parser {
            Some(parser) => parser.parse(row).map_err(Error::SchemaValidation),
            None => Ok(row),
        }
    }
}
