//! The statement execution engine.
//!
//! Every statement, buffered or streamed, goes through here: input
//! validation, the foreign-connection guard, the interceptor pipeline,
//! per-connection serialization, retries and error classification.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use futures_core::Stream;
use futures_util::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use slonik_driver::{ClientEvent, Driver, DriverError, ErrorClass, Notice, QueryResult, Row};
use slonik_pool::ConnectionMetadata;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::connection::BoundConnection;
use crate::error::{Error, Result};
use crate::instrumentation::{DB_SYSTEM, extract_operation, span_names};
use crate::interceptor::Interceptor;
use crate::query::{Query, QueryContext, Sandbox};

/// Rows of a streamed statement.
///
/// The connection runs no other statement while the stream is alive.
pub type QueryStream = Pin<Box<dyn Stream<Item = Result<Row>> + Send + 'static>>;

#[allow(clippy::unwrap_used)]
static LONE_PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*\$\d+\s*$").unwrap());

/// Validate a statement and run the pre-execution query hooks.
async fn prepare(
    connection: &BoundConnection,
    ambient_transaction: Option<&str>,
    query: Query,
) -> Result<(QueryContext, Query)> {
    if let Some(error) = connection.metadata.terminated() {
        return Err(Error::BackendTerminated(error));
    }
    if query.sql.trim().is_empty() {
        return Err(Error::InvalidInput(
            "Unexpected SQL input. Query cannot be empty.".into(),
        ));
    }
    if LONE_PLACEHOLDER.is_match(&query.sql) {
        return Err(Error::InvalidInput(
            "Unexpected SQL input. Query cannot be empty. Found only value binding.".into(),
        ));
    }

    let session = connection.metadata.session();
    if let Some(ambient) = ambient_transaction {
        if !connection.context.config.dangerously_allow_foreign_connections
            && session.transaction_id.as_deref() != Some(ambient)
        {
            return Err(Error::UnexpectedForeignConnection);
        }
    }

    let context = QueryContext {
        connection_id: session.connection_id,
        pool_id: connection.metadata.pool_id().to_string(),
        query_id: uuid::Uuid::new_v4().to_string(),
        transaction_id: session.transaction_id,
        query_input_time: Instant::now(),
        original_query: query.clone(),
        result_parser: query.parser.clone(),
        sandbox: Sandbox::default(),
    };

    let interceptors = &connection.context.config.interceptors;
    for interceptor in interceptors {
        interceptor.before_transform_query(&context, &query).await?;
    }
    let mut query = query;
    for interceptor in interceptors {
        query = interceptor.transform_query(&context, query).await?;
    }

    Ok((context, query))
}

/// Open a statement span named `$name` with the database fields filled in.
macro_rules! statement_span {
    ($name:expr, $connection:expr, $context:expr, $query:expr) => {{
        let statement = $connection.context.config.sanitization.sanitize(&$query.sql);
        tracing::debug_span!(
            $name,
            db.system = DB_SYSTEM,
            db.statement = %statement,
            db.operation = extract_operation(&$query.sql),
            db.connection_id = %$context.connection_id,
            db.query_id = %$context.query_id,
            db.transaction_id = $context.transaction_id.as_deref().unwrap_or_default(),
        )
    }};
}

/// Execute a buffered statement.
pub(crate) async fn execute_query(
    connection: &BoundConnection,
    ambient_transaction: Option<&str>,
    query: Query,
) -> Result<QueryResult> {
    let (context, query) = prepare(connection, ambient_transaction, query).await?;
    let interceptors = &connection.context.config.interceptors;

    for interceptor in interceptors {
        if let Some(result) = interceptor.before_query_execution(&context, &query).await? {
            tracing::debug!(
                interceptor = interceptor.name(),
                db.query_id = %context.query_id,
                "statement short-circuited"
            );
            return Ok(result);
        }
    }

    let span = statement_span!(span_names::QUERY, connection, context, query);
    let outcome = run(connection, &query).instrument(span).await;

    let mut result = match outcome {
        Ok(result) => result,
        Err((error, notices)) => {
            for interceptor in interceptors {
                interceptor
                    .query_execution_error(&context, &query, &error, &notices)
                    .await;
            }
            return Err(error);
        }
    };

    for interceptor in interceptors {
        interceptor
            .after_query_execution(&context, &query, &result)
            .await?;
    }

    let rows = std::mem::take(&mut result.rows);
    let mut transformed = Vec::with_capacity(rows.len());
    for row in rows {
        transformed.push(transform_row(interceptors, &context, &query, row).await?);
    }
    result.rows = transformed;

    for interceptor in interceptors {
        interceptor
            .before_query_result(&context, &query, &result)
            .await?;
    }

    Ok(result)
}

/// Send the statement while holding the connection's statement turn.
async fn run(
    connection: &BoundConnection,
    query: &Query,
) -> std::result::Result<QueryResult, (Error, Vec<Notice>)> {
    let _turn = connection.metadata.statements().enter().await;

    // The backend may have gone away while this statement was queued.
    if let Some(error) = connection.metadata.terminated() {
        return Err((Error::BackendTerminated(error), Vec::new()));
    }

    let mut events = connection.client.subscribe();
    let started = Instant::now();
    let outcome = query_with_retry(connection, query).await;
    let mut notices = drain_notices(&mut events);

    match outcome {
        Ok(mut result) => {
            result.notices.append(&mut notices);
            tracing::debug!(
                db.rows_affected = result.row_count,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "statement completed"
            );
            Ok(result)
        }
        Err(error) => {
            tracing::debug!(%error, "statement failed");
            let error = translate(
                connection.context.driver.as_ref(),
                &connection.metadata,
                error,
                notices.clone(),
            );
            Err((error, notices))
        }
    }
}

/// Send the statement, retrying rollback-class failures outside of transactions.
async fn query_with_retry(
    connection: &BoundConnection,
    query: &Query,
) -> std::result::Result<QueryResult, DriverError> {
    let limit = connection.context.config.query_retry_limit;
    let mut attempt = 0;
    loop {
        match connection.client.query(&query.sql, &query.values).await {
            Ok(result) => return Ok(result),
            Err(error)
                if attempt < limit
                    && connection.metadata.transaction_depth().is_none()
                    && connection.context.driver.classify(&error)
                        == ErrorClass::TransactionRollback =>
            {
                attempt += 1;
                tracing::warn!(attempt, limit, %error, "retrying statement");
            }
            Err(error) => return Err(error),
        }
    }
}

fn drain_notices(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<Notice> {
    let mut notices = Vec::new();
    loop {
        match events.try_recv() {
            Ok(ClientEvent::Notice(notice)) => notices.push(notice),
            Ok(ClientEvent::Error(_)) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return notices,
        }
    }
}

/// Map a driver error to the client error taxonomy.
///
/// A backend-terminated error also marks the connection as terminated.
pub(crate) fn translate(
    driver: &dyn Driver,
    metadata: &ConnectionMetadata,
    error: DriverError,
    notices: Vec<Notice>,
) -> Error {
    match driver.classify(&error) {
        ErrorClass::BackendTerminated => {
            metadata.mark_terminated(error.clone());
            Error::BackendTerminated(error)
        }
        ErrorClass::NotNullViolation => Error::NotNullIntegrityConstraintViolation(error.into()),
        ErrorClass::ForeignKeyViolation => {
            Error::ForeignKeyIntegrityConstraintViolation(error.into())
        }
        ErrorClass::UniqueViolation => Error::UniqueIntegrityConstraintViolation(error.into()),
        ErrorClass::CheckViolation => Error::CheckIntegrityConstraintViolation(error.into()),
        ErrorClass::ExclusionViolation => {
            Error::ExclusionIntegrityConstraintViolation(error.into())
        }
        ErrorClass::TupleMovedToAnotherPartition => Error::TupleMovedToAnotherPartition(error),
        ErrorClass::TransactionRollback => Error::TransactionRollback(error),
        ErrorClass::StatementCancelled => Error::StatementCancelled(error),
        ErrorClass::StatementTimeout => Error::StatementTimeout(error),
        ErrorClass::InputSyntax => Error::InputSyntax(error),
        ErrorClass::Other => Error::Query {
            source: error,
            notices,
        },
    }
}

async fn transform_row(
    interceptors: &[Arc<dyn Interceptor>],
    context: &QueryContext,
    query: &Query,
    mut row: Row,
) -> Result<Row> {
    if interceptors.is_empty() {
        return Ok(row);
    }
    let fields = row.fields().to_vec();
    for interceptor in interceptors {
        row = interceptor.transform_row(context, query, row, &fields).await?;
    }
    Ok(row)
}

/// Execute a statement and hand its rows to `consumer` as they arrive.
///
/// `before_query_execution` hooks do not run for streams.
pub(crate) async fn execute_stream<T, F, Fut>(
    connection: &Arc<BoundConnection>,
    ambient_transaction: Option<&str>,
    query: Query,
    consumer: F,
) -> Result<T>
where
    F: FnOnce(QueryStream) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let (context, query) = prepare(connection, ambient_transaction, query).await?;
    let span = statement_span!(span_names::STREAM, connection, context, query);

    let opened = async {
        let turn = connection.metadata.statements().enter().await;
        if let Some(error) = connection.metadata.terminated() {
            return Err(Error::BackendTerminated(error));
        }
        match connection.client.stream(&query.sql, &query.values).await {
            Ok(rows) => Ok((turn, rows)),
            Err(error) => Err(translate(
                connection.context.driver.as_ref(),
                &connection.metadata,
                error,
                Vec::new(),
            )),
        }
    }
    .instrument(span.clone())
    .await;

    let (turn, rows) = match opened {
        Ok(opened) => opened,
        Err(error) => {
            for interceptor in &connection.context.config.interceptors {
                interceptor
                    .query_execution_error(&context, &query, &error, &[])
                    .await;
            }
            return Err(error);
        }
    };

    let driver = Arc::clone(&connection.context.driver);
    let metadata = Arc::clone(&connection.metadata);
    let interceptors: Arc<[Arc<dyn Interceptor>]> =
        connection.context.config.interceptors.clone().into();
    let row_context = Arc::new(context);
    let row_query = Arc::new(query);

    let stream = rows.then(move |item| {
        // The turn lives as long as the stream.
        let _turn = &turn;
        let driver = Arc::clone(&driver);
        let metadata = Arc::clone(&metadata);
        let interceptors = Arc::clone(&interceptors);
        let context = Arc::clone(&row_context);
        let query = Arc::clone(&row_query);
        async move {
            match item {
                Ok(row) => transform_row(&interceptors, &context, &query, row).await,
                Err(error) => Err(translate(driver.as_ref(), &metadata, error, Vec::new())),
            }
        }
    });

    consumer(Box::pin(stream)).instrument(span).await
}
