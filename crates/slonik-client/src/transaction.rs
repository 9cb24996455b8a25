//! Transactions and savepoints.
//!
//! A top-level transaction runs `START TRANSACTION` and ends with `COMMIT`
//! or `ROLLBACK`. Calling [`Transaction::transaction`] nests a savepoint
//! (`SAVEPOINT slonik_savepoint_<depth>`) that is rolled back on failure.
//!
//! While a transaction handler runs, its identifier is the ambient
//! transaction of the task. Statements issued through a connection that is
//! not part of it are rejected with
//! [`Error::UnexpectedForeignConnection`](crate::Error::UnexpectedForeignConnection)
//! unless `dangerously_allow_foreign_connections` is set.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use slonik_driver::QueryResult;
use slonik_pool::SessionState;
use tracing::Instrument;

use crate::connection::BoundConnection;
use crate::error::{Error, Result};
use crate::execution::{QueryStream, execute_query, execute_stream};
use crate::instrumentation::span_names;
use crate::query::Query;
use crate::routines::QueryMethods;

tokio::task_local! {
    static CURRENT_TRANSACTION: String;
}

/// Identifier of the transaction whose handler the current task is running.
#[must_use]
pub fn current_transaction_id() -> Option<String> {
    CURRENT_TRANSACTION.try_with(Clone::clone).ok()
}

/// Handle of an open transaction or savepoint.
///
/// Only the innermost open level may run statements.
#[derive(Clone)]
pub struct Transaction {
    connection: Arc<BoundConnection>,
    transaction_id: String,
    depth: u32,
}

impl Transaction {
    /// Identifier of the top-level transaction.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.transaction_id
    }

    /// Savepoint depth; 0 for the top-level transaction.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Identifier of the connection checkout the transaction runs on.
    #[must_use]
    pub fn connection_id(&self) -> String {
        self.connection.metadata.connection_id()
    }

    fn check(&self, session: &SessionState) -> Result<()> {
        if session.transaction_id.as_deref() != Some(self.transaction_id.as_str()) {
            return Err(Error::UnexpectedState(
                "Cannot use a transaction that has already completed.".into(),
            ));
        }
        match session.transaction_depth {
            Some(depth) if depth == self.depth => Ok(()),
            Some(depth) if depth > self.depth => Err(Error::UnexpectedState(
                "Cannot run a query using parent transaction.".into(),
            )),
            _ => Err(Error::UnexpectedState(
                "Cannot use a savepoint that has already completed.".into(),
            )),
        }
    }

    fn ensure_innermost(&self) -> Result<()> {
        self.connection.ensure_usable()?;
        self.check(&self.connection.metadata.session())
    }

    /// Run `handler` inside a savepoint.
    ///
    /// A failing handler rolls back to the savepoint and its error is
    /// returned; the enclosing transaction stays usable.
    pub async fn transaction<T, F, Fut>(&self, handler: F) -> Result<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.connection.ensure_usable()?;
        let depth = self.depth + 1;
        self.connection.metadata.with_session(|session| {
            self.check(session)?;
            session.transaction_depth = Some(depth);
            Ok::<_, Error>(())
        })?;

        let savepoint = format!("slonik_savepoint_{depth}");
        let span = tracing::debug_span!(
            span_names::SAVEPOINT,
            db.transaction_id = %self.transaction_id,
            savepoint = %savepoint,
        );
        let outcome = async {
            execute_query(
                &self.connection,
                Some(&self.transaction_id),
                Query::new(format!("SAVEPOINT {savepoint}")),
            )
            .await?;

            let nested = Transaction {
                connection: Arc::clone(&self.connection),
                transaction_id: self.transaction_id.clone(),
                depth,
            };
            match CURRENT_TRANSACTION
                .scope(self.transaction_id.clone(), handler(nested))
                .await
            {
                Ok(value) => Ok(value),
                Err(error) => {
                    tracing::debug!(%error, "rolling back to savepoint");
                    if let Err(rollback_error) = execute_query(
                        &self.connection,
                        Some(&self.transaction_id),
                        Query::new(format!("ROLLBACK TO SAVEPOINT {savepoint}")),
                    )
                    .await
                    {
                        tracing::warn!(error = %rollback_error, "failed to roll back to savepoint");
                    }
                    Err(error)
                }
            }
        }
        .instrument(span)
        .await;

        self.connection
            .metadata
            .with_session(|session| session.transaction_depth = Some(self.depth));
        outcome
    }

    /// Stream the rows of a query into `consumer`.
    pub async fn stream<T, F, Fut>(&self, query: impl Into<Query>, consumer: F) -> Result<T>
    where
        F: FnOnce(QueryStream) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_innermost()?;
        execute_stream(
            &self.connection,
            Some(&self.transaction_id),
            query.into(),
            consumer,
        )
        .await
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("transaction_id", &self.transaction_id)
            .field("depth", &self.depth)
            .finish()
    }
}

#[async_trait]
impl QueryMethods for Transaction {
    async fn query(&self, query: Query) -> Result<QueryResult> {
        self.ensure_innermost()?;
        execute_query(&self.connection, Some(&self.transaction_id), query).await
    }
}

/// Run a top-level transaction, re-running it on rollback-class failures.
pub(crate) async fn run_transaction<T, F, Fut>(
    connection: &Arc<BoundConnection>,
    mut handler: F,
) -> Result<T>
where
    F: FnMut(Transaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let limit = connection.context.config.transaction_retry_limit;
    let mut attempt = 0;
    loop {
        match execute_transaction(connection, &mut handler).await {
            Err(error) if error.is_transaction_rollback() && attempt < limit => {
                attempt += 1;
                tracing::warn!(attempt, limit, %error, "retrying transaction");
            }
            outcome => return outcome,
        }
    }
}

async fn execute_transaction<T, F, Fut>(
    connection: &Arc<BoundConnection>,
    handler: &mut F,
) -> Result<T>
where
    F: FnMut(Transaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let transaction_id = uuid::Uuid::new_v4().to_string();
    let started = connection.metadata.with_session(|session| {
        if session.transaction_depth.is_some() {
            return false;
        }
        session.transaction_depth = Some(0);
        session.transaction_id = Some(transaction_id.clone());
        true
    });
    if !started {
        return Err(Error::UnexpectedState(
            "Cannot use the same connection to start a new transaction before completing the last transaction.".into(),
        ));
    }

    let span = tracing::debug_span!(
        span_names::TRANSACTION,
        db.connection_id = %connection.metadata.connection_id(),
        db.transaction_id = %transaction_id,
    );
    let outcome = async {
        execute_query(
            connection,
            Some(&transaction_id),
            Query::new("START TRANSACTION"),
        )
        .await?;

        let transaction = Transaction {
            connection: Arc::clone(connection),
            transaction_id: transaction_id.clone(),
            depth: 0,
        };
        match CURRENT_TRANSACTION
            .scope(transaction_id.clone(), handler(transaction))
            .await
        {
            Ok(value) => {
                if let Err(error) =
                    execute_query(connection, Some(&transaction_id), Query::new("COMMIT")).await
                {
                    tracing::debug!(%error, "commit failed");
                    rollback(connection, &transaction_id).await;
                    return Err(error);
                }
                Ok(value)
            }
            Err(error) => {
                tracing::debug!(%error, "transaction handler failed");
                rollback(connection, &transaction_id).await;
                Err(error)
            }
        }
    }
    .instrument(span)
    .await;

    connection.metadata.with_session(|session| {
        session.transaction_depth = None;
        session.transaction_id = None;
    });
    outcome
}

async fn rollback(connection: &BoundConnection, transaction_id: &str) {
    if let Err(error) =
        execute_query(connection, Some(transaction_id), Query::new("ROLLBACK")).await
    {
        tracing::warn!(%error, "failed to roll back transaction");
    }
}
