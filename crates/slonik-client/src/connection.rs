//! Connection establishment and the bound connection handle.
//!
//! A connection is checked out for the duration of a handler. Around the
//! handler run the connection hooks of the configured interceptors; while it
//! runs, a backend error published by the driver interrupts it.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use slonik_driver::{ClientEvent, DriverClient, DriverError, QueryResult};
use slonik_pool::{ConnectionMetadata, Pool, PoolError, PooledConnection};
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::error::{Error, Result};
use crate::execution::{QueryStream, execute_query, execute_stream};
use crate::instrumentation::span_names;
use crate::pool::{ClientContext, DatabasePool};
use crate::query::Query;
use crate::routines::QueryMethods;
use crate::transaction::{Transaction, current_transaction_id, run_transaction};

/// How a connection came to be checked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionType {
    /// `DatabasePool::connect`.
    Explicit,
    /// A query method called on the pool.
    ImplicitQuery,
    /// `DatabasePool::transaction`.
    ImplicitTransaction,
}

/// Context passed to the connection hooks of an interceptor.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// How the connection is being checked out.
    pub connection_type: ConnectionType,
    /// Pool the connection comes from.
    pub pool_id: String,
    /// Identifier of the checkout; `None` before a connection was acquired.
    pub connection_id: Option<String>,
    /// The query that caused the checkout, for implicit query connections.
    pub query: Option<Query>,
}

/// A physical connection bound to one checkout.
pub(crate) struct BoundConnection {
    pub(crate) client: Arc<dyn DriverClient>,
    pub(crate) metadata: Arc<ConnectionMetadata>,
    pub(crate) context: Arc<ClientContext>,
    released: AtomicBool,
}

impl BoundConnection {
    fn new(pooled: &PooledConnection, context: Arc<ClientContext>) -> Self {
        Self {
            client: Arc::clone(pooled.client()),
            metadata: Arc::clone(pooled.metadata()),
            context,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::UnexpectedState(
                "Cannot use released connection".into(),
            ));
        }
        Ok(())
    }

    fn invalidate(&self) {
        self.released.store(true, Ordering::Release);
    }
}

/// A connection checked out for the duration of a handler.
///
/// Cloning is cheap. Every clone stops working once the handler returns.
#[derive(Clone)]
pub struct DatabaseConnection {
    pub(crate) inner: Arc<BoundConnection>,
}

impl DatabaseConnection {
    /// Identifier of this checkout.
    #[must_use]
    pub fn connection_id(&self) -> String {
        self.inner.metadata.connection_id()
    }

    /// Identifier of the pool the connection belongs to.
    #[must_use]
    pub fn pool_id(&self) -> &str {
        self.inner.metadata.pool_id()
    }

    /// Current savepoint depth; `None` outside of a transaction.
    #[must_use]
    pub fn transaction_depth(&self) -> Option<u32> {
        self.inner.metadata.transaction_depth()
    }

    /// Run `handler` inside a transaction on this connection.
    ///
    /// Commits when the handler succeeds and rolls back when it fails. The
    /// whole transaction is re-run on rollback-class failures, up to
    /// `transaction_retry_limit` times, so the handler may be called more
    /// than once.
    pub async fn transaction<T, F, Fut>(&self, handler: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner.ensure_usable()?;
        run_transaction(&self.inner, handler).await
    }

    /// Stream the rows of a query into `consumer`.
    ///
    /// The connection runs no other statement until `consumer` returns.
    pub async fn stream<T, F, Fut>(&self, query: impl Into<Query>, consumer: F) -> Result<T>
    where
        F: FnOnce(QueryStream) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.inner.ensure_usable()?;
        let ambient = current_transaction_id();
        execute_stream(&self.inner, ambient.as_deref(), query.into(), consumer).await
    }
}

impl std::fmt::Debug for DatabaseConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConnection")
            .field("connection_id", &self.connection_id())
            .field("pool_id", &self.pool_id())
            .finish()
    }
}

#[async_trait]
impl QueryMethods for DatabaseConnection {
    async fn query(&self, query: Query) -> Result<QueryResult> {
        self.inner.ensure_usable()?;
        let ambient = current_transaction_id();
        execute_query(&self.inner, ambient.as_deref(), query).await
    }
}

/// Acquire a connection, retrying up to `retry_limit` times.
///
/// The connection's session state is reset for the new checkout.
pub(crate) async fn establish_connection(pool: &Pool, retry_limit: u32) -> Result<PooledConnection> {
    let mut attempt = 0;
    loop {
        match pool.acquire().await {
            Ok(pooled) => {
                let connection_id = uuid::Uuid::new_v4().to_string();
                pooled.metadata().reset(connection_id.as_str());
                tracing::debug!(
                    db.pool_id = %pool.id(),
                    db.connection_id = %connection_id,
                    "connection acquired"
                );
                return Ok(pooled);
            }
            Err(error @ (PoolError::PoolTerminating | PoolError::PoolEnded)) => {
                return Err(error.into());
            }
            Err(error) if attempt < retry_limit => {
                attempt += 1;
                tracing::warn!(
                    db.pool_id = %pool.id(),
                    attempt,
                    retry_limit,
                    %error,
                    "failed to acquire connection; retrying"
                );
            }
            Err(source) => {
                tracing::warn!(db.pool_id = %pool.id(), error = %source, "failed to acquire connection");
                return Err(Error::Connection { source });
            }
        }
    }
}

/// Pick the pool that serves this checkout.
///
/// A `before_pool_connection` hook may hand the operation to another pool,
/// whose own hooks then run.
async fn route(
    pool: &DatabasePool,
    connection_type: ConnectionType,
    query: Option<&Query>,
) -> Result<DatabasePool> {
    let mut target = pool.clone();
    'routing: loop {
        target.ensure_accepting()?;

        let context = ConnectionContext {
            connection_type,
            pool_id: target.id().to_string(),
            connection_id: None,
            query: query.cloned(),
        };
        let interceptors = target.config().interceptors.clone();
        for interceptor in &interceptors {
            if let Some(alternate) = interceptor.before_pool_connection(&context).await? {
                if alternate.id() != target.id() {
                    tracing::debug!(
                        interceptor = interceptor.name(),
                        from = %target.id(),
                        to = %alternate.id(),
                        "routing connection to another pool"
                    );
                    target = alternate;
                    continue 'routing;
                }
            }
        }
        return Ok(target);
    }
}

/// Run `handler` with a connection checked out from `pool`.
pub(crate) async fn create_connection<T, F, Fut>(
    pool: &DatabasePool,
    connection_type: ConnectionType,
    query: Option<&Query>,
    handler: F,
) -> Result<T>
where
    F: FnOnce(DatabaseConnection) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let target = route(pool, connection_type, query).await?;
    let context = target.context();

    let pooled =
        establish_connection(&context.pool, context.config.connection_retry_limit).await?;
    let connection = DatabaseConnection {
        inner: Arc::new(BoundConnection::new(&pooled, Arc::clone(context))),
    };
    let metadata = Arc::clone(&connection.inner.metadata);
    let hook_context = ConnectionContext {
        connection_type,
        pool_id: target.id().to_string(),
        connection_id: Some(metadata.connection_id()),
        query: query.cloned(),
    };
    let mut events = connection.inner.client.subscribe();
    let checkout = Checkout {
        pooled: Some(pooled),
    };

    for interceptor in &context.config.interceptors {
        if let Err(error) = interceptor
            .after_pool_connection(&hook_context, &connection)
            .await
        {
            tracing::debug!(interceptor = interceptor.name(), %error, "after_pool_connection failed");
            connection.inner.invalidate();
            checkout.finish(true).await;
            return Err(error);
        }
    }

    let span = tracing::debug_span!(
        span_names::CONNECT,
        db.pool_id = %hook_context.pool_id,
        db.connection_id = hook_context.connection_id.as_deref().unwrap_or_default(),
        connection_type = ?connection_type,
    );
    let outcome = async {
        tokio::select! {
            result = handler(connection.clone()) => result,
            error = backend_error(&mut events) => {
                tracing::warn!(%error, "backend terminated while the connection was in use");
                metadata.mark_terminated(error.clone());
                Err(Error::BackendTerminated(error))
            }
        }
    }
    .instrument(span)
    .await;

    let terminated = metadata.terminated().is_some();
    match outcome {
        Ok(value) if !terminated => {
            for interceptor in &context.config.interceptors {
                if let Err(error) = interceptor
                    .before_pool_connection_release(&hook_context, &connection)
                    .await
                {
                    tracing::debug!(
                        interceptor = interceptor.name(),
                        %error,
                        "before_pool_connection_release failed"
                    );
                    connection.inner.invalidate();
                    checkout.finish(true).await;
                    return Err(error);
                }
            }
            connection.inner.invalidate();
            checkout.finish(false).await;
            Ok(value)
        }
        outcome => {
            connection.inner.invalidate();
            let destroy = terminated || metadata.transaction_depth().is_some();
            checkout.finish(destroy).await;
            outcome
        }
    }
}

/// Wait for an out-of-band error on the connection.
async fn backend_error(events: &mut broadcast::Receiver<ClientEvent>) -> DriverError {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Error(error)) => return error,
            Ok(ClientEvent::Notice(_)) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Owns the pooled connection of a checkout until it is given back.
///
/// If the checkout is abandoned (its future dropped), a connection that was
/// terminated or left inside a transaction is destroyed rather than reused.
struct Checkout {
    pooled: Option<PooledConnection>,
}

impl Checkout {
    async fn finish(mut self, destroy: bool) {
        if let Some(pooled) = self.pooled.take() {
            if destroy {
                pooled.destroy().await;
            } else {
                pooled.release().await;
            }
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        let Some(pooled) = self.pooled.take() else {
            return;
        };
        let metadata = pooled.metadata();
        if metadata.terminated().is_none() && metadata.transaction_depth().is_none() {
            // The handle releases itself.
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            tracing::debug!(
                db.connection_id = %metadata.connection_id(),
                "abandoned connection is mid-transaction; destroying it"
            );
            runtime.spawn(pooled.destroy());
        }
    }
}
