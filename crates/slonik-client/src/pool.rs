//! The database pool: the entry point of the client.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use slonik_driver::{Driver, QueryResult};
use slonik_pool::{Pool, PoolLifecycle, PoolMetrics, PoolStatus};

use crate::config::ClientConfig;
use crate::connection::{ConnectionType, DatabaseConnection, create_connection};
use crate::error::{Error, Result};
use crate::execution::{QueryStream, execute_query, execute_stream};
use crate::query::Query;
use crate::routines::QueryMethods;
use crate::transaction::{Transaction, current_transaction_id, run_transaction};

/// State shared by a pool and every connection checked out from it.
pub(crate) struct ClientContext {
    pub(crate) pool: Pool,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) config: ClientConfig,
}

/// A pool of database connections.
///
/// Cloning is cheap; clones share the same connections.
///
/// ```rust,ignore
/// use slonik_client::{ClientConfig, DatabasePool, QueryMethods};
///
/// let pool = DatabasePool::new(driver, ClientConfig::new().maximum_pool_size(4))?;
/// let count = pool.one_first("SELECT count(*) FROM users").await?;
///
/// pool.transaction(|tx| async move {
///     tx.query("UPDATE users SET active = false".into()).await?;
///     Ok(())
/// })
/// .await?;
///
/// pool.end().await;
/// ```
#[derive(Clone)]
pub struct DatabasePool {
    inner: Arc<ClientContext>,
}

/// Create a pool. Same as [`DatabasePool::new`].
pub fn create_pool(driver: Arc<dyn Driver>, config: ClientConfig) -> Result<DatabasePool> {
    DatabasePool::new(driver, config)
}

impl DatabasePool {
    /// Create a pool. No connection is opened until one is needed (or
    /// `minimum_pool_size` asks for it).
    pub fn new(driver: Arc<dyn Driver>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let pool = Pool::new(Arc::clone(&driver), config.pool_config())
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))?;
        tracing::debug!(
            db.pool_id = %pool.id(),
            interceptors = config.interceptors.len(),
            "database pool created"
        );
        Ok(Self {
            inner: Arc::new(ClientContext {
                pool,
                driver,
                config,
            }),
        })
    }

    pub(crate) fn context(&self) -> &Arc<ClientContext> {
        &self.inner
    }

    /// Pool identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        self.inner.pool.id()
    }

    /// The configuration the pool was created with.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Connection counts.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.pool.status()
    }

    /// Checkout and reset counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.pool.metrics()
    }

    /// Lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> PoolLifecycle {
        self.inner.pool.lifecycle()
    }

    /// Shut the pool down.
    ///
    /// New work is refused immediately. Checked-out connections are waited
    /// for up to `graceful_termination_timeout`, then closed.
    pub async fn end(&self) {
        self.inner.pool.end().await;
    }

    pub(crate) fn ensure_accepting(&self) -> Result<()> {
        match self.inner.pool.lifecycle() {
            PoolLifecycle::Active => Ok(()),
            PoolLifecycle::Ending => Err(Error::PoolTerminating),
            PoolLifecycle::Ended => Err(Error::PoolEnded),
        }
    }

    /// Run `handler` with a dedicated connection.
    ///
    /// Statements issued through the connection run on the same session in
    /// submission order. The connection goes back to the pool when the
    /// handler returns.
    pub async fn connect<T, F, Fut>(&self, handler: F) -> Result<T>
    where
        F: FnOnce(DatabaseConnection) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        create_connection(self, ConnectionType::Explicit, None, handler).await
    }

    /// Run `handler` inside a transaction on a dedicated connection.
    ///
    /// See [`DatabaseConnection::transaction`].
    pub async fn transaction<T, F, Fut>(&self, handler: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        create_connection(
            self,
            ConnectionType::ImplicitTransaction,
            None,
            |connection| async move { run_transaction(&connection.inner, handler).await },
        )
        .await
    }

    /// Stream the rows of a query into `consumer`.
    pub async fn stream<T, F, Fut>(&self, query: impl Into<Query>, consumer: F) -> Result<T>
    where
        F: FnOnce(QueryStream) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let query = query.into();
        let ambient = self.check_ambient_transaction()?;
        let routed = query.clone();
        create_connection(
            self,
            ConnectionType::ImplicitQuery,
            Some(&routed),
            |connection| async move {
                execute_stream(&connection.inner, ambient.as_deref(), query, consumer).await
            },
        )
        .await
    }

    /// Reject pool-level statements issued from inside a transaction handler.
    fn check_ambient_transaction(&self) -> Result<Option<String>> {
        let ambient = current_transaction_id();
        if ambient.is_some() && !self.inner.config.dangerously_allow_foreign_connections {
            return Err(Error::UnexpectedForeignConnection);
        }
        Ok(ambient)
    }
}

impl std::fmt::Debug for DatabasePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePool")
            .field("id", &self.id())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}

#[async_trait]
impl QueryMethods for DatabasePool {
    async fn query(&self, query: Query) -> Result<QueryResult> {
        let ambient = self.check_ambient_transaction()?;
        let routed = query.clone();
        create_connection(
            self,
            ConnectionType::ImplicitQuery,
            Some(&routed),
            |connection| async move {
                execute_query(&connection.inner, ambient.as_deref(), query).await
            },
        )
        .await
    }
}
