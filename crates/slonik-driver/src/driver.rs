//! The driver and client-session traits.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use tokio::sync::broadcast;

use crate::error::{DriverError, ErrorClass};
use crate::result::{Notice, QueryResult};
use crate::row::Row;
use crate::value::Value;

/// A stream of rows produced by [`DriverClient::stream`].
pub type RowStream = Pin<Box<dyn Stream<Item = Result<Row, DriverError>> + Send + 'static>>;

/// Session settings applied by the driver when it opens a client session.
///
/// Statement and idle-in-transaction timeouts are enforced by the server;
/// the pool only forwards them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSettings {
    /// `statement_timeout` for every statement of the session.
    pub statement_timeout: Option<Duration>,
    /// `idle_in_transaction_session_timeout` for the session.
    pub idle_in_transaction_session_timeout: Option<Duration>,
    /// `application_name` reported to the server.
    pub application_name: Option<String>,
}

/// Out-of-band events published by a client session.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// The server raised a notice.
    Notice(Notice),
    /// The session failed outside of any statement (e.g. the backend was terminated).
    Error(DriverError),
}

/// Factory for client sessions.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Open a new client session.
    async fn create_client(
        &self,
        settings: &SessionSettings,
    ) -> Result<Arc<dyn DriverClient>, DriverError>;

    /// Classify a driver error.
    ///
    /// The default uses PostgreSQL SQLSTATE codes; drivers for other databases
    /// override this so that retry and constraint mapping stay correct.
    fn classify(&self, error: &DriverError) -> ErrorClass {
        error.sqlstate_class()
    }
}

/// One physical client session.
///
/// Callers never issue two statements on the same session concurrently; the
/// query engine serializes them.
#[async_trait]
pub trait DriverClient: Send + Sync + 'static {
    /// Execute a statement and buffer its result.
    async fn query(&self, sql: &str, values: &[Value]) -> Result<QueryResult, DriverError>;

    /// Execute a statement and stream its rows.
    async fn stream(&self, sql: &str, values: &[Value]) -> Result<RowStream, DriverError>;

    /// Tear down the transport.
    async fn destroy(&self) -> Result<(), DriverError>;

    /// Subscribe to events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;
}
