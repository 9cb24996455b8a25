//! In-memory driver for unit and integration tests.
//!
//! [`MockDriver`] answers every statement through a responder closure, records
//! every statement it receives, and can be told to fail, stall or emit events
//! so that pool and query-engine behaviour can be tested without a server.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use slonik_driver::{
    ClientEvent, Driver, DriverClient, DriverError, ErrorClass, Field, Notice, QueryResult, Row,
    RowStream, SessionSettings, Value,
};
use tokio::sync::{broadcast, watch};

/// Computes the result of a statement.
pub type Responder =
    Arc<dyn Fn(&str, &[Value]) -> Result<QueryResult, DriverError> + Send + Sync>;

/// Overrides error classification; `None` falls back to SQLSTATE rules.
pub type Classifier = Arc<dyn Fn(&DriverError) -> Option<ErrorClass> + Send + Sync>;

/// A statement received by a mock client.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedStatement {
    /// Client that received the statement.
    pub client_id: u64,
    /// Statement text.
    pub sql: String,
    /// Bound values.
    pub values: Vec<Value>,
}

struct Shared {
    responder: RwLock<Responder>,
    classifier: RwLock<Option<Classifier>>,
    log: Mutex<Vec<LoggedStatement>>,
    connect_failures: Mutex<VecDeque<DriverError>>,
    notices: Mutex<Vec<(String, Notice)>>,
    query_delay: Mutex<Option<Duration>>,
    connect_delay: Mutex<Option<Duration>>,
    gate: watch::Sender<bool>,
    next_client_id: AtomicU64,
    destroyed: AtomicU64,
    settings: Mutex<Vec<SessionSettings>>,
}

/// In-memory [`Driver`].
///
/// Cloning shares the same state, so a test can keep a clone for inspection
/// after handing the driver to a pool.
#[derive(Clone)]
pub struct MockDriver {
    shared: Arc<Shared>,
    clients: Arc<Mutex<Vec<Arc<MockClient>>>>,
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDriver {
    /// Create a driver that answers every statement with an empty command result.
    #[must_use]
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                responder: RwLock::new(Arc::new(|sql, _| Ok(command_result(sql)))),
                classifier: RwLock::new(None),
                log: Mutex::new(Vec::new()),
                connect_failures: Mutex::new(VecDeque::new()),
                notices: Mutex::new(Vec::new()),
                query_delay: Mutex::new(None),
                connect_delay: Mutex::new(None),
                gate,
                next_client_id: AtomicU64::new(1),
                destroyed: AtomicU64::new(0),
                settings: Mutex::new(Vec::new()),
            }),
            clients: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a driver with a responder.
    #[must_use]
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Result<QueryResult, DriverError> + Send + Sync + 'static,
    {
        let driver = Self::new();
        driver.set_responder(responder);
        driver
    }

    /// Replace the responder.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: Fn(&str, &[Value]) -> Result<QueryResult, DriverError> + Send + Sync + 'static,
    {
        *self.shared.responder.write() = Arc::new(responder);
    }

    /// Override error classification.
    pub fn set_classifier<F>(&self, classifier: F)
    where
        F: Fn(&DriverError) -> Option<ErrorClass> + Send + Sync + 'static,
    {
        *self.shared.classifier.write() = Some(Arc::new(classifier));
    }

    /// Make the next connection attempt fail with `error`.
    ///
    /// Calls queue up: each one fails exactly one attempt.
    pub fn fail_next_connect(&self, error: DriverError) {
        self.shared.connect_failures.lock().push_back(error);
    }

    /// Stall connection establishment until [`resume_connections`](Self::resume_connections).
    pub fn pause_connections(&self) {
        self.shared.gate.send_replace(false);
    }

    /// Let stalled and future connection attempts proceed.
    pub fn resume_connections(&self) {
        self.shared.gate.send_replace(true);
    }

    /// Delay every connection attempt.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.shared.connect_delay.lock() = delay;
    }

    /// Delay every statement.
    pub fn set_query_delay(&self, delay: Option<Duration>) {
        *self.shared.query_delay.lock() = delay;
    }

    /// Emit `message` as a notice whenever a statement containing `pattern` runs.
    pub fn notice_on(&self, pattern: impl Into<String>, message: impl Into<String>) {
        self.shared
            .notices
            .lock()
            .push((pattern.into(), Notice::new(message)));
    }

    /// Every statement received so far, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<LoggedStatement> {
        self.shared.log.lock().clone()
    }

    /// Statement texts received so far, in order.
    #[must_use]
    pub fn sql_log(&self) -> Vec<String> {
        self.shared.log.lock().iter().map(|s| s.sql.clone()).collect()
    }

    /// Statement texts received by one client, in order.
    #[must_use]
    pub fn sql_log_for(&self, client_id: u64) -> Vec<String> {
        self.shared
            .log
            .lock()
            .iter()
            .filter(|s| s.client_id == client_id)
            .map(|s| s.sql.clone())
            .collect()
    }

    /// Forget recorded statements.
    pub fn clear_log(&self) {
        self.shared.log.lock().clear();
    }

    /// Number of client sessions created.
    #[must_use]
    pub fn clients_created(&self) -> usize {
        self.clients.lock().len()
    }

    /// Number of client sessions destroyed.
    #[must_use]
    pub fn clients_destroyed(&self) -> u64 {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// All client sessions created so far.
    #[must_use]
    pub fn clients(&self) -> Vec<Arc<MockClient>> {
        self.clients.lock().clone()
    }

    /// The most recently created client session.
    #[must_use]
    pub fn last_client(&self) -> Option<Arc<MockClient>> {
        self.clients.lock().last().cloned()
    }

    /// Session settings passed to each `create_client` call.
    #[must_use]
    pub fn session_settings(&self) -> Vec<SessionSettings> {
        self.shared.settings.lock().clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn create_client(
        &self,
        settings: &SessionSettings,
    ) -> Result<Arc<dyn DriverClient>, DriverError> {
        let mut gate = self.shared.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let delay = *self.shared.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.shared.connect_failures.lock().pop_front();
        if let Some(error) = failure {
            tracing::debug!(%error, "mock connection attempt failed");
            return Err(error);
        }

        self.shared.settings.lock().push(settings.clone());
        let id = self.shared.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (events, _) = broadcast::channel(64);
        let client = Arc::new(MockClient {
            id,
            shared: Arc::clone(&self.shared),
            events,
            destroyed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        self.clients.lock().push(Arc::clone(&client));
        tracing::trace!(client = id, "mock client created");

        Ok(client)
    }

    fn classify(&self, error: &DriverError) -> ErrorClass {
        let classifier = self.shared.classifier.read().clone();
        classifier
            .and_then(|classify| classify(error))
            .unwrap_or_else(|| error.sqlstate_class())
    }
}

/// In-memory [`DriverClient`] created by [`MockDriver`].
pub struct MockClient {
    id: u64,
    shared: Arc<Shared>,
    events: broadcast::Sender<ClientEvent>,
    destroyed: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockClient {
    /// Identifier of this client session (1-based, in creation order).
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check whether `destroy()` was called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Publish an out-of-band error, as when the backend is terminated.
    pub fn emit_error(&self, error: DriverError) {
        let _ = self.events.send(ClientEvent::Error(error));
    }

    /// Publish a notice.
    pub fn emit_notice(&self, notice: Notice) {
        let _ = self.events.send(ClientEvent::Notice(notice));
    }

    /// Highest number of statements observed running at the same time.
    #[must_use]
    pub fn max_concurrent_statements(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn respond(&self, sql: &str, values: &[Value]) -> Result<QueryResult, DriverError> {
        if self.is_destroyed() {
            return Err(DriverError::connection_lost("Connection terminated"));
        }

        self.shared.log.lock().push(LoggedStatement {
            client_id: self.id,
            sql: sql.to_string(),
            values: values.to_vec(),
        });

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = *self.shared.query_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let notices: Vec<Notice> = self
            .shared
            .notices
            .lock()
            .iter()
            .filter(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, notice)| notice.clone())
            .collect();
        for notice in notices {
            self.emit_notice(notice);
        }

        let responder = Arc::clone(&*self.shared.responder.read());
        let result = responder(sql, values);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl std::fmt::Debug for MockClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClient")
            .field("id", &self.id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[async_trait]
impl DriverClient for MockClient {
    async fn query(&self, sql: &str, values: &[Value]) -> Result<QueryResult, DriverError> {
        self.respond(sql, values).await
    }

    async fn stream(&self, sql: &str, values: &[Value]) -> Result<RowStream, DriverError> {
        let result = self.respond(sql, values).await?;
        let rows = result.rows.into_iter().map(Ok::<Row, DriverError>);
        Ok(Box::pin(futures_util::stream::iter(rows)))
    }

    async fn destroy(&self) -> Result<(), DriverError> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.shared.destroyed.fetch_add(1, Ordering::SeqCst);
            tracing::trace!(client = self.id, "mock client destroyed");
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// An empty result tagged with the statement's leading keyword.
#[must_use]
pub fn command_result(sql: &str) -> QueryResult {
    let command = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    QueryResult::command(command, 0)
}

/// A `SELECT` result with the given column names and rows.
#[must_use]
pub fn result_set(columns: &[&str], rows: Vec<Vec<Value>>) -> QueryResult {
    let fields: Vec<Field> = columns.iter().map(|name| Field::new(*name, 0)).collect();
    let shared: Arc<[Field]> = fields.clone().into();
    let rows = rows
        .into_iter()
        .map(|values| Row::new(Arc::clone(&shared), values))
        .collect();
    QueryResult::from_rows("SELECT", fields, rows)
}
