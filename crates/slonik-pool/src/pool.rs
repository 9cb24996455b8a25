//! Connection pool implementation.
//!
//! The pool owns every physical connection in an arena of slots keyed by
//! connection id. Callers receive [`PooledConnection`] handles; the slot (its
//! state and metadata) stays with the pool.
//!
//! All bookkeeping lives behind one mutex that is never held across an
//! `.await`, so each check-then-mutate step (for example "is there room for
//! another connection? then reserve it") is atomic with respect to other
//! callers.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use slonik_driver::{Driver, DriverClient};
use tokio::sync::{Notify, oneshot};

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::lifecycle::{ConnectionMetadata, ConnectionState};

/// Lifecycle of the pool itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolLifecycle {
    /// Accepting checkouts.
    Active,
    /// `end()` in progress; checkouts are rejected.
    Ending,
    /// All connections closed.
    Ended,
}

impl std::fmt::Display for PoolLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PoolLifecycle::Active => "ACTIVE",
            PoolLifecycle::Ending => "ENDING",
            PoolLifecycle::Ended => "ENDED",
        };
        f.write_str(name)
    }
}

/// A bounded pool of database connections.
///
/// Cloning is cheap; clones share the same pool.
///
/// # Example
///
/// ```rust,ignore
/// use slonik_pool::{Pool, PoolConfig};
///
/// let pool = Pool::builder(driver)
///     .max_connections(20)
///     .reset_statement("DISCARD ALL")
///     .build()?;
///
/// let conn = pool.acquire().await?;
/// conn.client().query("SELECT 1", &[]).await?;
/// conn.release().await;
///
/// pool.end().await;
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Unique pool identifier.
    id: String,

    /// Pool configuration.
    config: PoolConfig,

    /// Creates client sessions.
    driver: Arc<dyn Driver>,

    /// Connection slots, waiters and lifecycle.
    state: Mutex<PoolState>,

    /// Fired after every bookkeeping change.
    changed: Notify,

    /// Counter for generating connection IDs.
    next_connection_id: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// Pool metrics.
    metrics: Mutex<PoolMetricsInner>,
}

type Waiter = oneshot::Sender<Result<PooledConnection>>;

struct PoolState {
    lifecycle: PoolLifecycle,
    /// Set once `end()` starts closing connections; released connections are destroyed.
    closing: bool,
    slots: HashMap<u64, Slot>,
    /// Establishments in flight.
    pending: u32,
    waiting: VecDeque<Waiter>,
}

struct Slot {
    client: Arc<dyn DriverClient>,
    metadata: Arc<ConnectionMetadata>,
    state: ConnectionState,
    tearing_down: bool,
    idle_generation: u64,
}

/// What happened to a connection that became available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Availability {
    HandedOff,
    Idle,
    Destroy,
    Gone,
}

impl PoolState {
    fn total(&self) -> u32 {
        self.slots.len() as u32 + self.pending
    }

    fn check_accepting(&self) -> Result<()> {
        match self.lifecycle {
            PoolLifecycle::Active => Ok(()),
            PoolLifecycle::Ending => Err(PoolError::PoolTerminating),
            PoolLifecycle::Ended => Err(PoolError::PoolEnded),
        }
    }

    /// Drop waiters whose caller stopped listening.
    fn prune_waiters(&mut self) {
        self.waiting.retain(|waiter| !waiter.is_closed());
    }

    fn live_waiters(&self) -> usize {
        self.waiting.iter().filter(|waiter| !waiter.is_closed()).count()
    }

    /// Pop the first waiter whose caller is still listening.
    fn pop_waiter(&mut self) -> Option<Waiter> {
        while let Some(waiter) = self.waiting.pop_front() {
            if !waiter.is_closed() {
                return Some(waiter);
            }
        }
        None
    }

    fn count(&self, state: ConnectionState) -> u32 {
        self.slots.values().filter(|s| s.state == state).count() as u32
    }
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    connections_created: u64,
    connections_closed: u64,
    checkouts_successful: u64,
    checkouts_failed: u64,
    checkouts_waited: u64,
    resets_performed: u64,
    resets_failed: u64,
}

impl Pool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder(driver: Arc<dyn Driver>) -> PoolBuilder {
        PoolBuilder::new(driver)
    }

    /// Create a new pool. Connections are opened lazily.
    pub fn new(driver: Arc<dyn Driver>, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let id = uuid::Uuid::new_v4().to_string();

        tracing::info!(
            pool_id = %id,
            min = config.min_connections,
            max = config.max_connections,
            "connection pool created"
        );

        let inner = Arc::new(PoolInner {
            id,
            config,
            driver,
            state: Mutex::new(PoolState {
                lifecycle: PoolLifecycle::Active,
                closing: false,
                slots: HashMap::new(),
                pending: 0,
                waiting: VecDeque::new(),
            }),
            changed: Notify::new(),
            next_connection_id: AtomicU64::new(1),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner::default()),
        });

        Ok(Self { inner })
    }

    /// Unique identifier of this pool.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Get a connection from the pool.
    ///
    /// Returns an idle connection if there is one, otherwise opens a new one
    /// if the pool is below `max_connections`, otherwise waits (FIFO) until a
    /// connection is handed over.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.inner.acquire().await
    }

    /// End the pool.
    ///
    /// Rejects new checkouts immediately, waits for in-flight establishments
    /// and queued callers, then closes every connection (checked-out ones as
    /// they are released). Calling it again, concurrently or later, waits for
    /// the same shutdown.
    pub async fn end(&self) {
        self.inner.end().await;
    }

    /// Point-in-time pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let mut state = self.inner.state.lock();
        state.prune_waiters();
        PoolStatus {
            idle: state.count(ConnectionState::Idle),
            acquired: state.count(ConnectionState::Acquired),
            pending: state.pending,
            pending_release: state.count(ConnectionState::PendingRelease),
            pending_destroy: state.count(ConnectionState::PendingDestroy),
            waiting_clients: state.waiting.len() as u32,
            max: self.inner.config.max_connections,
            state: state.lifecycle,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> PoolLifecycle {
        self.inner.state.lock().lifecycle
    }

    /// Check whether `end()` has started but not finished.
    #[must_use]
    pub fn is_ending(&self) -> bool {
        self.lifecycle() == PoolLifecycle::Ending
    }

    /// Check whether the pool has ended.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.lifecycle() == PoolLifecycle::Ended
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            checkouts_waited: inner.checkouts_waited,
            resets_performed: inner.resets_performed,
            resets_failed: inner.resets_failed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl PoolInner {
    fn handle(self: &Arc<Self>, slot_id: u64, slot: &Slot) -> PooledConnection {
        PooledConnection {
            slot_id,
            client: Arc::clone(&slot.client),
            metadata: Arc::clone(&slot.metadata),
            pool: Some(Arc::clone(self)),
        }
    }

    async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        enum Plan {
            Ready(PooledConnection),
            Create,
            Wait(oneshot::Receiver<Result<PooledConnection>>),
        }

        let plan = {
            let mut state = self.state.lock();
            match state.check_accepting() {
                Err(error) => Err(error),
                Ok(()) => {
                    let idle = state
                        .slots
                        .iter_mut()
                        .find(|(_, slot)| slot.state == ConnectionState::Idle);

                    if let Some((&slot_id, slot)) = idle {
                        slot.state = ConnectionState::Acquired;
                        Ok(Plan::Ready(self.handle(slot_id, slot)))
                    } else if state.total() < self.config.max_connections {
                        state.pending += 1;
                        Ok(Plan::Create)
                    } else {
                        let (tx, rx) = oneshot::channel();
                        state.waiting.push_back(tx);
                        Ok(Plan::Wait(rx))
                    }
                }
            }
        };

        let result = match plan {
            Err(error) => Err(error),
            Ok(Plan::Ready(conn)) => {
                tracing::trace!(connection = conn.id(), "reusing idle connection");
                Ok(conn)
            }
            Ok(Plan::Create) => {
                // The establishment outlives this future; if the caller gives
                // up, the new connection is released into the pool.
                let (tx, rx) = oneshot::channel();
                self.spawn_establish(Some(tx));
                rx.await.unwrap_or(Err(PoolError::PoolEnded))
            }
            Ok(Plan::Wait(rx)) => {
                self.metrics.lock().checkouts_waited += 1;
                tracing::debug!(pool_id = %self.id, "pool saturated; waiting for a connection");
                rx.await.unwrap_or(Err(PoolError::PoolEnded))
            }
        };

        {
            let mut metrics = self.metrics.lock();
            if result.is_ok() {
                metrics.checkouts_successful += 1;
            } else {
                metrics.checkouts_failed += 1;
            }
        }
        self.changed.notify_waiters();

        result
    }

    async fn connect_client(&self) -> Result<Arc<dyn DriverClient>> {
        let connect = self.driver.create_client(&self.config.session);
        match self.config.connection_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| PoolError::ConnectionTimeout(limit))?
                .map_err(PoolError::from),
            None => connect.await.map_err(PoolError::from),
        }
    }

    /// Complete an establishment reserved by `pending += 1`.
    ///
    /// The reservation is released whether or not the driver succeeds.
    async fn establish(self: &Arc<Self>) -> Result<PooledConnection> {
        let connected = self.connect_client().await;

        let (result, orphan) = {
            let mut state = self.state.lock();
            state.pending -= 1;
            match connected {
                Ok(client) if state.lifecycle == PoolLifecycle::Ended => {
                    (Err(PoolError::PoolEnded), Some(client))
                }
                Ok(client) => {
                    let slot_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
                    let slot = Slot {
                        client,
                        metadata: Arc::new(ConnectionMetadata::new(slot_id, self.id.clone())),
                        state: ConnectionState::Acquired,
                        tearing_down: false,
                        idle_generation: 0,
                    };
                    let conn = self.handle(slot_id, &slot);
                    state.slots.insert(slot_id, slot);
                    self.metrics.lock().connections_created += 1;
                    tracing::debug!(
                        pool_id = %self.id,
                        connection = slot_id,
                        total = state.total(),
                        "created new connection"
                    );
                    (Ok(conn), None)
                }
                Err(error) => {
                    tracing::debug!(pool_id = %self.id, %error, "connection establishment failed");
                    (Err(error), None)
                }
            }
        };
        self.changed.notify_waiters();

        if let Some(client) = orphan {
            let _ = client.destroy().await;
        }

        result
    }

    /// Establish a connection in the background, for a caller or to
    /// replenish the pool. The caller must already have reserved it.
    fn spawn_establish(self: &Arc<Self>, waiter: Option<Waiter>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            match (pool.establish().await, waiter) {
                (Ok(conn), Some(waiter)) => {
                    if let Err(Ok(conn)) = waiter.send(Ok(conn)) {
                        conn.release().await;
                    }
                }
                (Ok(conn), None) => {
                    let slot_id = conn.disarm();
                    pool.settle(slot_id).await;
                }
                (Err(error), Some(waiter)) => {
                    let _ = waiter.send(Err(error));
                }
                (Err(error), None) => {
                    tracing::warn!(pool_id = %pool.id, %error, "could not replenish connection pool");
                }
            }
        });
    }

    async fn release(self: &Arc<Self>, slot_id: u64) {
        let client = {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(&slot_id) else {
                tracing::debug!(connection = slot_id, "released connection is no longer tracked");
                return;
            };
            if slot.state == ConnectionState::PendingDestroy {
                None
            } else {
                slot.state = ConnectionState::PendingRelease;
                Some(Arc::clone(&slot.client))
            }
        };
        self.changed.notify_waiters();

        let Some(client) = client else {
            self.destroy_slot(slot_id).await;
            return;
        };

        if let Some(sql) = &self.config.reset_statement {
            if let Err(error) = client.query(sql, &[]).await {
                tracing::warn!(connection = slot_id, %error, "connection reset failed; destroying connection");
                self.metrics.lock().resets_failed += 1;
                self.destroy_slot(slot_id).await;
                return;
            }
            self.metrics.lock().resets_performed += 1;
        }

        self.settle(slot_id).await;
    }

    /// Hand a connection to the next waiter, or park it as idle.
    async fn settle(self: &Arc<Self>, slot_id: u64) {
        let outcome = {
            let mut state = self.state.lock();
            self.make_available(&mut state, slot_id)
        };
        self.changed.notify_waiters();

        match outcome {
            Availability::Destroy => self.destroy_slot(slot_id).await,
            Availability::HandedOff => {
                tracing::trace!(connection = slot_id, "handed connection to waiting client");
            }
            Availability::Idle | Availability::Gone => {}
        }
    }

    fn make_available(self: &Arc<Self>, state: &mut PoolState, slot_id: u64) -> Availability {
        let closing = state.closing;
        match state.slots.get(&slot_id).map(|slot| slot.state) {
            None => return Availability::Gone,
            Some(ConnectionState::PendingDestroy) => return Availability::Destroy,
            Some(_) if closing => return Availability::Destroy,
            Some(_) => {}
        }

        while let Some(waiter) = state.pop_waiter() {
            let Some(slot) = state.slots.get_mut(&slot_id) else {
                return Availability::Gone;
            };
            slot.state = ConnectionState::Acquired;
            match waiter.send(Ok(self.handle(slot_id, slot))) {
                Ok(()) => return Availability::HandedOff,
                Err(returned) => {
                    // The caller stopped waiting between the check and the send.
                    if let Ok(conn) = returned {
                        conn.disarm();
                    }
                }
            }
        }

        let Some(slot) = state.slots.get_mut(&slot_id) else {
            return Availability::Gone;
        };
        slot.state = ConnectionState::Idle;
        slot.idle_generation += 1;
        self.schedule_idle_timeout(slot_id, slot.idle_generation);
        Availability::Idle
    }

    fn schedule_idle_timeout(self: &Arc<Self>, slot_id: u64, generation: u64) {
        let Some(timeout) = self.config.idle_timeout else {
            return;
        };
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(pool) = pool.upgrade() else {
                return;
            };
            let expired = {
                let mut state = pool.state.lock();
                let above_min = state.slots.len() > pool.config.min_connections as usize;
                match state.slots.get_mut(&slot_id) {
                    Some(slot)
                        if above_min
                            && slot.state == ConnectionState::Idle
                            && slot.idle_generation == generation =>
                    {
                        slot.state = ConnectionState::PendingDestroy;
                        true
                    }
                    _ => false,
                }
            };
            if expired {
                tracing::debug!(connection = slot_id, "closing idle connection");
                pool.destroy_slot(slot_id).await;
            }
        });
    }

    async fn destroy_slot(self: &Arc<Self>, slot_id: u64) {
        let client = {
            let mut state = self.state.lock();
            let Some(slot) = state.slots.get_mut(&slot_id) else {
                return;
            };
            if slot.tearing_down {
                return;
            }
            slot.tearing_down = true;
            slot.state = ConnectionState::PendingDestroy;
            Arc::clone(&slot.client)
        };
        self.changed.notify_waiters();

        if let Err(error) = client.destroy().await {
            tracing::debug!(connection = slot_id, %error, "error while closing connection");
        }

        {
            let mut state = self.state.lock();
            if let Some(mut slot) = state.slots.remove(&slot_id) {
                slot.state = ConnectionState::Destroyed;
            }
            self.metrics.lock().connections_closed += 1;
            tracing::debug!(pool_id = %self.id, connection = slot_id, "connection destroyed");

            if state.total() < self.config.max_connections {
                if let Some(waiter) = state.pop_waiter() {
                    state.pending += 1;
                    self.spawn_establish(Some(waiter));
                } else if state.lifecycle == PoolLifecycle::Active
                    && state.total() < self.config.min_connections
                {
                    state.pending += 1;
                    self.spawn_establish(None);
                }
            }
        }
        self.changed.notify_waiters();
    }

    async fn end(self: &Arc<Self>) {
        let initiated = {
            let mut state = self.state.lock();
            if state.lifecycle == PoolLifecycle::Active {
                state.lifecycle = PoolLifecycle::Ending;
                true
            } else {
                false
            }
        };
        self.changed.notify_waiters();

        if !initiated {
            self.wait_until(|s| s.lifecycle == PoolLifecycle::Ended).await;
            return;
        }

        tracing::info!(pool_id = %self.id, "ending connection pool");
        let deadline = self
            .config
            .graceful_termination_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        // In-flight establishments and queued callers settle first.
        let drained = self
            .wait_until_deadline(deadline, |s| s.pending == 0 && s.live_waiters() == 0)
            .await;
        if !drained {
            let rejected: Vec<Waiter> = {
                let mut state = self.state.lock();
                state.prune_waiters();
                state.waiting.drain(..).collect()
            };
            tracing::warn!(
                pool_id = %self.id,
                waiting = rejected.len(),
                "graceful termination timed out; rejecting waiting clients"
            );
            for waiter in rejected {
                let _ = waiter.send(Err(PoolError::PoolEnded));
            }
        }

        // Idle connections close now, checked-out ones when they come back.
        let idle: Vec<u64> = {
            let mut state = self.state.lock();
            state.closing = true;
            let mut idle = Vec::new();
            for (&slot_id, slot) in state.slots.iter_mut() {
                if slot.state == ConnectionState::Idle {
                    idle.push(slot_id);
                }
                if !slot.tearing_down {
                    slot.state = ConnectionState::PendingDestroy;
                }
            }
            idle
        };
        self.changed.notify_waiters();
        for slot_id in idle {
            self.destroy_slot(slot_id).await;
        }

        let closed = self
            .wait_until_deadline(deadline, |s| s.slots.is_empty() && s.pending == 0)
            .await;
        if !closed {
            let remaining: Vec<u64> = self.state.lock().slots.keys().copied().collect();
            tracing::warn!(
                pool_id = %self.id,
                connections = remaining.len(),
                "graceful termination timed out; forcing connections closed"
            );
            for slot_id in remaining {
                self.destroy_slot(slot_id).await;
            }
        }

        self.state.lock().lifecycle = PoolLifecycle::Ended;
        self.changed.notify_waiters();
        tracing::info!(pool_id = %self.id, "connection pool ended");
    }

    async fn wait_until(&self, done: impl Fn(&PoolState) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let finished = done(&self.state.lock());
            if finished {
                return;
            }
            notified.await;
        }
    }

    async fn wait_until_deadline(
        &self,
        deadline: Option<tokio::time::Instant>,
        done: impl Fn(&PoolState) -> bool,
    ) -> bool {
        match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.wait_until(done))
                .await
                .is_ok(),
            None => {
                self.wait_until(done).await;
                true
            }
        }
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder(driver)
///     .min_connections(2)
///     .max_connections(10)
///     .build()?;
/// ```
pub struct PoolBuilder {
    driver: Arc<dyn Driver>,
    pool_config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            pool_config: PoolConfig::default(),
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.pool_config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the connection establishment timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.pool_config.connection_timeout = Some(timeout);
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.pool_config.idle_timeout = Some(timeout);
        self
    }

    /// Set the statement executed on every release.
    #[must_use]
    pub fn reset_statement(mut self, sql: impl Into<String>) -> Self {
        self.pool_config.reset_statement = Some(sql.into());
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<Pool> {
        Pool::new(self.driver, self.pool_config)
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections ready for checkout.
    pub idle: u32,
    /// Connections checked out.
    pub acquired: u32,
    /// Establishments in flight.
    pub pending: u32,
    /// Connections being returned.
    pub pending_release: u32,
    /// Connections being closed.
    pub pending_destroy: u32,
    /// Callers queued for a connection.
    pub waiting_clients: u32,
    /// Maximum allowed connections.
    pub max: u32,
    /// Lifecycle state.
    pub state: PoolLifecycle,
}

impl PoolStatus {
    /// Physical connections plus establishments in flight.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.idle + self.acquired + self.pending + self.pending_release + self.pending_destroy
    }

    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.acquired as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total() >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (pool ending, driver errors, timeouts).
    pub checkouts_failed: u64,
    /// Checkouts that had to queue.
    pub checkouts_waited: u64,
    /// Reset statements executed on release.
    pub resets_performed: u64,
    /// Reset statements that failed.
    pub resets_failed: u64,
    /// Time since pool creation.
    pub uptime: std::time::Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate reset success rate (0.0 to 1.0).
    #[must_use]
    pub fn reset_success_rate(&self) -> f64 {
        let total = self.resets_performed + self.resets_failed;
        if total == 0 {
            return 1.0;
        }
        self.resets_performed as f64 / total as f64
    }
}

/// A connection checked out from the pool.
///
/// Return it with [`release()`](PooledConnection::release) or close it with
/// [`destroy()`](PooledConnection::destroy). A handle dropped without either
/// is released in the background.
pub struct PooledConnection {
    slot_id: u64,
    client: Arc<dyn DriverClient>,
    metadata: Arc<ConnectionMetadata>,
    /// `None` once the handle has been given back.
    pool: Option<Arc<PoolInner>>,
}

impl PooledConnection {
    /// Pool-unique identifier of the physical connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot_id
    }

    /// The driver client session.
    #[must_use]
    pub fn client(&self) -> &Arc<dyn DriverClient> {
        &self.client
    }

    /// Metadata attached to the physical connection.
    #[must_use]
    pub fn metadata(&self) -> &Arc<ConnectionMetadata> {
        &self.metadata
    }

    /// Identifier of the owning pool.
    #[must_use]
    pub fn pool_id(&self) -> &str {
        self.metadata.pool_id()
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) {
        if let Some(pool) = self.pool.take() {
            tracing::trace!(connection = self.slot_id, "releasing connection");
            pool.release(self.slot_id).await;
        }
    }

    /// Close the connection and remove it from the pool.
    pub async fn destroy(mut self) {
        if let Some(pool) = self.pool.take() {
            tracing::debug!(connection = self.slot_id, "destroying connection");
            pool.destroy_slot(self.slot_id).await;
        }
    }

    /// Forget the handle without returning it; the slot stays as it is.
    fn disarm(mut self) -> u64 {
        self.pool = None;
        self.slot_id
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.slot_id)
            .field("pool_id", &self.metadata.pool_id())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(pool) = self.pool.take() else {
            return;
        };
        let slot_id = self.slot_id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::trace!(connection = slot_id, "connection dropped; releasing in background");
                runtime.spawn(async move {
                    pool.release(slot_id).await;
                });
            }
            Err(_) => {
                tracing::warn!(connection = slot_id, "connection dropped outside of a runtime; it cannot be returned");
            }
        }
    }
}
