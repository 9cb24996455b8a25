//! Connection lifecycle state and per-connection metadata.
//!
//! Every physical connection owned by the pool carries a
//! [`ConnectionMetadata`] record. The pool keeps it inline in its connection
//! slot and shares it with the handle given to callers, so the query engine
//! and the transaction manager can read and update session state
//! (termination, transaction depth, the statement queue) without any side
//! table keyed by connection identity.

use std::time::Instant;

use parking_lot::Mutex;
use slonik_driver::DriverError;
use tokio::sync::oneshot;

/// Physical state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Available for checkout.
    Idle,
    /// Checked out by a caller.
    Acquired,
    /// Being returned (reset statement in flight).
    PendingRelease,
    /// Scheduled for teardown.
    PendingDestroy,
    /// Transport torn down.
    Destroyed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Acquired => "ACQUIRED",
            ConnectionState::PendingRelease => "PENDING_RELEASE",
            ConnectionState::PendingDestroy => "PENDING_DESTROY",
            ConnectionState::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

/// Session-level state reset every time the connection is checked out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    /// Identifier of the current checkout.
    pub connection_id: String,
    /// Set once the backend terminated the session; further statements are refused.
    pub terminated: Option<DriverError>,
    /// Savepoint nesting level; `None` outside of a transaction.
    pub transaction_depth: Option<u32>,
    /// Identifier of the top-level transaction owning the connection.
    pub transaction_id: Option<String>,
}

/// Metadata attached to one physical connection.
#[derive(Debug)]
pub struct ConnectionMetadata {
    id: u64,
    pool_id: String,
    created_at: Instant,
    session: Mutex<SessionState>,
    statements: StatementQueue,
}

impl ConnectionMetadata {
    pub(crate) fn new(id: u64, pool_id: String) -> Self {
        Self {
            id,
            pool_id,
            created_at: Instant::now(),
            session: Mutex::new(SessionState::default()),
            statements: StatementQueue::default(),
        }
    }

    /// Pool-unique identifier of the physical connection.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identifier of the owning pool.
    #[must_use]
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// When the physical connection was established.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Clear session state for a new checkout.
    pub fn reset(&self, connection_id: impl Into<String>) {
        *self.session.lock() = SessionState {
            connection_id: connection_id.into(),
            ..SessionState::default()
        };
    }

    /// Snapshot of the session state.
    #[must_use]
    pub fn session(&self) -> SessionState {
        self.session.lock().clone()
    }

    /// Read or update the session state atomically.
    ///
    /// The closure runs under a short-lived lock and must not block.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        f(&mut self.session.lock())
    }

    /// Identifier of the current checkout.
    #[must_use]
    pub fn connection_id(&self) -> String {
        self.session.lock().connection_id.clone()
    }

    /// The termination error, if the backend terminated the session.
    #[must_use]
    pub fn terminated(&self) -> Option<DriverError> {
        self.session.lock().terminated.clone()
    }

    /// Remember that the backend terminated the session.
    pub fn mark_terminated(&self, error: DriverError) {
        self.session.lock().terminated.get_or_insert(error);
    }

    /// Current transaction depth.
    #[must_use]
    pub fn transaction_depth(&self) -> Option<u32> {
        self.session.lock().transaction_depth
    }

    /// Current transaction identifier.
    #[must_use]
    pub fn transaction_id(&self) -> Option<String> {
        self.session.lock().transaction_id.clone()
    }

    /// The statement queue of this connection.
    #[must_use]
    pub fn statements(&self) -> &StatementQueue {
        &self.statements
    }
}

/// Serializes statements on one physical connection.
///
/// Each statement installs its own completion marker and then awaits the
/// marker of the statement submitted before it, so statements run one at a
/// time in submission order.
#[derive(Debug, Default)]
pub struct StatementQueue {
    tail: Mutex<Option<oneshot::Receiver<()>>>,
}

impl StatementQueue {
    /// Wait for the previously submitted statement to complete.
    ///
    /// The returned [`StatementTurn`] must be held for the duration of the
    /// statement; dropping it lets the next statement proceed.
    pub async fn enter(&self) -> StatementTurn {
        let (done, marker) = oneshot::channel();
        let previous = self.tail.lock().replace(marker);

        let mut pending = PendingTurn {
            previous,
            done: Some(done),
        };
        if let Some(previous) = pending.previous.as_mut() {
            // A dropped sender counts as completion.
            let _ = previous.await;
        }
        pending.previous = None;

        StatementTurn {
            _done: pending.done.take(),
        }
    }
}

/// Proof that it is this statement's turn on the connection.
#[derive(Debug)]
pub struct StatementTurn {
    _done: Option<oneshot::Sender<()>>,
}

/// A turn whose predecessor has not completed yet.
///
/// If the waiting future is cancelled, the chain is kept intact by handing the
/// predecessor's completion on to the successor in the background.
struct PendingTurn {
    previous: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for PendingTurn {
    fn drop(&mut self) {
        if let (Some(previous), Some(done)) = (self.previous.take(), self.done.take()) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = previous.await;
                    drop(done);
                });
            }
        }
    }
}
