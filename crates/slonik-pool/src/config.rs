//! Pool configuration.

use std::time::Duration;

use slonik_driver::SessionSettings;

use crate::error::PoolError;

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections kept open when connections are lost (replenishment target).
    pub min_connections: u32,

    /// Upper bound on physical connections, pending establishments included.
    pub max_connections: u32,

    /// Bound on a single connection establishment.
    pub connection_timeout: Option<Duration>,

    /// Idle connections above `min_connections` are closed after this long.
    pub idle_timeout: Option<Duration>,

    /// How long `end()` waits for queued callers and checked-out connections
    /// before forcing connections closed.
    pub graceful_termination_timeout: Option<Duration>,

    /// Statement executed on every release (e.g. `DISCARD ALL`).
    pub reset_statement: Option<String>,

    /// Session settings forwarded to the driver.
    pub session: SessionSettings,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            connection_timeout: Some(Duration::from_secs(5)),
            idle_timeout: Some(Duration::from_secs(5)),
            graceful_termination_timeout: Some(Duration::from_secs(5)),
            reset_statement: None,
            session: SessionSettings::default(),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the connection establishment timeout (`None` waits forever).
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the idle connection timeout (`None` keeps idle connections open).
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the graceful termination timeout (`None` waits forever).
    #[must_use]
    pub fn graceful_termination_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.graceful_termination_timeout = timeout;
        self
    }

    /// Set the statement executed when a connection is released.
    #[must_use]
    pub fn reset_statement(mut self, sql: impl Into<String>) -> Self {
        self.reset_statement = Some(sql.into());
        self
    }

    /// Set the session settings forwarded to the driver.
    #[must_use]
    pub fn session(mut self, session: SessionSettings) -> Self {
        self.session = session;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::Config(format!(
                "min_connections ({}) cannot exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self
            .reset_statement
            .as_deref()
            .is_some_and(|sql| sql.trim().is_empty())
        {
            return Err(PoolError::Config("reset_statement cannot be empty".into()));
        }
        Ok(())
    }
}
