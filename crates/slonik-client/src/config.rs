//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use slonik_driver::SessionSettings;
use slonik_pool::PoolConfig;

use crate::error::{Error, Result};
use crate::instrumentation::SanitizationConfig;
use crate::interceptor::Interceptor;

/// Option-string value that disables a timeout.
pub const DISABLE_TIMEOUT: &str = "DISABLE_TIMEOUT";

/// Configuration of a [`DatabasePool`](crate::DatabasePool).
#[derive(Clone)]
pub struct ClientConfig {
    /// Extra attempts to establish a connection (0 means one attempt).
    pub connection_retry_limit: u32,

    /// Extra attempts for a statement failing with a rollback-class error
    /// outside of a transaction.
    pub query_retry_limit: u32,

    /// Extra attempts for a whole transaction failing with a rollback-class
    /// error.
    pub transaction_retry_limit: u32,

    /// Upper bound on physical connections.
    pub maximum_pool_size: u32,

    /// Connections kept open when connections are lost.
    pub minimum_pool_size: u32,

    /// Bound on a single connection establishment.
    pub connection_timeout: Option<Duration>,

    /// Idle connections above the minimum are closed after this long.
    pub idle_timeout: Option<Duration>,

    /// Server-side `statement_timeout`.
    pub statement_timeout: Option<Duration>,

    /// Server-side `idle_in_transaction_session_timeout`.
    pub idle_in_transaction_session_timeout: Option<Duration>,

    /// How long `end()` waits before forcing connections closed.
    pub graceful_termination_timeout: Option<Duration>,

    /// Statement executed when a connection is returned to the pool.
    pub reset_statement: Option<String>,

    /// `application_name` reported to the server.
    pub application_name: Option<String>,

    /// Allow statements on connections outside the current transaction.
    pub dangerously_allow_foreign_connections: bool,

    /// Interceptors, in execution order.
    pub interceptors: Vec<Arc<dyn Interceptor>>,

    /// How statements are rendered in logs.
    pub sanitization: SanitizationConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_retry_limit: 3,
            query_retry_limit: 5,
            transaction_retry_limit: 5,
            maximum_pool_size: 10,
            minimum_pool_size: 0,
            connection_timeout: Some(Duration::from_secs(5)),
            idle_timeout: Some(Duration::from_secs(5)),
            statement_timeout: Some(Duration::from_secs(60)),
            idle_in_transaction_session_timeout: Some(Duration::from_secs(60)),
            graceful_termination_timeout: Some(Duration::from_secs(5)),
            reset_statement: None,
            application_name: None,
            dangerously_allow_foreign_connections: false,
            interceptors: Vec::new(),
            sanitization: SanitizationConfig::default(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let interceptors: Vec<&str> = self.interceptors.iter().map(|i| i.name()).collect();
        f.debug_struct("ClientConfig")
            .field("connection_retry_limit", &self.connection_retry_limit)
            .field("query_retry_limit", &self.query_retry_limit)
            .field("transaction_retry_limit", &self.transaction_retry_limit)
            .field("maximum_pool_size", &self.maximum_pool_size)
            .field("minimum_pool_size", &self.minimum_pool_size)
            .field("connection_timeout", &self.connection_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("statement_timeout", &self.statement_timeout)
            .field(
                "idle_in_transaction_session_timeout",
                &self.idle_in_transaction_session_timeout,
            )
            .field(
                "graceful_termination_timeout",
                &self.graceful_termination_timeout,
            )
            .field("reset_statement", &self.reset_statement)
            .field("application_name", &self.application_name)
            .field(
                "dangerously_allow_foreign_connections",
                &self.dangerously_allow_foreign_connections,
            )
            .field("interceptors", &interceptors)
            .finish()
    }
}

impl ClientConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `key=value;` option string.
    ///
    /// ```text
    /// maximumPoolSize=20;queryRetryLimit=2;statementTimeout=DISABLE_TIMEOUT
    /// ```
    ///
    /// Keys are case-insensitive; timeouts are in milliseconds. Unknown keys
    /// are ignored.
    pub fn from_options_string(options: &str) -> Result<Self> {
        let mut config = Self::default();

        for part in options.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part.split_once('=').ok_or_else(|| {
                Error::InvalidConfiguration(format!("invalid key-value: {part}"))
            })?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "connectionretrylimit" => config.connection_retry_limit = parse_count(&key, value)?,
                "queryretrylimit" => config.query_retry_limit = parse_count(&key, value)?,
                "transactionretrylimit" => {
                    config.transaction_retry_limit = parse_count(&key, value)?;
                }
                "maximumpoolsize" => config.maximum_pool_size = parse_count(&key, value)?,
                "minimumpoolsize" => config.minimum_pool_size = parse_count(&key, value)?,
                "connectiontimeout" => config.connection_timeout = parse_timeout(&key, value)?,
                "idletimeout" => config.idle_timeout = parse_timeout(&key, value)?,
                "statementtimeout" => config.statement_timeout = parse_timeout(&key, value)?,
                "idleintransactionsessiontimeout" => {
                    config.idle_in_transaction_session_timeout = parse_timeout(&key, value)?;
                }
                "gracefulterminationtimeout" => {
                    config.graceful_termination_timeout = parse_timeout(&key, value)?;
                }
                "resetstatement" => config.reset_statement = Some(value.to_string()),
                "applicationname" | "application_name" => {
                    config.application_name = Some(value.to_string());
                }
                "dangerouslyallowforeignconnections" => {
                    config.dangerously_allow_foreign_connections = parse_flag(&key, value)?;
                }
                _ => {
                    tracing::debug!(key = key, value = value, "ignoring unknown client option");
                }
            }
        }

        Ok(config)
    }

    /// Set the connection retry limit.
    #[must_use]
    pub fn connection_retry_limit(mut self, limit: u32) -> Self {
        self.connection_retry_limit = limit;
        self
    }

    /// Set the query retry limit.
    #[must_use]
    pub fn query_retry_limit(mut self, limit: u32) -> Self {
        self.query_retry_limit = limit;
        self
    }

    /// Set the transaction retry limit.
    #[must_use]
    pub fn transaction_retry_limit(mut self, limit: u32) -> Self {
        self.transaction_retry_limit = limit;
        self
    }

    /// Set the maximum pool size.
    #[must_use]
    pub fn maximum_pool_size(mut self, size: u32) -> Self {
        self.maximum_pool_size = size;
        self
    }

    /// Set the minimum pool size.
    #[must_use]
    pub fn minimum_pool_size(mut self, size: u32) -> Self {
        self.minimum_pool_size = size;
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the statement timeout.
    #[must_use]
    pub fn statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Set the idle-in-transaction session timeout.
    #[must_use]
    pub fn idle_in_transaction_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_in_transaction_session_timeout = timeout;
        self
    }

    /// Set the graceful termination timeout.
    #[must_use]
    pub fn graceful_termination_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.graceful_termination_timeout = timeout;
        self
    }

    /// Set the statement executed when a connection is returned.
    #[must_use]
    pub fn reset_statement(mut self, sql: impl Into<String>) -> Self {
        self.reset_statement = Some(sql.into());
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Allow or forbid statements on connections outside the current
    /// transaction.
    #[must_use]
    pub fn dangerously_allow_foreign_connections(mut self, allow: bool) -> Self {
        self.dangerously_allow_foreign_connections = allow;
        self
    }

    /// Append an interceptor.
    #[must_use]
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Set how statements are rendered in logs.
    #[must_use]
    pub fn sanitization(mut self, sanitization: SanitizationConfig) -> Self {
        self.sanitization = sanitization;
        self
    }

    /// Session settings forwarded to the driver.
    #[must_use]
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            statement_timeout: self.statement_timeout,
            idle_in_transaction_session_timeout: self.idle_in_transaction_session_timeout,
            application_name: self.application_name.clone(),
        }
    }

    /// Pool configuration derived from this configuration.
    #[must_use]
    pub fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::new()
            .min_connections(self.minimum_pool_size)
            .max_connections(self.maximum_pool_size)
            .connection_timeout(self.connection_timeout)
            .idle_timeout(self.idle_timeout)
            .graceful_termination_timeout(self.graceful_termination_timeout)
            .session(self.session_settings());
        config.reset_statement = self.reset_statement.clone();
        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.pool_config()
            .validate()
            .map_err(|e| Error::InvalidConfiguration(e.to_string()))
    }
}

fn parse_count(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| Error::InvalidConfiguration(format!("invalid {key}: {value}")))
}

fn parse_timeout(key: &str, value: &str) -> Result<Option<Duration>> {
    if value.eq_ignore_ascii_case(DISABLE_TIMEOUT) {
        return Ok(None);
    }
    let millis: u64 = value
        .parse()
        .map_err(|_| Error::InvalidConfiguration(format!("invalid {key}: {value}")))?;
    Ok(Some(Duration::from_millis(millis)))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    if value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1" {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") || value.eq_ignore_ascii_case("no") || value == "0"
    {
        Ok(false)
    } else {
        Err(Error::InvalidConfiguration(format!(
            "invalid {key}: {value}"
        )))
    }
}
