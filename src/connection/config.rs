//! Structured connection configuration. Everything the source carried in
//! runtime-merged property bags is a validated struct here, constructed once
//! and passed by value.

use serde::{Deserialize, Serialize};

use crate::driver::Dsn;
use crate::error::SqlConduitError;
use crate::retry::RetryPolicy;

/// One physical server: DSN plus credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub dsn: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ServerConfig {
    pub fn new(
        dsn: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            dsn: dsn.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Configuration for one logical pool: the primary server, optional
/// dedicated masters, and optional read-only slaves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Logical pool name; role-qualified siblings derive `"<pool>.master"` /
    /// `"<pool>.slave"` from it.
    pub pool: String,
    /// Primary server; acts as the master when `masters` is empty.
    pub server: ServerConfig,
    /// Dedicated master servers, if writes go somewhere other than `server`.
    #[serde(default)]
    pub masters: Vec<ServerConfig>,
    /// Read-only replicas.
    #[serde(default)]
    pub slaves: Vec<ServerConfig>,
    /// Master-only routing when false, regardless of `slaves`.
    #[serde(default = "default_true")]
    pub enable_slaves: bool,
    /// Expansion for `%` in `{{%table}}` markers.
    #[serde(default)]
    pub table_prefix: String,
    /// Reconnect budget for transient failures.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Master switch for query-result caching on this pool.
    #[serde(default)]
    pub query_cache_enabled: bool,
    /// Session-init statements applied on every successful open (character
    /// set, strict-error mode, ...).
    #[serde(default)]
    pub init_statements: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl ConnectionConfig {
    pub fn new(pool: impl Into<String>, server: ServerConfig) -> Self {
        Self {
            pool: pool.into(),
            server,
            masters: Vec::new(),
            slaves: Vec::new(),
            enable_slaves: true,
            table_prefix: String::new(),
            retry: RetryPolicy::default(),
            query_cache_enabled: false,
            init_statements: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_slaves(mut self, slaves: Vec<ServerConfig>) -> Self {
        self.slaves = slaves;
        self
    }

    #[must_use]
    pub fn with_masters(mut self, masters: Vec<ServerConfig>) -> Self {
        self.masters = masters;
        self
    }

    #[must_use]
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_query_cache(mut self) -> Self {
        self.query_cache_enabled = true;
        self
    }

    #[must_use]
    pub fn with_init_statements(mut self, statements: Vec<String>) -> Self {
        self.init_statements = statements;
        self
    }

    /// Check the parts that must hold before any driver call is attempted.
    pub fn validate(&self) -> Result<(), SqlConduitError> {
        if self.pool.trim().is_empty() {
            return Err(SqlConduitError::ConfigError(
                "pool name is empty".to_string(),
            ));
        }
        Dsn::parse(&self.server.dsn)?;
        for server in self.masters.iter().chain(self.slaves.iter()) {
            Dsn::parse(&server.dsn)?;
        }
        if self.retry.max_attempts == 0 {
            return Err(SqlConduitError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
