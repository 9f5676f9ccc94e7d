//! The driver seam: everything below this trait boundary (the physical
//! protocol client) is an external collaborator. The access layer only needs
//! connect / prepare / execute and a way to read the native error message.

use std::collections::BTreeMap;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;

use crate::connection::ServerConfig;
use crate::error::{DriverError, SqlConduitError};
use crate::results::ResultSet;
use crate::types::{BoundParam, ParamIndex};

/// Factory for physical links. One driver instance serves every connection
/// in a process.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self, server: &ServerConfig) -> Result<Box<dyn Link>, SqlConduitError>;
}

/// One open physical link to a database server.
#[async_trait]
pub trait Link: Send {
    /// Driver identifier ("mysql", "pgsql", ...) as reported by the link.
    fn driver_name(&self) -> &str;

    /// Prepare a statement for later execution.
    async fn prepare(&mut self, sql: &str) -> Result<Box<dyn Statement>, DriverError>;

    /// Run a statement that carries no parameters and returns no rows
    /// (session init, BEGIN/COMMIT/ROLLBACK, SET ...).
    async fn exec_raw(&mut self, sql: &str) -> Result<(), DriverError>;
}

/// A prepared statement handle. Parameters are supplied at execution time;
/// the pending/applied bookkeeping above this seam decides what gets passed.
#[async_trait]
pub trait Statement: Send {
    /// Execute as a write; returns the affected-row count.
    async fn execute(&mut self, params: &[(ParamIndex, BoundParam)]) -> Result<u64, DriverError>;

    /// Execute as a read; returns the full result set.
    async fn query(&mut self, params: &[(ParamIndex, BoundParam)])
    -> Result<ResultSet, DriverError>;
}

/// Parsed DSN: `driver://host[:port]/database[?key=value&...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    pub driver: String,
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub options: BTreeMap<String, String>,
}

impl Dsn {
    pub fn parse(raw: &str) -> Result<Self, SqlConduitError> {
        if raw.trim().is_empty() {
            return Err(SqlConduitError::ConfigError(
                "connection DSN is empty".to_string(),
            ));
        }
        let (driver, rest) = raw.split_once("://").ok_or_else(|| {
            SqlConduitError::ConfigError(format!("DSN '{raw}' is missing a driver scheme"))
        })?;
        if driver.is_empty() {
            return Err(SqlConduitError::ConfigError(format!(
                "DSN '{raw}' has an empty driver scheme"
            )));
        }

        let (rest, options) = match rest.split_once('?') {
            Some((head, query)) => {
                let mut opts = BTreeMap::new();
                for pair in query.split('&').filter(|p| !p.is_empty()) {
                    match pair.split_once('=') {
                        Some((k, v)) => opts.insert(k.to_string(), v.to_string()),
                        None => opts.insert(pair.to_string(), String::new()),
                    };
                }
                (head, opts)
            }
            None => (rest, BTreeMap::new()),
        };

        let (authority, database) = match rest.split_once('/') {
            Some((a, d)) => (a, d.to_string()),
            None => (rest, String::new()),
        };
        let (host, port) = match authority.split_once(':') {
            Some((h, p)) => {
                let port = p.parse::<u16>().map_err(|_| {
                    SqlConduitError::ConfigError(format!("DSN '{raw}' has an invalid port '{p}'"))
                })?;
                (h.to_string(), Some(port))
            }
            None => (authority.to_string(), None),
        };

        Ok(Dsn {
            driver: driver.to_string(),
            host,
            port,
            database,
            options,
        })
    }

    /// Canonical identity string, stable across restarts; used to salt cache
    /// keys. Credentials are deliberately not part of it (they are a separate
    /// key component).
    #[must_use]
    pub fn identity(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{}/{}", self.driver, self.host, port, self.database),
            None => format!("{}://{}/{}", self.driver, self.host, self.database),
        }
    }

    /// DSN option lookup (e.g. `charset`).
    #[must_use]
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// Dialect knowledge the access layer relies on: statement classification for
/// routing, identifier quoting for the marker syntax, and existence-check
/// wrapping. SQL assembly itself stays outside this crate.
pub trait Dialect: Send + Sync {
    /// Whether `sql` can be routed to a read-only replica.
    fn is_read_sql(&self, sql: &str) -> bool;

    /// Wrap a rendered SELECT into an existence check.
    fn wrap_exists(&self, sql: &str) -> String;

    /// Quote a (possibly dotted) column reference; `*` passes through.
    fn quote_column(&self, name: &str) -> String;

    /// Quote a (possibly dotted) table reference after expanding `%` to the
    /// configured table prefix.
    fn quote_table(&self, name: &str, prefix: &str) -> String;
}

lazy_static! {
    static ref READ_SQL: Regex = Regex::new(r"(?i)^\s*(SELECT|SHOW|DESCRIBE|EXPLAIN|PRAGMA)\b")
        .expect("read-classifier regex is valid");
}

/// Default ANSI dialect: double-quote identifiers, regex read classification.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsiDialect;

impl Dialect for AnsiDialect {
    fn is_read_sql(&self, sql: &str) -> bool {
        READ_SQL.is_match(sql)
    }

    fn wrap_exists(&self, sql: &str) -> String {
        format!("SELECT EXISTS({sql})")
    }

    fn quote_column(&self, name: &str) -> String {
        quote_dotted(name)
    }

    fn quote_table(&self, name: &str, prefix: &str) -> String {
        quote_dotted(&name.replace('%', prefix))
    }
}

fn quote_dotted(name: &str) -> String {
    name.split('.')
        .map(|part| {
            if part == "*" || part.starts_with('"') {
                part.to_string()
            } else {
                format!("\"{part}\"")
            }
        })
        .collect::<Vec<_>>()
        .join(".")
}
