//! Per-task connection context.
//!
//! Each logical task owns one `DbContext` and resolves its connections from
//! it by pool key: `"<pool>"`, `"<pool>.master"`, or `"<pool>.slave"`. The
//! context is threaded explicitly through call chains; there is no
//! process-wide mutable registry. Because connections are handed out as
//! `&mut`, an in-place reconnect inside command retry is automatically
//! visible to every later lookup of the same key; [`DbContext::refresh`]
//! covers the rarer replace-the-object case.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::connection::{Connection, ConnectionConfig};
use crate::driver::Driver;
use crate::error::SqlConduitError;

static ROLE_ROTATION: AtomicUsize = AtomicUsize::new(0);

/// Role qualifier parsed from a pool key suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Default,
    Master,
    Slave,
}

/// Split `"app.slave"` into `("app", Role::Slave)`.
fn parse_key(key: &str) -> (&str, Role) {
    if let Some(pool) = key.strip_suffix(".master") {
        (pool, Role::Master)
    } else if let Some(pool) = key.strip_suffix(".slave") {
        (pool, Role::Slave)
    } else {
        (key, Role::Default)
    }
}

/// Task-local map of pool key to connection.
pub struct DbContext {
    driver: Arc<dyn Driver>,
    configs: HashMap<String, ConnectionConfig>,
    connections: HashMap<String, Connection>,
}

impl std::fmt::Debug for DbContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbContext")
            .field("pools", &self.configs.keys().collect::<Vec<_>>())
            .field("open_keys", &self.connections.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DbContext {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            configs: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    /// Register a pool configuration. Replaces any previous config under the
    /// same pool name; existing connections are untouched.
    pub fn register(&mut self, config: ConnectionConfig) {
        self.configs.insert(config.pool.clone(), config);
    }

    /// Resolve the connection for `key`, constructing it on first use.
    pub fn get(&mut self, key: &str) -> Result<&mut Connection, SqlConduitError> {
        if !self.connections.contains_key(key) {
            let connection = self.build(key)?;
            self.connections.insert(key.to_string(), connection);
        }
        self.connections
            .get_mut(key)
            .ok_or_else(|| SqlConduitError::ConfigError(format!("unknown pool key '{key}'")))
    }

    /// Re-publish a replacement connection under `key`, e.g. after swapping
    /// in a `clone_detached` copy.
    pub fn refresh(&mut self, key: &str, connection: Connection) {
        self.connections.insert(key.to_string(), connection);
    }

    /// Drop the connection under `key`, closing its link.
    pub fn remove(&mut self, key: &str) {
        if let Some(mut connection) = self.connections.remove(key) {
            connection.close();
        }
    }

    fn build(&self, key: &str) -> Result<Connection, SqlConduitError> {
        let (pool, role) = parse_key(key);
        let base = self.configs.get(pool).ok_or_else(|| {
            SqlConduitError::ConfigError(format!("no configuration registered for pool '{pool}'"))
        })?;
        let config = role_config(base, role)?;
        Ok(Connection::new(config, Arc::clone(&self.driver)))
    }
}

/// Derive the effective configuration for a role-forced key. A forced slave
/// picks one replica (rotating start, remembered for the connection's
/// lifetime by virtue of being baked into the config) and never re-routes.
fn role_config(base: &ConnectionConfig, role: Role) -> Result<ConnectionConfig, SqlConduitError> {
    match role {
        Role::Default => Ok(base.clone()),
        Role::Master => {
            let mut config = base.clone();
            config.pool = format!("{}.master", base.pool);
            if !base.masters.is_empty() {
                let pick = ROLE_ROTATION.fetch_add(1, Ordering::Relaxed) % base.masters.len();
                config.server = base.masters[pick].clone();
            }
            config.masters = Vec::new();
            config.slaves = Vec::new();
            config.enable_slaves = false;
            Ok(config)
        }
        Role::Slave => {
            if base.slaves.is_empty() {
                return Err(SqlConduitError::ConfigError(format!(
                    "pool '{}' has no slaves configured",
                    base.pool
                )));
            }
            let pick = ROLE_ROTATION.fetch_add(1, Ordering::Relaxed) % base.slaves.len();
            let mut config = base.clone();
            config.pool = format!("{}.slave", base.pool);
            config.server = base.slaves[pick].clone();
            config.masters = Vec::new();
            config.slaves = Vec::new();
            config.enable_slaves = false;
            Ok(config)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_parsing() {
        assert_eq!(parse_key("app"), ("app", Role::Default));
        assert_eq!(parse_key("app.master"), ("app", Role::Master));
        assert_eq!(parse_key("app.slave"), ("app", Role::Slave));
    }
}
