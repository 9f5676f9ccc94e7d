//! Connection lifecycle: open/close, master/slave resolution, transaction
//! helpers, and query-cache negotiation.

mod config;

pub use config::{ConnectionConfig, ServerConfig};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::cache::{CacheDuration, CachePolicy, CacheScopeStack, QueryCacheStore};
use crate::command::Command;
use crate::driver::{AnsiDialect, Dialect, Driver, Dsn, Link};
use crate::error::SqlConduitError;
use crate::retry::{RetryPolicy, TransientMatcher};
use crate::transaction::{Transaction, TransactionToken};
use crate::types::IsolationLevel;

/// Boxed future returned by the scoped-callback helpers (`transaction`,
/// `use_master`, `with_query_cache`).
pub type ConnFuture<'a, R> =
    Pin<Box<dyn Future<Output = Result<R, SqlConduitError>> + Send + 'a>>;

/// Which physical link a command was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Master,
    Slave,
}

/// Lazy, memoized resolution state for a sibling connection. Sticky once it
/// lands on `None`; reset by `close()` and `clone_detached()`.
enum SiblingState {
    Unresolved,
    None,
    Resolved(Box<Connection>),
}

/// Identity components a command needs for cache-key derivation.
#[derive(Debug, Clone)]
pub(crate) struct CacheIdentity {
    pub dsn_identity: String,
    pub username: String,
    pub fingerprint: String,
}

/// Lazily-built schema handle. The introspection cache itself is an external
/// collaborator; this only carries what the access layer needs locally.
#[derive(Debug, Clone)]
pub struct Schema {
    driver_name: String,
    table_prefix: String,
}

impl Schema {
    #[must_use]
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// Strip `{{...}}` markers and expand `%` to the table prefix, yielding
    /// the physical table name.
    #[must_use]
    pub fn raw_table_name(&self, name: &str) -> String {
        let inner = name
            .strip_prefix("{{")
            .and_then(|n| n.strip_suffix("}}"))
            .unwrap_or(name);
        inner.replace('%', &self.table_prefix)
    }
}

static FINGERPRINT_SEQ: AtomicU64 = AtomicU64::new(0);
static SLAVE_ROTATION: AtomicUsize = AtomicUsize::new(0);

/// A logical database connection: owns at most one physical link, resolves
/// role siblings for the same pool, and tracks the active transaction.
///
/// A `Connection` is task-local by contract: it is never shared between
/// concurrently-running tasks, so its in-memory state needs no locking.
pub struct Connection {
    config: ConnectionConfig,
    driver: Arc<dyn Driver>,
    dialect: Arc<dyn Dialect>,
    cache_store: Option<Arc<dyn QueryCacheStore>>,
    after_open: Option<Arc<dyn Fn(&ConnectionConfig) + Send + Sync>>,
    transient_matcher: TransientMatcher,

    link: Option<Box<dyn Link>>,
    driver_name: Option<String>,
    fingerprint: String,
    schema: Option<Schema>,
    active_tx: Option<Transaction>,
    master: SiblingState,
    slave: SiblingState,
    cache_scopes: CacheScopeStack,
    force_master: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("pool", &self.config.pool)
            .field("open", &self.link.is_some())
            .field("fingerprint", &self.fingerprint)
            .field("transaction", &self.active_tx)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(config: ConnectionConfig, driver: Arc<dyn Driver>) -> Self {
        Self {
            config,
            driver,
            dialect: Arc::new(AnsiDialect),
            cache_store: None,
            after_open: None,
            transient_matcher: TransientMatcher::default(),
            link: None,
            driver_name: None,
            fingerprint: String::new(),
            schema: None,
            active_tx: None,
            master: SiblingState::Unresolved,
            slave: SiblingState::Unresolved,
            cache_scopes: CacheScopeStack::default(),
            force_master: false,
        }
    }

    #[must_use]
    pub fn with_dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = dialect;
        self
    }

    #[must_use]
    pub fn with_cache_store(mut self, store: Arc<dyn QueryCacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    /// Hook invoked after every successful `open()`.
    #[must_use]
    pub fn on_after_open(mut self, hook: Arc<dyn Fn(&ConnectionConfig) + Send + Sync>) -> Self {
        self.after_open = Some(hook);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Opaque marker regenerated on every successful open; salts cache keys
    /// so results from a previous physical link are never served.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[must_use]
    pub fn table_prefix(&self) -> &str {
        &self.config.table_prefix
    }

    #[must_use]
    pub fn has_active_transaction(&self) -> bool {
        matches!(&self.active_tx, Some(tx) if tx.is_active())
    }

    #[must_use]
    pub fn transaction_state(&self) -> Option<&Transaction> {
        self.active_tx.as_ref()
    }

    /// Operator-editable transient-error signature list.
    pub fn transient_matcher_mut(&mut self) -> &mut TransientMatcher {
        &mut self.transient_matcher
    }

    pub(crate) fn transient_matcher(&self) -> &TransientMatcher {
        &self.transient_matcher
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.config.retry
    }

    pub(crate) fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    #[must_use]
    pub fn dialect_handle(&self) -> Arc<dyn Dialect> {
        Arc::clone(&self.dialect)
    }

    pub(crate) fn cache_store_handle(&self) -> Option<Arc<dyn QueryCacheStore>> {
        self.cache_store.clone()
    }

    pub(crate) fn is_forcing_master(&self) -> bool {
        self.force_master
    }

    /// Acquire the physical link. No-op when already open. Fails with
    /// `ConfigError` before any driver call when the configuration is
    /// invalid, and with `ConnectionError` when the driver cannot connect.
    pub async fn open(&mut self) -> Result<(), SqlConduitError> {
        if self.link.is_some() {
            return Ok(());
        }
        self.config.validate()?;

        let mut link = self.driver.connect(&self.config.server).await.map_err(|e| {
            match e {
                SqlConduitError::ConfigError(_) | SqlConduitError::ConnectionError(_) => e,
                other => SqlConduitError::ConnectionError(format!(
                    "failed to open pool '{}': {other}",
                    self.config.pool
                )),
            }
        })?;

        for statement in &self.config.init_statements {
            link.exec_raw(statement).await.map_err(|e| {
                SqlConduitError::ConnectionError(format!(
                    "session init '{statement}' failed on pool '{}': {e}",
                    self.config.pool
                ))
            })?;
        }

        if self.driver_name.is_none() {
            self.driver_name = Some(link.driver_name().to_string());
        }
        self.fingerprint = next_fingerprint(&self.config.pool);
        self.link = Some(link);
        debug!(pool = %self.config.pool, fingerprint = %self.fingerprint, "connection opened");

        if let Some(hook) = &self.after_open {
            hook(&self.config);
        }
        Ok(())
    }

    /// Release the link and all derived state. Safe to call when closed.
    pub fn close(&mut self) {
        if self.link.take().is_some() {
            debug!(pool = %self.config.pool, "connection closed");
        }
        if self.has_active_transaction() {
            warn!(pool = %self.config.pool, "connection closed with an active transaction");
        }
        self.schema = None;
        self.active_tx = None;
        self.master = SiblingState::Unresolved;
        self.slave = SiblingState::Unresolved;
    }

    /// Driver identifier, resolved lazily from the open link or the DSN
    /// scheme.
    pub fn driver_name(&mut self) -> Result<String, SqlConduitError> {
        if let Some(name) = &self.driver_name {
            return Ok(name.clone());
        }
        if let Some(link) = &self.link {
            let name = link.driver_name().to_string();
            self.driver_name = Some(name.clone());
            return Ok(name);
        }
        let name = Dsn::parse(&self.config.server.dsn)?.driver;
        self.driver_name = Some(name.clone());
        Ok(name)
    }

    /// Lazily-built schema handle; invalidated by `close()`.
    pub fn schema(&mut self) -> Result<&Schema, SqlConduitError> {
        if self.schema.is_none() {
            let schema = Schema {
                driver_name: self.driver_name()?,
                table_prefix: self.config.table_prefix.clone(),
            };
            self.schema = Some(schema);
        }
        self.schema.as_ref().ok_or_else(|| {
            SqlConduitError::ConnectionError("schema handle unavailable".to_string())
        })
    }

    /// A clone that keeps static configuration and collaborators but resets
    /// all derived/lazy state (link, fingerprint, schema, transaction,
    /// sibling resolution, cache scopes).
    #[must_use]
    pub fn clone_detached(&self) -> Connection {
        let mut fresh = Connection::new(self.config.clone(), Arc::clone(&self.driver));
        fresh.dialect = Arc::clone(&self.dialect);
        fresh.cache_store = self.cache_store.clone();
        fresh.after_open = self.after_open.clone();
        fresh.transient_matcher = self.transient_matcher.clone();
        fresh
    }

    /// Create a command bound to this connection.
    pub fn create_command(&mut self, sql: impl Into<String>) -> Command<'_> {
        Command::new(self, sql.into())
    }

    // ------------------------------------------------------------------
    // Master/slave resolution
    // ------------------------------------------------------------------

    /// Resolve the read-only sibling for this pool. Returns the slave when
    /// one is configured and reachable; otherwise `self` when
    /// `fallback_to_master`, else `None`.
    pub async fn get_slave(
        &mut self,
        fallback_to_master: bool,
    ) -> Result<Option<&mut Connection>, SqlConduitError> {
        let usable = self.ensure_slave().await?;
        if usable {
            match &mut self.slave {
                SiblingState::Resolved(conn) => Ok(Some(conn.as_mut())),
                _ => Ok(None),
            }
        } else if fallback_to_master {
            Ok(Some(self))
        } else {
            Ok(None)
        }
    }

    /// Resolve the dedicated-master sibling, when `masters` is configured.
    /// `None` means writes go through this connection itself.
    pub async fn get_master(&mut self) -> Result<Option<&mut Connection>, SqlConduitError> {
        if self.config.masters.is_empty() {
            self.master = SiblingState::None;
            return Ok(None);
        }
        if matches!(self.master, SiblingState::Unresolved) {
            self.resolve_master().await?;
        }
        match &mut self.master {
            SiblingState::Resolved(conn) => Ok(Some(conn.as_mut())),
            _ => Ok(None),
        }
    }

    /// Decide which link a statement runs on. Reads go to a resolved slave
    /// unless a transaction is active or `use_master` is in effect; writes
    /// and everything else go to the master.
    pub(crate) async fn route_for(&mut self, for_read: bool) -> Result<Route, SqlConduitError> {
        if for_read
            && !self.force_master
            && !self.has_active_transaction()
            && self.ensure_slave().await?
        {
            return Ok(Route::Slave);
        }
        self.ensure_master_open().await?;
        Ok(Route::Master)
    }

    pub(crate) fn link_mut(&mut self, route: Route) -> Result<&mut (dyn Link + 'static), SqlConduitError> {
        match route {
            Route::Master => {
                if let SiblingState::Resolved(conn) = &mut self.master {
                    return conn.link_mut(Route::Master);
                }
                self.link.as_deref_mut().ok_or_else(|| {
                    SqlConduitError::ConnectionError(format!(
                        "pool '{}' is not open",
                        self.config.pool
                    ))
                })
            }
            Route::Slave => match &mut self.slave {
                SiblingState::Resolved(conn) => conn.link_mut(Route::Master),
                _ => Err(SqlConduitError::ConnectionError(format!(
                    "pool '{}' has no resolved slave",
                    self.config.pool
                ))),
            },
        }
    }

    /// Close the routed link ahead of a reconnect attempt; the reopen happens
    /// on the next prepare. The optional delay is the retry loop's only
    /// deliberate suspension between attempts.
    pub(crate) async fn drop_route(&mut self, route: Route) {
        match route {
            Route::Master => {
                if let SiblingState::Resolved(conn) = &mut self.master {
                    conn.close();
                } else {
                    self.close();
                }
            }
            Route::Slave => {
                if let SiblingState::Resolved(conn) = &mut self.slave {
                    conn.close();
                }
            }
        }
        let delay = self.config.retry.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn ensure_master_open(&mut self) -> Result<(), SqlConduitError> {
        if !self.config.masters.is_empty() {
            if matches!(self.master, SiblingState::Unresolved) {
                self.resolve_master().await?;
            }
            if let SiblingState::Resolved(conn) = &mut self.master {
                return conn.open().await;
            }
        }
        self.open().await
    }

    /// True when a slave is resolved and open. A slave that fails to open is
    /// logged and skipped; resolution failures stick to `None` until the
    /// connection is closed or cloned.
    async fn ensure_slave(&mut self) -> Result<bool, SqlConduitError> {
        if !self.config.enable_slaves || self.config.slaves.is_empty() {
            self.slave = SiblingState::None;
            return Ok(false);
        }
        if matches!(self.slave, SiblingState::Unresolved) {
            self.resolve_slave().await;
        }
        match &mut self.slave {
            SiblingState::Resolved(conn) => match conn.open().await {
                Ok(()) => Ok(true),
                Err(e) => {
                    warn!(pool = %self.config.pool, error = %e, "slave unavailable; falling back to master");
                    Ok(false)
                }
            },
            _ => Ok(false),
        }
    }

    /// Pick one slave, starting from a rotating offset, and remember it for
    /// this connection's lifetime.
    async fn resolve_slave(&mut self) {
        let count = self.config.slaves.len();
        let start = SLAVE_ROTATION.fetch_add(1, Ordering::Relaxed) % count;
        for i in 0..count {
            let server = self.config.slaves[(start + i) % count].clone();
            let mut sibling = self.sibling_connection("slave", server);
            match sibling.open().await {
                Ok(()) => {
                    debug!(pool = %self.config.pool, slave = %sibling.config.server.dsn, "slave resolved");
                    self.slave = SiblingState::Resolved(Box::new(sibling));
                    return;
                }
                Err(e) => {
                    warn!(pool = %self.config.pool, slave = %sibling.config.server.dsn, error = %e, "slave failed to open");
                }
            }
        }
        self.slave = SiblingState::None;
    }

    async fn resolve_master(&mut self) -> Result<(), SqlConduitError> {
        let count = self.config.masters.len();
        let mut last_err: Option<SqlConduitError> = None;
        for i in 0..count {
            let server = self.config.masters[i % count].clone();
            let mut sibling = self.sibling_connection("master", server);
            match sibling.open().await {
                Ok(()) => {
                    self.master = SiblingState::Resolved(Box::new(sibling));
                    return Ok(());
                }
                Err(e) => {
                    warn!(pool = %self.config.pool, master = %sibling.config.server.dsn, error = %e, "master failed to open");
                    last_err = Some(e);
                }
            }
        }
        self.master = SiblingState::None;
        Err(last_err.unwrap_or_else(|| {
            SqlConduitError::ConfigError(format!(
                "pool '{}' has no usable masters",
                self.config.pool
            ))
        }))
    }

    fn sibling_connection(&self, role: &str, server: ServerConfig) -> Connection {
        let mut config = self.config.clone();
        config.pool = format!("{}.{role}", self.config.pool);
        config.server = server;
        config.masters = Vec::new();
        config.slaves = Vec::new();
        config.enable_slaves = false;
        let mut sibling = Connection::new(config, Arc::clone(&self.driver));
        sibling.dialect = Arc::clone(&self.dialect);
        sibling.cache_store = self.cache_store.clone();
        sibling.transient_matcher = self.transient_matcher.clone();
        sibling
    }

    /// Run `f` with slave routing disabled, restoring the previous routing
    /// mode afterwards even when `f` fails.
    pub async fn use_master<R, F>(&mut self, f: F) -> Result<R, SqlConduitError>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> ConnFuture<'c, R>,
    {
        let previous = self.force_master;
        self.force_master = true;
        let result = f(self).await;
        self.force_master = previous;
        result
    }

    // ------------------------------------------------------------------
    // Query-cache negotiation
    // ------------------------------------------------------------------

    /// Effective cache policy for one call, or `None` for "do not cache".
    /// Caching is possible at all only when the pool enables it and a store
    /// is configured.
    #[must_use]
    pub fn query_cache_info(
        &self,
        requested_duration: Option<CacheDuration>,
        requested_dependency: Option<&str>,
    ) -> Option<CachePolicy> {
        if !self.config.query_cache_enabled || self.cache_store.is_none() {
            return None;
        }
        self.cache_scopes
            .resolve(requested_duration, requested_dependency)
    }

    pub fn push_cache_scope(&mut self, duration: CacheDuration, dependency: Option<String>) {
        self.cache_scopes.push(duration, dependency);
    }

    pub fn pop_cache_scope(&mut self) {
        self.cache_scopes.pop();
    }

    /// Run `f` inside a cache scope; the scope is popped afterwards even when
    /// `f` fails.
    pub async fn with_query_cache<R, F>(
        &mut self,
        duration: CacheDuration,
        dependency: Option<String>,
        f: F,
    ) -> Result<R, SqlConduitError>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> ConnFuture<'c, R>,
    {
        self.cache_scopes.push(duration, dependency);
        let result = f(self).await;
        self.cache_scopes.pop();
        result
    }

    pub(crate) fn cache_identity(&self) -> Result<CacheIdentity, SqlConduitError> {
        Ok(CacheIdentity {
            dsn_identity: Dsn::parse(&self.config.server.dsn)?.identity(),
            username: self.config.server.username.clone(),
            fingerprint: self.fingerprint.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Begin a transaction, or enter a nested level of the active one. The
    /// returned token is required to commit or roll back the level it
    /// captures.
    pub async fn begin_transaction(
        &mut self,
        isolation: Option<IsolationLevel>,
    ) -> Result<TransactionToken, SqlConduitError> {
        self.ensure_master_open().await?;

        if self.has_active_transaction() {
            let token = match &mut self.active_tx {
                Some(tx) => tx.begin_nested(isolation),
                None => TransactionToken::outermost(),
            };
            debug!(pool = %self.config.pool, level = token.level(), "nested transaction level entered");
            return Ok(token);
        }

        if let Some(isolation) = isolation {
            self.exec_on_master(&format!(
                "SET TRANSACTION ISOLATION LEVEL {}",
                isolation.as_sql()
            ))
            .await?;
        }
        self.exec_on_master("BEGIN").await?;
        self.active_tx = Some(Transaction::new(isolation));
        debug!(pool = %self.config.pool, "transaction started");
        Ok(TransactionToken::outermost())
    }

    /// Commit the level captured by `token`. A no-op (with a warning) when
    /// the transaction has moved on or already finished; the physical COMMIT
    /// is issued only at the outermost level.
    pub async fn commit(&mut self, token: TransactionToken) -> Result<(), SqlConduitError> {
        let Some(tx) = &self.active_tx else {
            warn!(pool = %self.config.pool, "commit without an active transaction ignored");
            return Ok(());
        };
        if !tx.may_finalize(token) {
            warn!(
                pool = %self.config.pool,
                held = token.level(),
                current = tx.level(),
                "commit from a stale transaction level ignored"
            );
            return Ok(());
        }
        let physical = match &mut self.active_tx {
            Some(tx) => tx.leave_level(),
            None => false,
        };
        if physical {
            self.exec_on_master("COMMIT").await?;
            self.active_tx = None;
            debug!(pool = %self.config.pool, "transaction committed");
        }
        Ok(())
    }

    /// Roll back the level captured by `token`, mirroring [`Connection::commit`].
    pub async fn rollback(&mut self, token: TransactionToken) -> Result<(), SqlConduitError> {
        let Some(tx) = &self.active_tx else {
            warn!(pool = %self.config.pool, "rollback without an active transaction ignored");
            return Ok(());
        };
        if !tx.may_finalize(token) {
            warn!(
                pool = %self.config.pool,
                held = token.level(),
                current = tx.level(),
                "rollback from a stale transaction level ignored"
            );
            return Ok(());
        }
        let physical = match &mut self.active_tx {
            Some(tx) => tx.leave_level(),
            None => false,
        };
        if physical {
            self.exec_on_master("ROLLBACK").await?;
            self.active_tx = None;
            debug!(pool = %self.config.pool, "transaction rolled back");
        }
        Ok(())
    }

    /// Run `f` inside a transaction. Commits when `f` succeeds and the
    /// transaction is still at the level it started at; on failure performs a
    /// guarded rollback whose own errors are logged, never allowed to mask
    /// the original one.
    pub async fn transaction<R, F>(
        &mut self,
        isolation: Option<IsolationLevel>,
        f: F,
    ) -> Result<R, SqlConduitError>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> ConnFuture<'c, R>,
    {
        let token = self.begin_transaction(isolation).await?;
        match f(self).await {
            Ok(value) => {
                self.commit(token).await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback(token).await {
                    warn!(
                        pool = %self.config.pool,
                        error = %rollback_err,
                        "rollback failed while unwinding; surfacing the original error"
                    );
                }
                Err(err)
            }
        }
    }

    async fn exec_on_master(&mut self, sql: &str) -> Result<(), SqlConduitError> {
        let pool = self.config.pool.clone();
        let link = self.link_mut(Route::Master)?;
        link.exec_raw(sql)
            .await
            .map_err(|e| SqlConduitError::ConnectionError(format!("'{sql}' failed on pool '{pool}': {e}")))
    }
}

fn next_fingerprint(pool: &str) -> String {
    let seq = FINGERPRINT_SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{pool}:{nanos}:{seq}")
}
