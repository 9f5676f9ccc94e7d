//! One SQL statement bound to a connection: parameter binding, preparation,
//! the bounded transient-retry envelope, and the query-cache wrap on the read
//! path.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use tracing::{debug, warn};

use crate::cache::command_cache_key;
use crate::cache::CacheDuration;
use crate::connection::{Connection, Route};
use crate::driver::Statement;
use crate::error::{DriverError, SqlConduitError};
use crate::results::{ResultSet, Row};
use crate::retry::ErrorClass;
use crate::types::{BoundParam, FetchMethod, ParamIndex, ParamType, RowValues};

/// A command is created per logical operation and holds its connection
/// exclusively for that operation's duration. The prepared-statement handle
/// is torn down and rebuilt transparently when the link dies mid-statement.
pub struct Command<'conn> {
    conn: &'conn mut Connection,
    sql: String,
    prepared: Option<Box<dyn Statement>>,
    route: Option<Route>,
    /// Bindings recorded but not yet applied to a prepared handle.
    pending: BTreeMap<ParamIndex, BoundParam>,
    /// Bindings the prepared handle will receive on execution; re-applied
    /// verbatim after a reconnect.
    applied: BTreeMap<ParamIndex, BoundParam>,
    fetch_column: usize,
    cache_duration: Option<CacheDuration>,
    cache_dependency: Option<String>,
    attempts: u32,
}

impl std::fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("sql", &self.sql)
            .field("prepared", &self.prepared.is_some())
            .field("route", &self.route)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl<'conn> Command<'conn> {
    pub(crate) fn new(conn: &'conn mut Connection, sql: String) -> Self {
        Self {
            conn,
            sql,
            prepared: None,
            route: None,
            pending: BTreeMap::new(),
            applied: BTreeMap::new(),
            fetch_column: 0,
            cache_duration: None,
            cache_dependency: None,
            attempts: 0,
        }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Replace the SQL text. Any prepared handle and all bindings are
    /// discarded; re-binding is required. No-op when the text is unchanged.
    pub fn set_sql(&mut self, sql: impl Into<String>) -> &mut Self {
        let sql = sql.into();
        if sql != self.sql {
            self.cancel();
            self.pending.clear();
            self.applied.clear();
            self.sql = sql;
        }
        self
    }

    /// Drop the prepared handle and all bindings, returning to the idle
    /// state.
    pub fn cancel(&mut self) -> &mut Self {
        self.prepared = None;
        self.route = None;
        self.pending.clear();
        self.applied.clear();
        self
    }

    /// Record a binding; applied lazily on the next prepare/execute, so
    /// binding before or after preparation both work.
    pub fn bind_value(&mut self, index: impl Into<ParamIndex>, value: RowValues) -> &mut Self {
        self.pending.insert(index.into(), BoundParam::new(value));
        self
    }

    /// Like [`Command::bind_value`] with an explicit wire type.
    pub fn bind_value_typed(
        &mut self,
        index: impl Into<ParamIndex>,
        value: RowValues,
        ty: ParamType,
    ) -> &mut Self {
        self.pending
            .insert(index.into(), BoundParam::with_type(value, ty));
        self
    }

    pub fn bind_values<I, K>(&mut self, params: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, RowValues)>,
        K: Into<ParamIndex>,
    {
        for (index, value) in params {
            self.bind_value(index, value);
        }
        self
    }

    /// Column used by the scalar/column fetches (and the cache key).
    pub fn fetch_column(&mut self, column: usize) -> &mut Self {
        self.fetch_column = column;
        self
    }

    /// Explicit cache policy for this command, overriding any active scope on
    /// the connection.
    pub fn cache(&mut self, duration: CacheDuration, dependency: Option<String>) -> &mut Self {
        self.cache_duration = Some(duration);
        self.cache_dependency = dependency;
        self
    }

    /// Suppress caching for this command even when a scope is active.
    pub fn no_cache(&mut self) -> &mut Self {
        self.cache_duration = Some(CacheDuration::Disabled);
        self.cache_dependency = None;
        self
    }

    /// Transient-failure count since the last success.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Prepare the statement, routing to master or slave. When already
    /// prepared, only re-applies pending bindings.
    pub async fn prepare(&mut self, for_read: Option<bool>) -> Result<(), SqlConduitError> {
        if self.prepared.is_some() {
            self.apply_pending();
            return Ok(());
        }
        if self.sql.trim().is_empty() {
            return Err(SqlConduitError::StatementError {
                message: "cannot prepare an empty statement".to_string(),
                sql: self.sql.clone(),
            });
        }
        let for_read = match for_read {
            Some(explicit) => explicit,
            None => self.conn.dialect().is_read_sql(&self.sql),
        };
        let route = self.conn.route_for(for_read).await?;
        let stmt = {
            let link = self.conn.link_mut(route)?;
            link.prepare(&self.sql).await
        }
        .map_err(|e| SqlConduitError::StatementError {
            message: e.to_string(),
            sql: self.sql.clone(),
        })?;
        self.prepared = Some(stmt);
        self.route = Some(route);
        self.apply_pending();
        Ok(())
    }

    /// Execute as a write statement and return the affected-row count. Empty
    /// SQL is a valid no-op.
    pub async fn execute(&mut self) -> Result<u64, SqlConduitError> {
        if self.sql.trim().is_empty() {
            return Ok(0);
        }
        loop {
            self.prepare(Some(false)).await?;
            let params = self.applied_params();
            let outcome = {
                let stmt = self.statement_mut()?;
                stmt.execute(&params).await
            };
            match outcome {
                Ok(affected) => {
                    self.attempts = 0;
                    debug!(affected, "statement executed");
                    return Ok(affected);
                }
                Err(err) => self.recover_or_raise(err).await?,
            }
        }
    }

    /// Fetch the full result set.
    pub async fn query_all(&mut self) -> Result<ResultSet, SqlConduitError> {
        self.query_internal(FetchMethod::All).await
    }

    /// Fetch the first row, if any.
    pub async fn query_one(&mut self) -> Result<Option<Row>, SqlConduitError> {
        let rs = self.query_internal(FetchMethod::One).await?;
        Ok(rs.results.into_iter().next())
    }

    /// Fetch a single value: the fetch column of the first row.
    pub async fn query_scalar(&mut self) -> Result<Option<RowValues>, SqlConduitError> {
        let column = self.fetch_column;
        let rs = self.query_internal(FetchMethod::Scalar).await?;
        Ok(rs.scalar_at(column))
    }

    /// Fetch the fetch column across all rows.
    pub async fn query_column(&mut self) -> Result<Vec<RowValues>, SqlConduitError> {
        let column = self.fetch_column;
        let rs = self.query_internal(FetchMethod::Column).await?;
        Ok(rs.column_at(column))
    }

    /// Read path: cache negotiation, then the same retry envelope as
    /// [`Command::execute`], then write-back on a miss.
    async fn query_internal(&mut self, method: FetchMethod) -> Result<ResultSet, SqlConduitError> {
        if self.sql.trim().is_empty() {
            return Ok(ResultSet::default());
        }

        let policy = self
            .conn
            .query_cache_info(self.cache_duration, self.cache_dependency.as_deref());
        let mut cache_plan = None;
        if let Some(policy) = policy
            && let Some(store) = self.conn.cache_store_handle()
        {
            // The fingerprint only exists once the link is open, and the key
            // must carry the current one.
            self.conn.open().await?;
            let identity = self.conn.cache_identity()?;
            let key = command_cache_key(
                method,
                self.fetch_column,
                &identity.dsn_identity,
                &identity.username,
                &identity.fingerprint,
                &self.raw_sql(),
            );
            match store.get(&key).await {
                Ok(Some(bytes)) => match ResultSet::from_cache_bytes(&bytes) {
                    Ok(rs) => {
                        debug!(method = method.tag(), "query cache hit");
                        return Ok(rs);
                    }
                    Err(e) => {
                        warn!(error = %e, "undecodable query cache entry; treating as miss");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "query cache read failed; treating as miss");
                }
            }
            cache_plan = Some((key, policy, store));
        }

        let rs = loop {
            self.prepare(Some(true)).await?;
            let params = self.applied_params();
            let outcome = {
                let stmt = self.statement_mut()?;
                stmt.query(&params).await
            };
            match outcome {
                Ok(rs) => {
                    self.attempts = 0;
                    break rs;
                }
                Err(err) => self.recover_or_raise(err).await?,
            }
        };

        if let Some((key, policy, store)) = cache_plan {
            match rs.to_cache_bytes() {
                Ok(bytes) => {
                    if let Err(e) = store
                        .set(&key, bytes, policy.duration, policy.dependency.as_deref())
                        .await
                    {
                        warn!(error = %e, "query cache write failed; result returned uncached");
                    }
                }
                Err(e) => warn!(error = %e, "query result not cacheable: {e}"),
            }
        }
        Ok(rs)
    }

    /// Decide the fate of a failed physical attempt: reconnect and signal the
    /// caller to retry, or wrap and raise. Transient failures get a full
    /// close/reopen with the same SQL re-prepared and all applied bindings
    /// restored; anything else is fatal on the spot. No retry happens inside
    /// an active transaction: its state cannot survive the reconnect.
    async fn recover_or_raise(&mut self, err: DriverError) -> Result<(), SqlConduitError> {
        let policy = self.conn.retry_policy();
        if !self.conn.has_active_transaction()
            && self.conn.transient_matcher().classify(&err.message) == ErrorClass::Transient
        {
            self.attempts += 1;
            if self.attempts < policy.max_attempts {
                warn!(
                    attempt = self.attempts,
                    max_attempts = policy.max_attempts,
                    error = %err.message,
                    "transient link failure; reconnecting"
                );
                let route = self.route.unwrap_or(Route::Master);
                self.prepared = None;
                self.route = None;
                // Applied bindings go back to pending so the rebuilt handle
                // receives them; newer pending entries keep precedence.
                for (index, param) in std::mem::take(&mut self.applied) {
                    self.pending.entry(index).or_insert(param);
                }
                self.conn.drop_route(route).await;
                return Ok(());
            }
        }
        Err(SqlConduitError::ExecutionError {
            message: err.message,
            sql: self.raw_sql(),
        })
    }

    fn statement_mut(&mut self) -> Result<&mut (dyn Statement + 'static), SqlConduitError> {
        let sql = &self.sql;
        self.prepared
            .as_deref_mut()
            .ok_or_else(|| SqlConduitError::ExecutionError {
                message: "statement handle missing after prepare".to_string(),
                sql: sql.clone(),
            })
    }

    fn apply_pending(&mut self) {
        // BTreeMap::append overwrites duplicates with the pending (newer)
        // values.
        self.applied.append(&mut self.pending);
    }

    fn applied_params(&self) -> Vec<(ParamIndex, BoundParam)> {
        self.applied
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// The SQL with bound values substituted in. For diagnostics and cache
    /// keys only; never sent back to the driver.
    #[must_use]
    pub fn raw_sql(&self) -> String {
        if self.applied.is_empty() && self.pending.is_empty() {
            return self.sql.clone();
        }
        let mut merged: BTreeMap<&ParamIndex, &BoundParam> = BTreeMap::new();
        for (index, param) in self.applied.iter().chain(self.pending.iter()) {
            merged.insert(index, param);
        }

        let mut named: Vec<(&str, String)> = Vec::new();
        let mut positional: BTreeMap<u16, String> = BTreeMap::new();
        for (index, param) in merged {
            match index {
                ParamIndex::Named(name) => named.push((name, render_value(&param.value))),
                ParamIndex::Positional(pos) => {
                    positional.insert(*pos, render_value(&param.value));
                }
            }
        }
        // Longest names first so ":id" never clobbers part of ":id_next".
        named.sort_by_key(|(name, _)| std::cmp::Reverse(name.len()));

        let mut sql = self.sql.clone();
        for (name, rendered) in named {
            sql = sql.replace(name, &rendered);
        }
        if positional.is_empty() {
            return sql;
        }
        let mut out = String::with_capacity(sql.len());
        let mut position: u16 = 0;
        for ch in sql.chars() {
            if ch == '?' {
                position += 1;
                match positional.get(&position) {
                    Some(rendered) => out.push_str(rendered),
                    None => out.push('?'),
                }
            } else {
                out.push(ch);
            }
        }
        out
    }
}

fn render_value(value: &RowValues) -> String {
    match value {
        RowValues::Null => "NULL".to_string(),
        RowValues::Int(v) => v.to_string(),
        RowValues::Float(v) => v.to_string(),
        RowValues::Bool(v) => if *v { "TRUE" } else { "FALSE" }.to_string(),
        RowValues::Text(v) => quote_literal(v),
        RowValues::Timestamp(v) => quote_literal(&v.format("%Y-%m-%d %H:%M:%S").to_string()),
        RowValues::JSON(v) => quote_literal(&v.to_string()),
        RowValues::Blob(bytes) => {
            let mut out = String::with_capacity(2 + bytes.len() * 2);
            out.push_str("0x");
            for byte in bytes {
                let _ = write!(out, "{byte:02x}");
            }
            out
        }
    }
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
