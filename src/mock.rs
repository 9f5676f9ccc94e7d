//! Scripted in-memory driver and cache store for tests.
//!
//! The mock driver answers per-SQL scripts: each statement consumes the next
//! outcome from its script queue and the last outcome repeats once the queue
//! is drained, so "fail once then succeed" and "always fail" are both one
//! line to express. Every driver interaction is recorded in an event log the
//! tests can assert on, including which server (DSN) served each statement.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::cache::{CacheDuration, QueryCacheStore};
use crate::connection::ServerConfig;
use crate::driver::{Driver, Link, Statement};
use crate::error::{DriverError, SqlConduitError};
use crate::results::{ResultSet, Row};
use crate::types::{BoundParam, ParamIndex, RowValues};

/// One scripted response for a statement execution.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<RowValues>>,
    },
    Affected(u64),
    Fail(String),
}

/// Recorded driver interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    Connect { server: String },
    Prepare { server: String, sql: String },
    Execute { server: String, sql: String },
    Query { server: String, sql: String },
    Raw { server: String, sql: String },
}

#[derive(Default)]
struct Script {
    queue: VecDeque<MockOutcome>,
    repeat: Option<MockOutcome>,
}

impl Script {
    fn next(&mut self) -> Option<MockOutcome> {
        if let Some(outcome) = self.queue.pop_front() {
            if self.queue.is_empty() {
                self.repeat = Some(outcome.clone());
            }
            return Some(outcome);
        }
        self.repeat.clone()
    }
}

#[derive(Default)]
struct MockState {
    scripts: Mutex<HashMap<String, Script>>,
    refused: Mutex<Vec<String>>,
    events: Mutex<Vec<MockEvent>>,
}

impl MockState {
    fn record(&self, event: MockEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn next_outcome(&self, sql: &str) -> MockOutcome {
        self.scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(sql)
            .and_then(Script::next)
            .unwrap_or(MockOutcome::Affected(0))
    }
}

/// Scriptable driver. Clones share state, so a test can keep one handle for
/// assertions while connections hold another.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcomes for one SQL text, in order; the last outcome
    /// repeats indefinitely.
    pub fn script(&self, sql: &str, outcomes: Vec<MockOutcome>) {
        self.state
            .scripts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                sql.to_string(),
                Script {
                    queue: outcomes.into(),
                    repeat: None,
                },
            );
    }

    /// Convenience: always answer `sql` with these rows.
    pub fn on_query(&self, sql: &str, columns: &[&str], rows: Vec<Vec<RowValues>>) {
        self.script(
            sql,
            vec![MockOutcome::Rows {
                columns: columns.iter().map(ToString::to_string).collect(),
                rows,
            }],
        );
    }

    /// Convenience: always answer `sql` with an affected-row count.
    pub fn on_execute(&self, sql: &str, affected: u64) {
        self.script(sql, vec![MockOutcome::Affected(affected)]);
    }

    /// Make connects to `dsn` fail until allowed again.
    pub fn refuse_connections_to(&self, dsn: &str) {
        self.state
            .refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(dsn.to_string());
    }

    pub fn allow_connections_to(&self, dsn: &str) {
        self.state
            .refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|d| d != dsn);
    }

    #[must_use]
    pub fn events(&self) -> Vec<MockEvent> {
        self.state
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of successful connects so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, MockEvent::Connect { .. }))
            .count()
    }

    /// Physical executions (reads and writes) of one SQL text.
    #[must_use]
    pub fn executions_of(&self, sql: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| match e {
                MockEvent::Execute { sql: s, .. } | MockEvent::Query { sql: s, .. } => s == sql,
                _ => false,
            })
            .count()
    }

    /// Servers that physically executed one SQL text, in order.
    #[must_use]
    pub fn servers_for(&self, sql: &str) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                MockEvent::Execute { server, sql: s } | MockEvent::Query { server, sql: s }
                    if s == sql =>
                {
                    Some(server.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Raw statements (BEGIN/COMMIT/ROLLBACK/SET/session init), in order.
    #[must_use]
    pub fn raw_statements(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                MockEvent::Raw { sql, .. } => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn connect(&self, server: &ServerConfig) -> Result<Box<dyn Link>, SqlConduitError> {
        let refused = self
            .state
            .refused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&server.dsn);
        if refused {
            return Err(SqlConduitError::ConnectionError(format!(
                "connection refused by '{}'",
                server.dsn
            )));
        }
        self.state.record(MockEvent::Connect {
            server: server.dsn.clone(),
        });
        Ok(Box::new(MockLink {
            server: server.dsn.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockLink {
    server: String,
    state: Arc<MockState>,
}

#[async_trait]
impl Link for MockLink {
    fn driver_name(&self) -> &str {
        "mock"
    }

    async fn prepare(&mut self, sql: &str) -> Result<Box<dyn Statement>, DriverError> {
        self.state.record(MockEvent::Prepare {
            server: self.server.clone(),
            sql: sql.to_string(),
        });
        Ok(Box::new(MockStatement {
            server: self.server.clone(),
            sql: sql.to_string(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn exec_raw(&mut self, sql: &str) -> Result<(), DriverError> {
        self.state.record(MockEvent::Raw {
            server: self.server.clone(),
            sql: sql.to_string(),
        });
        // Raw statements (BEGIN, COMMIT, session init) answer their script
        // too, so transaction-control failures can be staged; unscripted ones
        // succeed.
        match self.state.next_outcome(sql) {
            MockOutcome::Fail(message) => Err(DriverError::new(message)),
            _ => Ok(()),
        }
    }
}

struct MockStatement {
    server: String,
    sql: String,
    state: Arc<MockState>,
}

impl MockStatement {
    fn outcome(&self, event: MockEvent) -> Result<MockOutcome, DriverError> {
        self.state.record(event);
        match self.state.next_outcome(&self.sql) {
            MockOutcome::Fail(message) => Err(DriverError::new(message)),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Statement for MockStatement {
    async fn execute(&mut self, _params: &[(ParamIndex, BoundParam)]) -> Result<u64, DriverError> {
        match self.outcome(MockEvent::Execute {
            server: self.server.clone(),
            sql: self.sql.clone(),
        })? {
            MockOutcome::Affected(n) => Ok(n),
            MockOutcome::Rows { rows, .. } => Ok(rows.len() as u64),
            MockOutcome::Fail(_) => unreachable!("Fail handled in outcome()"),
        }
    }

    async fn query(
        &mut self,
        _params: &[(ParamIndex, BoundParam)],
    ) -> Result<ResultSet, DriverError> {
        match self.outcome(MockEvent::Query {
            server: self.server.clone(),
            sql: self.sql.clone(),
        })? {
            MockOutcome::Rows { columns, rows } => {
                let columns = Arc::new(columns);
                let mut rs = ResultSet::with_capacity(rows.len());
                for values in rows {
                    rs.add_row(Row::new(Arc::clone(&columns), values));
                }
                Ok(rs)
            }
            MockOutcome::Affected(n) => {
                let mut rs = ResultSet::default();
                rs.rows_affected = n;
                Ok(rs)
            }
            MockOutcome::Fail(_) => unreachable!("Fail handled in outcome()"),
        }
    }
}

/// In-memory [`QueryCacheStore`] with hit/miss/write counters. Durations are
/// accepted but not expired; tests assert on negotiation, not on clocks.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryCacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueryCacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SqlConduitError> {
        let entry = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned();
        if entry.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(entry)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        duration: CacheDuration,
        _dependency: Option<&str>,
    ) -> Result<(), SqlConduitError> {
        if duration.is_disabled() {
            return Ok(());
        }
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
