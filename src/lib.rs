//! Resilient database access layer.
//!
//! Turns a logical SQL operation into a correctly-routed, transiently
//! fault-tolerant, optionally-cached execution against one of several
//! physical links (a master and zero or more read-only slaves), while
//! respecting transaction boundaries that may span nested callers.
//!
//! The physical protocol client sits behind the [`driver`] traits; this
//! crate owns routing, the bounded reconnect retry, nesting-safe
//! transactions, and the query-cache negotiation stack.

pub mod cache;
pub mod command;
pub mod connection;
pub mod context;
pub mod driver;
pub mod error;
pub mod query;
pub mod results;
pub mod retry;
pub mod transaction;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod mock;

pub mod prelude;

pub use cache::{CacheDuration, QueryCacheStore};
pub use command::Command;
pub use connection::{Connection, ConnectionConfig, ServerConfig};
pub use context::DbContext;
pub use error::SqlConduitError;
pub use query::Query;
pub use results::{ResultSet, Row};
pub use retry::{RetryPolicy, TransientMatcher};
pub use types::{IsolationLevel, RowValues};
