//! Convenience re-exports for the common surface.
//!
//! ```rust
//! use sql_conduit::prelude::*;
//! ```

pub use crate::cache::{CacheDuration, CachePolicy, QueryCacheStore};
pub use crate::command::Command;
pub use crate::connection::{ConnFuture, Connection, ConnectionConfig, Route, ServerConfig};
pub use crate::context::DbContext;
pub use crate::driver::{AnsiDialect, Dialect, Driver, Dsn, Link, Statement};
pub use crate::error::{DriverError, SqlConduitError};
pub use crate::query::{AnsiQueryBuilder, Query, QueryBuilder};
pub use crate::results::{ResultSet, Row};
pub use crate::retry::{ErrorClass, RetryPolicy, TransientMatcher};
pub use crate::transaction::{Transaction, TransactionToken};
pub use crate::types::{FetchMethod, IsolationLevel, ParamIndex, RowValues};
