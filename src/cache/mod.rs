//! Query-result cache negotiation.
//!
//! The store itself (key -> bytes, expiry, invalidation) is an external
//! collaborator behind [`QueryCacheStore`]. This module owns the policy side:
//! the per-connection scope stack, the duration encoding, and cache-key
//! derivation for commands.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SqlConduitError;
use crate::types::FetchMethod;

/// External cache store contract. Read failures are treated as misses and
/// write failures are logged and dropped by the caller; the store never gets
/// to abort query execution.
#[async_trait]
pub trait QueryCacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SqlConduitError>;

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        duration: CacheDuration,
        dependency: Option<&str>,
    ) -> Result<(), SqlConduitError>;
}

/// Cache lifetime. The source encoding maps 0 seconds to "never expire" and
/// any negative duration to "disabled for this call".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheDuration {
    Seconds(u64),
    Forever,
    Disabled,
}

impl CacheDuration {
    /// Decode the source's signed-seconds convention.
    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            0 => CacheDuration::Forever,
            s if s < 0 => CacheDuration::Disabled,
            s => CacheDuration::Seconds(s as u64),
        }
    }

    #[must_use]
    pub fn is_disabled(self) -> bool {
        matches!(self, CacheDuration::Disabled)
    }
}

/// One "use cache" scope: a duration and an opaque invalidation token.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheScope {
    pub duration: CacheDuration,
    pub dependency: Option<String>,
}

/// Per-connection stack of nested cache scopes. Only the top of the stack is
/// consulted; a `Disabled` scope on top suppresses caching even when longer
/// scopes sit below it.
#[derive(Debug, Clone, Default)]
pub struct CacheScopeStack {
    scopes: Vec<CacheScope>,
}

impl CacheScopeStack {
    pub fn push(&mut self, duration: CacheDuration, dependency: Option<String>) {
        self.scopes.push(CacheScope {
            duration,
            dependency,
        });
    }

    pub fn pop(&mut self) -> Option<CacheScope> {
        self.scopes.pop()
    }

    #[must_use]
    pub fn top(&self) -> Option<&CacheScope> {
        self.scopes.last()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Resolve the effective policy for one call. Explicit per-command values
    /// win over the active scope, field by field; no scope and no explicit
    /// duration means "no caching".
    #[must_use]
    pub fn resolve(
        &self,
        requested_duration: Option<CacheDuration>,
        requested_dependency: Option<&str>,
    ) -> Option<CachePolicy> {
        let top = self.top();
        let duration = requested_duration.or_else(|| top.map(|s| s.duration))?;
        if duration.is_disabled() {
            return None;
        }
        let dependency = requested_dependency
            .map(str::to_string)
            .or_else(|| top.and_then(|s| s.dependency.clone()));
        Some(CachePolicy {
            duration,
            dependency,
        })
    }
}

/// Effective caching decision for one command invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub duration: CacheDuration,
    pub dependency: Option<String>,
}

/// Derive the cache key for a command invocation.
///
/// Components are joined with an unprintable separator; every component is
/// derived from configuration or SQL text, so the key is stable across
/// process restarts for the same logical query, except the fingerprint which
/// is meant to rotate with the physical link.
#[must_use]
pub fn command_cache_key(
    method: FetchMethod,
    fetch_column: usize,
    dsn_identity: &str,
    username: &str,
    fingerprint: &str,
    raw_sql: &str,
) -> String {
    [
        "sql-conduit.command",
        method.tag(),
        &fetch_column.to_string(),
        dsn_identity,
        username,
        fingerprint,
        raw_sql,
    ]
    .join("\u{1f}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stack_without_override_means_no_cache() {
        let stack = CacheScopeStack::default();
        assert!(stack.resolve(None, None).is_none());
    }

    #[test]
    fn explicit_duration_overrides_active_scope() {
        let mut stack = CacheScopeStack::default();
        stack.push(CacheDuration::Seconds(300), Some("dep-a".into()));
        let policy = stack
            .resolve(Some(CacheDuration::Seconds(60)), None)
            .unwrap();
        assert_eq!(policy.duration, CacheDuration::Seconds(60));
        // Dependency still inherited from the scope when not overridden.
        assert_eq!(policy.dependency.as_deref(), Some("dep-a"));
    }

    #[test]
    fn disabled_scope_on_top_suppresses_nested_longer_scopes() {
        let mut stack = CacheScopeStack::default();
        stack.push(CacheDuration::Seconds(3600), None);
        stack.push(CacheDuration::Disabled, None);
        assert!(stack.resolve(None, None).is_none());

        // Popping the disabling scope restores the outer one.
        stack.pop();
        let policy = stack.resolve(None, None).unwrap();
        assert_eq!(policy.duration, CacheDuration::Seconds(3600));
    }

    #[test]
    fn explicit_disabled_wins_over_scope() {
        let mut stack = CacheScopeStack::default();
        stack.push(CacheDuration::Seconds(60), None);
        assert!(stack.resolve(Some(CacheDuration::Disabled), None).is_none());
    }

    #[test]
    fn signed_seconds_convention() {
        assert_eq!(CacheDuration::from_secs(0), CacheDuration::Forever);
        assert_eq!(CacheDuration::from_secs(-1), CacheDuration::Disabled);
        assert_eq!(CacheDuration::from_secs(60), CacheDuration::Seconds(60));
    }

    #[test]
    fn key_varies_with_sql_and_fingerprint() {
        let a = command_cache_key(
            FetchMethod::All,
            0,
            "mysql://db:3306/app",
            "app",
            "fp-1",
            "SELECT * FROM t WHERE id=5",
        );
        let b = command_cache_key(
            FetchMethod::All,
            0,
            "mysql://db:3306/app",
            "app",
            "fp-1",
            "SELECT * FROM t WHERE id=6",
        );
        let c = command_cache_key(
            FetchMethod::All,
            0,
            "mysql://db:3306/app",
            "app",
            "fp-2",
            "SELECT * FROM t WHERE id=5",
        );
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
