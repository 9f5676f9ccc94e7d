//! Transient-failure classification and the retry budget.
//!
//! Classification is a data-driven matcher: an ordered list of lowercase
//! substrings checked against the native error message, first match wins.
//! Operators can extend the list at runtime without touching retry logic,
//! and the whole strategy sits behind [`TransientMatcher::classify`] so it
//! can be swapped for structured error codes later.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Outcome of classifying an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The physical link died; the statement itself was never the problem.
    /// Worth a close/reopen/retry cycle.
    Transient,
    /// Everything else (syntax errors, constraint violations, statement-level
    /// deadlocks). Never retried.
    Fatal,
}

/// Ordered list of transient-error signatures.
#[derive(Debug, Clone)]
pub struct TransientMatcher {
    signatures: Vec<String>,
}

impl Default for TransientMatcher {
    fn default() -> Self {
        let signatures = [
            "server has gone away",
            "no connection to the server",
            "lost connection",
            "is dead or not enabled",
            "error while sending",
            "decryption failed or bad record mac",
            "server closed the connection unexpectedly",
            "ssl connection has been closed unexpectedly",
            "error writing data to the connection",
            "resource deadlock avoided",
            "broken pipe",
            "connection reset by peer",
            "connection refused",
            "connection timed out",
            "connection was killed",
            "physical connection is not usable",
            "packets out of order",
            "communication link failure",
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        Self { signatures }
    }
}

impl TransientMatcher {
    /// A matcher that treats every failure as fatal.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            signatures: Vec::new(),
        }
    }

    /// Append a signature (checked after all existing ones).
    pub fn add(&mut self, signature: impl Into<String>) -> &mut Self {
        self.signatures.push(signature.into().to_lowercase());
        self
    }

    /// Insert a signature ahead of all existing ones.
    pub fn prepend(&mut self, signature: impl Into<String>) -> &mut Self {
        self.signatures.insert(0, signature.into().to_lowercase());
        self
    }

    #[must_use]
    pub fn signatures(&self) -> &[String] {
        &self.signatures
    }

    /// Classify a native error message. First matching signature wins.
    #[must_use]
    pub fn classify(&self, message: &str) -> ErrorClass {
        let message = message.to_lowercase();
        if self.signatures.iter().any(|sig| message.contains(sig)) {
            ErrorClass::Transient
        } else {
            ErrorClass::Fatal
        }
    }
}

/// Bounds for the reconnect loop inside command execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total physical attempts per logical execution, including the first.
    pub max_attempts: u32,
    /// Pause between closing a dead link and reopening it, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 0,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}
