//! Nesting-safe transaction state.
//!
//! A physical transaction is opened once; nested `begin_transaction` calls
//! only bump the level counter. Commit and rollback are guarded by a
//! [`TransactionToken`]: the physical COMMIT/ROLLBACK happens only when the
//! finalizing caller is the one that opened the level it is finalizing, and
//! only at level 1 does anything hit the wire.

use tracing::warn;

use crate::types::IsolationLevel;

/// State of one physical transaction on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    level: u32,
    isolation: Option<IsolationLevel>,
    active: bool,
}

impl Transaction {
    pub(crate) fn new(isolation: Option<IsolationLevel>) -> Self {
        Self {
            level: 1,
            isolation,
            active: true,
        }
    }

    /// Nesting depth; 1 is the outermost level.
    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    #[must_use]
    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Enter a nested level. A different isolation level requested by an
    /// inner scope is ignored and logged; drivers cannot change isolation
    /// mid-transaction.
    pub(crate) fn begin_nested(&mut self, requested: Option<IsolationLevel>) -> TransactionToken {
        if let Some(requested) = requested
            && Some(requested) != self.isolation
        {
            warn!(
                current = ?self.isolation,
                requested = ?requested,
                "isolation level change requested inside an active transaction; ignored"
            );
        }
        self.level += 1;
        TransactionToken { level: self.level }
    }

    /// Whether a finalize call holding `token` may take effect now.
    #[must_use]
    pub(crate) fn may_finalize(&self, token: TransactionToken) -> bool {
        self.active && self.level == token.level
    }

    /// Leave one level; returns true when this was the outermost level and
    /// the physical COMMIT/ROLLBACK must be issued.
    pub(crate) fn leave_level(&mut self) -> bool {
        if self.level == 1 {
            self.active = false;
            true
        } else {
            self.level -= 1;
            false
        }
    }
}

/// Capability to finalize the transaction level it was minted at. `Copy` so
/// callers can hold it across arbitrary control flow; it grants nothing once
/// the level has moved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionToken {
    level: u32,
}

impl TransactionToken {
    pub(crate) fn outermost() -> Self {
        Self { level: 1 }
    }

    #[must_use]
    pub fn level(self) -> u32 {
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_begin_bumps_level_and_tokens_guard_it() {
        let mut tx = Transaction::new(None);
        let outer = TransactionToken::outermost();
        assert_eq!(tx.level(), 1);

        let inner = tx.begin_nested(None);
        assert_eq!(tx.level(), 2);

        // Outer token cannot finalize while the inner level is open.
        assert!(!tx.may_finalize(outer));
        assert!(tx.may_finalize(inner));

        // Inner finalize is logical only.
        assert!(!tx.leave_level());
        assert_eq!(tx.level(), 1);

        // Now the outer token finalizes physically.
        assert!(tx.may_finalize(outer));
        assert!(tx.leave_level());
        assert!(!tx.is_active());
        assert!(!tx.may_finalize(outer));
    }

    #[test]
    fn inner_isolation_request_is_ignored() {
        let mut tx = Transaction::new(Some(IsolationLevel::ReadCommitted));
        tx.begin_nested(Some(IsolationLevel::Serializable));
        assert_eq!(tx.isolation(), Some(IsolationLevel::ReadCommitted));
    }
}
