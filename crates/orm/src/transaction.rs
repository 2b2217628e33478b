//! Transaction coordinator
//!
//! Wraps a backend transaction primitive in a strict state machine:
//! created → active → {committed, rolled-back}. Terminal states reject every
//! further operation with `TransactionFinished`, and the underlying
//! primitive is released exactly once regardless of whether the commit or
//! rollback call itself succeeded.

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::backends::{Adapter, AdapterTransaction};
use crate::error::{OrmError, OrmResult};

/// Isolation levels a caller may request. Backends that do not honour a
/// level accept it as a no-op; enforcement belongs to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL clause body for SET TRANSACTION ISOLATION LEVEL
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Lifecycle states of a transaction handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// A logical transaction bound to one backend primitive.
///
/// The handle serves sequential operations only; the physical connection is
/// single-stream and concurrent use is caller error, surfaced by the
/// backend rather than serialized here.
pub struct Transaction {
    inner: Option<Box<dyn AdapterTransaction>>,
    state: TransactionState,
    isolation: Option<IsolationLevel>,
}

impl Transaction {
    /// Acquire a connection from the adapter and issue BEGIN, with the
    /// isolation clause when requested.
    pub async fn setup(
        adapter: &dyn Adapter,
        isolation: Option<IsolationLevel>,
    ) -> OrmResult<Transaction> {
        debug!(?isolation, backend = %adapter.backend_type(), "beginning transaction");
        let inner = adapter.begin(isolation).await?;
        Ok(Transaction {
            inner: Some(inner),
            state: TransactionState::Active,
            isolation,
        })
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn is_finished(&self) -> bool {
        self.state != TransactionState::Active
    }

    fn take_active(&mut self, next: TransactionState) -> OrmResult<Box<dyn AdapterTransaction>> {
        if self.is_finished() {
            return Err(OrmError::TransactionFinished);
        }
        // The state flips before the backend call so the primitive is
        // released exactly once even if commit/rollback itself fails
        self.state = next;
        self.inner.take().ok_or(OrmError::TransactionFinished)
    }

    /// Commit. The primitive is consumed whether or not the backend commit
    /// succeeds; a failed commit leaves the handle finished.
    pub async fn commit(&mut self) -> OrmResult<()> {
        let mut inner = self.take_active(TransactionState::Committed)?;
        let result = inner.commit().await;
        if result.is_err() {
            warn!("transaction commit failed; connection released regardless");
        } else {
            debug!("transaction committed");
        }
        result
    }

    /// Roll back. Same release-once guarantee as [`Transaction::commit`].
    pub async fn rollback(&mut self) -> OrmResult<()> {
        let mut inner = self.take_active(TransactionState::RolledBack)?;
        let result = inner.rollback().await;
        if result.is_err() {
            warn!("transaction rollback failed; connection released regardless");
        } else {
            debug!("transaction rolled back");
        }
        result
    }

    /// Execute a statement on the bound connection (statement-oriented
    /// backends only).
    pub async fn execute(&mut self, sql: &str, params: &[JsonValue]) -> OrmResult<u64> {
        match self.inner.as_mut() {
            Some(inner) if self.state == TransactionState::Active => {
                inner.execute(sql, params).await
            }
            _ => Err(OrmError::TransactionFinished),
        }
    }

    /// Fetch rows on the bound connection
    pub async fn fetch(&mut self, sql: &str, params: &[JsonValue]) -> OrmResult<Vec<JsonValue>> {
        match self.inner.as_mut() {
            Some(inner) if self.state == TransactionState::Active => {
                inner.fetch(sql, params).await
            }
            _ => Err(OrmError::TransactionFinished),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.inner.is_some() && self.state == TransactionState::Active {
            // Cannot await in Drop; the primitive's own Drop rolls back
            warn!("transaction dropped without commit or rollback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_level_sql() {
        assert_eq!(IsolationLevel::ReadCommitted.as_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
    }
}
