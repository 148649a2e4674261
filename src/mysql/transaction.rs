//! Transactions over pooled connections.

use std::str::FromStr;

use crate::error::{Error, Result};
use crate::row::QueryOutcome;

use super::pool::PooledConn;
use super::stmt::Statement;

/// The closed set of isolation levels; anything else is rejected before it
/// reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            other => Err(Error::InvalidIsolationLevel(other.to_string())),
        }
    }
}

/// A transaction that pins its connection out of the pool.
///
/// The connection services every command of this transaction until
/// `commit` or `rollback`, which release it back exactly once. Dropping an
/// unfinished transaction rolls back on a fiber and then releases.
pub struct Transaction {
    pooled: Option<PooledConn>,
}

impl Transaction {
    pub(crate) fn new(pooled: PooledConn) -> Self {
        Self {
            pooled: Some(pooled),
        }
    }

    fn conn(&self) -> &PooledConn {
        // Invariant: `pooled` is Some until commit/rollback consume self.
        self.pooled
            .as_ref()
            .unwrap_or_else(|| unreachable!("transaction used after completion"))
    }

    pub async fn query(&self, sql: &str) -> Result<QueryOutcome> {
        self.conn().query(sql).await
    }

    pub async fn query_drop(&self, sql: &str) -> Result<()> {
        self.conn().query_drop(sql).await
    }

    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        self.conn().prepare(sql).await
    }

    pub async fn savepoint(&self, name: &str) -> Result<()> {
        self.conn().savepoint(name).await
    }

    pub async fn rollback_to(&self, name: &str) -> Result<()> {
        self.conn().rollback_to(name).await
    }

    pub async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.conn().release_savepoint(name).await
    }

    pub async fn commit(mut self) -> Result<()> {
        if let Some(pooled) = self.pooled.take() {
            pooled.commit().await?;
            pooled.release();
        }
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        if let Some(pooled) = self.pooled.take() {
            pooled.rollback().await?;
            pooled.release();
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let Some(pooled) = self.pooled.take() else {
            return;
        };
        // Not committed: roll back off to a fiber, then let the pooled
        // guard release the connection.
        let handle = pooled.handle();
        let promise = handle.spawn(async move {
            if let Err(e) = pooled.rollback().await {
                tracing::warn!(error = %e, "implicit rollback failed");
            }
            pooled.release();
            Ok(())
        });
        drop(promise);
    }
}
