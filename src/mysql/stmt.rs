//! Prepared statements.

use std::cell::Cell;

use crate::error::Result;
use crate::row::QueryOutcome;
use crate::value::Param;

use super::conn::Conn;

/// A server-side prepared statement bound to its connection.
///
/// Dropping a statement without calling [`Statement::close`] schedules a
/// best-effort COM_STMT_CLOSE so server resources are not leaked.
pub struct Statement {
    conn: Conn,
    statement_id: u32,
    param_count: u16,
    column_count: u16,
    closed: Cell<bool>,
}

impl Statement {
    pub(crate) fn new(conn: Conn, statement_id: u32, param_count: u16, column_count: u16) -> Self {
        Self {
            conn,
            statement_id,
            param_count,
            column_count,
            closed: Cell::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.statement_id
    }

    pub fn param_count(&self) -> u16 {
        self.param_count
    }

    pub fn column_count(&self) -> u16 {
        self.column_count
    }

    /// Execute with the given parameters (binary protocol). A parameter
    /// count mismatch fails before anything is sent.
    pub async fn execute(&self, params: &[Param]) -> Result<QueryOutcome> {
        self.conn
            .execute_statement(self.statement_id, self.param_count, params)
            .await
    }

    /// Discard server-side statement state (COM_STMT_RESET).
    pub async fn reset(&self) -> Result<()> {
        self.conn.reset_statement(self.statement_id).await
    }

    /// Release the server-side statement. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.replace(true) {
            return Ok(());
        }
        self.conn.close_statement(self.statement_id).await
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        if self.closed.get() || self.conn.is_broken() {
            return;
        }
        let conn = self.conn.clone();
        let statement_id = self.statement_id;
        let promise = self.conn.handle().spawn(async move {
            conn.close_statement(statement_id).await.map_err(|e| {
                tracing::warn!(statement_id, error = %e, "statement close failed");
                e
            })
        });
        drop(promise);
    }
}
