//! Binary-protocol MySQL client: connection, prepared statements,
//! transactions, and a bounded connection pool, all driven by the event
//! loop.

mod conn;
mod pool;
mod stmt;
mod transaction;

pub use conn::Conn;
pub use pool::{Pool, PooledConn, PooledStatement};
pub use stmt::Statement;
pub use transaction::{IsolationLevel, Transaction};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
}
