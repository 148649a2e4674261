//! Bounded connection pool with FIFO waiters.
//!
//! `get` pops an idle connection, dials a new one while under capacity, or
//! queues the caller. A released connection is reset and health-checked
//! first; a live one goes directly to the head waiter (never past it into
//! the idle queue), a dead one is dropped and, if anyone is waiting, a
//! replacement dial starts. Single-threaded by construction: the state is
//! only ever touched from loop callbacks and fibers.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ops::Deref;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::promise::Settler;
use crate::runtime::Handle;

use super::conn::Conn;
use super::stmt::Statement;
use super::transaction::{IsolationLevel, Transaction};
use super::PoolStats;

struct PoolInner {
    handle: Handle,
    opts: Opts,
    max_size: usize,
    idle: RefCell<VecDeque<Conn>>,
    waiters: RefCell<VecDeque<Settler<Conn>>>,
    active: Cell<usize>,
    closed: Cell<bool>,
}

#[derive(Clone)]
pub struct Pool {
    inner: Rc<PoolInner>,
}

impl Pool {
    pub fn new(handle: &Handle, opts: Opts, max_size: usize) -> Self {
        Self {
            inner: Rc::new(PoolInner {
                handle: handle.clone(),
                opts,
                max_size: max_size.max(1),
                idle: RefCell::new(VecDeque::new()),
                waiters: RefCell::new(VecDeque::new()),
                active: Cell::new(0),
                closed: Cell::new(false),
            }),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_size: self.inner.max_size,
            active: self.inner.active.get(),
            idle: self.inner.idle.borrow().len(),
            waiting: self.inner.waiters.borrow().len(),
        }
    }

    /// Check a connection out of the pool. Suspends when the pool is at
    /// capacity; waiters are served strictly in arrival order.
    pub async fn get(&self) -> Result<PooledConn> {
        let conn = self.acquire().await?;
        Ok(PooledConn {
            pool: self.clone(),
            conn,
            released: Cell::new(false),
        })
    }

    async fn acquire(&self) -> Result<Conn> {
        let inner = &self.inner;
        if inner.closed.get() {
            return Err(Error::PoolClosed);
        }

        if let Some(conn) = inner.idle.borrow_mut().pop_front() {
            tracing::trace!("pool: reusing idle connection");
            return Ok(conn);
        }

        if inner.active.get() < inner.max_size {
            // The slot is claimed before the dial so concurrent getters
            // cannot overshoot max_size.
            inner.active.set(inner.active.get() + 1);
            match Conn::connect(&inner.handle, inner.opts.clone()).await {
                Ok(conn) => {
                    tracing::debug!(active = inner.active.get(), "pool: dialed connection");
                    return Ok(conn);
                }
                Err(e) => {
                    inner.active.set(inner.active.get() - 1);
                    return Err(e);
                }
            }
        }

        tracing::trace!("pool: at capacity, queueing waiter");
        let (promise, settler) = inner.handle.promise::<Conn>();
        inner.waiters.borrow_mut().push_back(settler);
        promise.await
    }

    /// Return a connection to the pool. The health check and state reset
    /// run on a fiber; the caller does not wait for them.
    pub fn release(&self, conn: Conn) {
        if self.inner.closed.get() {
            self.discard(conn);
            return;
        }
        let pool = self.clone();
        let promise = self.inner.handle.spawn(async move {
            let healthy =
                !conn.is_broken() && conn.reset().await.is_ok() && conn.ping().await.is_ok();
            if healthy {
                pool.hand_off(conn);
            } else {
                tracing::debug!("pool: dropping dead connection");
                pool.drop_dead(conn);
            }
            Ok(())
        });
        drop(promise);
    }

    /// Give a live connection to the head waiter, or idle it.
    fn hand_off(&self, conn: Conn) {
        let inner = &self.inner;
        if inner.closed.get() {
            self.discard(conn);
            return;
        }
        let waiter = inner.waiters.borrow_mut().pop_front();
        match waiter {
            Some(settler) => settler.resolve(conn),
            None => inner.idle.borrow_mut().push_back(conn),
        }
    }

    /// Drop a dead connection; dial a replacement if someone is waiting.
    fn drop_dead(&self, conn: Conn) {
        let inner = &self.inner;
        inner.active.set(inner.active.get().saturating_sub(1));
        drop(conn);

        let wants_replacement = !inner.waiters.borrow().is_empty()
            && inner.active.get() < inner.max_size
            && !inner.closed.get();
        if !wants_replacement {
            return;
        }
        inner.active.set(inner.active.get() + 1);
        let pool = self.clone();
        let promise = inner.handle.spawn(async move {
            match Conn::connect(&pool.inner.handle, pool.inner.opts.clone()).await {
                Ok(conn) => pool.hand_off(conn),
                Err(e) => {
                    pool.inner
                        .active
                        .set(pool.inner.active.get().saturating_sub(1));
                    // The head waiter gets the dial failure instead of
                    // hanging forever.
                    let waiter = pool.inner.waiters.borrow_mut().pop_front();
                    if let Some(settler) = waiter {
                        settler.reject(e);
                    }
                }
            }
            Ok(())
        });
        drop(promise);
    }

    fn discard(&self, conn: Conn) {
        self.inner
            .active
            .set(self.inner.active.get().saturating_sub(1));
        let promise = self.inner.handle.spawn(async move {
            let _ = conn.quit().await;
            Ok(())
        });
        drop(promise);
    }

    /// Shut the pool down: quit idle connections and reject every pending
    /// waiter. Connections currently checked out are quit on release.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        tracing::debug!("pool: closing");
        let idle: Vec<Conn> = self.inner.idle.borrow_mut().drain(..).collect();
        for conn in idle {
            self.discard(conn);
        }
        let waiters: Vec<_> = self.inner.waiters.borrow_mut().drain(..).collect();
        for settler in waiters {
            settler.reject(Error::PoolClosed);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Begin a transaction on a dedicated connection. The connection stays
    /// out of the pool until the transaction finishes.
    pub async fn begin(&self, level: IsolationLevel) -> Result<Transaction> {
        let pooled = self.get().await?;
        pooled.begin_transaction(level).await?;
        Ok(Transaction::new(pooled))
    }

    /// Prepare a statement on a dedicated connection, held out of the pool
    /// until the statement is closed.
    pub async fn prepare(&self, sql: &str) -> Result<PooledStatement> {
        let pooled = self.get().await?;
        let statement = pooled.prepare(sql).await?;
        Ok(PooledStatement {
            statement,
            pooled: Some(pooled),
        })
    }
}

/// A checked-out connection. Dereferences to [`Conn`]; returns itself to
/// the pool on [`release`](PooledConn::release) or drop, exactly once.
pub struct PooledConn {
    pool: Pool,
    conn: Conn,
    released: Cell<bool>,
}

impl Deref for PooledConn {
    type Target = Conn;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl PooledConn {
    /// Hand the connection back. Idempotent; the drop guard uses the same
    /// path.
    pub fn release(&self) {
        if self.released.replace(true) {
            return;
        }
        self.pool.release(self.conn.clone());
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.release();
    }
}

/// A prepared statement pinned to its checked-out connection.
pub struct PooledStatement {
    statement: Statement,
    pooled: Option<PooledConn>,
}

impl PooledStatement {
    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    pub async fn execute(&self, params: &[crate::value::Param]) -> Result<crate::row::QueryOutcome> {
        self.statement.execute(params).await
    }

    /// Close the server-side statement and release the connection.
    pub async fn close(mut self) -> Result<()> {
        let result = self.statement.close().await;
        if let Some(pooled) = self.pooled.take() {
            pooled.release();
        }
        result
    }
}

impl Drop for PooledStatement {
    fn drop(&mut self) {
        // Statement's own drop schedules the COM_STMT_CLOSE; the pooled
        // guard (if still held) releases the connection afterwards.
        if let Some(pooled) = self.pooled.take() {
            pooled.release();
        }
    }
}
