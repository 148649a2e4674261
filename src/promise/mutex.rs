//! FIFO-fair async mutex for fibers.
//!
//! `lock()` is an awaitable; the guard releases on drop. Unlock hands
//! ownership directly to the head waiter - the lock is never returned to a
//! free state while waiters exist, so a later `lock()` cannot cut in.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct Waiter {
    granted: Cell<bool>,
    abandoned: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

#[derive(Default)]
struct MutexInner {
    locked: Cell<bool>,
    waiters: RefCell<VecDeque<Rc<Waiter>>>,
}

impl MutexInner {
    /// Hand the lock to the next live waiter, or free it.
    fn unlock(&self) {
        let next = {
            let mut waiters = self.waiters.borrow_mut();
            loop {
                match waiters.pop_front() {
                    Some(w) if w.abandoned.get() => {}
                    other => break other,
                }
            }
        };
        match next {
            Some(waiter) => {
                waiter.granted.set(true);
                if let Some(waker) = waiter.waker.borrow_mut().take() {
                    waker.wake();
                }
            }
            None => self.locked.set(false),
        }
    }
}

/// Async mutex with FIFO waiters. Single-threaded: not `Send`, guards are
/// held across awaits within one loop.
#[derive(Clone, Default)]
pub struct FiberMutex {
    inner: Rc<MutexInner>,
}

impl FiberMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the mutex. Grants are strictly in `lock()` call order.
    pub fn lock(&self) -> LockFuture {
        LockFuture {
            inner: Rc::clone(&self.inner),
            waiter: None,
            done: false,
        }
    }

    /// Acquire immediately if free; never queues.
    pub fn try_lock(&self) -> Option<MutexGuard> {
        if self.inner.locked.get() {
            None
        } else {
            self.inner.locked.set(true);
            Some(MutexGuard {
                inner: Rc::clone(&self.inner),
            })
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.locked.get()
    }
}

pub struct LockFuture {
    inner: Rc<MutexInner>,
    waiter: Option<Rc<Waiter>>,
    done: bool,
}

impl Future for LockFuture {
    type Output = MutexGuard;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(waiter) = &this.waiter {
            if waiter.granted.get() {
                // Ownership was handed to us by unlock(); locked stays set.
                this.done = true;
                return Poll::Ready(MutexGuard {
                    inner: Rc::clone(&this.inner),
                });
            }
            *waiter.waker.borrow_mut() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        if !this.inner.locked.get() {
            this.inner.locked.set(true);
            this.done = true;
            return Poll::Ready(MutexGuard {
                inner: Rc::clone(&this.inner),
            });
        }

        let waiter = Rc::new(Waiter {
            granted: Cell::new(false),
            abandoned: Cell::new(false),
            waker: RefCell::new(Some(cx.waker().clone())),
        });
        this.inner.waiters.borrow_mut().push_back(Rc::clone(&waiter));
        this.waiter = Some(waiter);
        Poll::Pending
    }
}

impl Drop for LockFuture {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(waiter) = self.waiter.take() {
            if waiter.granted.get() {
                // Granted but never observed: pass the lock along.
                self.inner.unlock();
            } else {
                waiter.abandoned.set(true);
            }
        }
    }
}

/// RAII lock ownership; releases (with direct handoff) on drop.
pub struct MutexGuard {
    inner: Rc<MutexInner>,
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        self.inner.unlock();
    }
}
