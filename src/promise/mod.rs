//! Settle-once promises.
//!
//! A promise is created as a `(Promise, Settler)` pair: the promise is the
//! shared immutable half, the settler the one-shot sender. Settlement is
//! idempotent, handlers always dispatch through the next-tick queue (never
//! synchronously, even when registered after settlement), and a handler
//! that returns another promise makes the derived promise adopt that
//! outcome. Promises also implement `Future`, which is how fibers await
//! them.

mod cancel;
mod combinator;
mod mutex;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};
use crate::runtime::Handle;

pub use cancel::CancellablePromise;
pub use combinator::{TaskFn, all, any, batch, concurrent, race, timeout};
pub use mutex::{FiberMutex, MutexGuard};

pub(crate) use cancel::CancelShared;

enum State<T> {
    Pending,
    Fulfilled(T),
    Rejected(Error),
}

struct Inner<T: Clone + 'static> {
    handle: Handle,
    state: RefCell<State<T>>,
    handlers: RefCell<Vec<Box<dyn FnOnce(Result<T>)>>>,
    wakers: RefCell<Vec<Waker>>,
    cancel_root: RefCell<Option<std::rc::Weak<CancelShared>>>,
    settlers: Cell<usize>,
}

/// Schedule a handler on the next tick, converting the outcome to a
/// cancellation rejection if the chain's cancel root was cancelled. The
/// check runs at handler entry, so a root cancelled after settlement but
/// before dispatch still suppresses fulfillment handlers downstream.
fn dispatch<T: Clone + 'static>(
    inner: &Rc<Inner<T>>,
    handler: Box<dyn FnOnce(Result<T>)>,
    outcome: Result<T>,
) {
    let root = inner.cancel_root.borrow().clone();
    inner.handle.next_tick(move || {
        let outcome = match &root {
            Some(weak) if weak.upgrade().is_some_and(|r| r.is_cancelled()) => {
                Err(Error::Cancelled)
            }
            _ => outcome,
        };
        handler(outcome);
    });
}

fn settle_inner<T: Clone + 'static>(inner: &Rc<Inner<T>>, outcome: Result<T>) {
    {
        let mut state = inner.state.borrow_mut();
        if !matches!(*state, State::Pending) {
            return;
        }
        *state = match &outcome {
            Ok(value) => State::Fulfilled(value.clone()),
            Err(reason) => State::Rejected(reason.clone()),
        };
    }
    let handlers: Vec<_> = inner.handlers.borrow_mut().drain(..).collect();
    for handler in handlers {
        dispatch(inner, handler, outcome.clone());
    }
    let wakers: Vec<_> = inner.wakers.borrow_mut().drain(..).collect();
    for waker in wakers {
        waker.wake();
    }
}

/// The shared, immutable half of a settle-once future.
pub struct Promise<T: Clone + 'static> {
    inner: Rc<Inner<T>>,
}

impl<T: Clone + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    pub(crate) fn pending_on(handle: &Handle) -> (Promise<T>, Settler<T>) {
        let inner = Rc::new(Inner {
            handle: handle.clone(),
            state: RefCell::new(State::Pending),
            handlers: RefCell::new(Vec::new()),
            wakers: RefCell::new(Vec::new()),
            cancel_root: RefCell::new(None),
            settlers: Cell::new(1),
        });
        (
            Promise {
                inner: Rc::clone(&inner),
            },
            Settler { inner },
        )
    }

    /// An already-fulfilled promise. Handlers still run asynchronously.
    pub fn resolved(handle: &Handle, value: T) -> Promise<T> {
        let (promise, settler) = Promise::pending_on(handle);
        settler.resolve(value);
        promise
    }

    /// An already-rejected promise.
    pub fn rejected(handle: &Handle, reason: Error) -> Promise<T> {
        let (promise, settler) = Promise::pending_on(handle);
        settler.reject(reason);
        promise
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.inner.state.borrow(), State::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(*self.inner.state.borrow(), State::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(*self.inner.state.borrow(), State::Rejected(_))
    }

    /// The settled outcome, if any. Never blocks.
    pub fn try_result(&self) -> Option<Result<T>> {
        match &*self.inner.state.borrow() {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        }
    }

    pub(crate) fn handle(&self) -> Handle {
        self.inner.handle.clone()
    }

    /// Register a raw settlement observer. Runs on a later tick, exactly
    /// once, even when the promise is already settled.
    pub(crate) fn on_settle(&self, f: impl FnOnce(Result<T>) + 'static) {
        let snapshot = match &*self.inner.state.borrow() {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        };
        match snapshot {
            None => self.inner.handlers.borrow_mut().push(Box::new(f)),
            Some(outcome) => dispatch(&self.inner, Box::new(f), outcome),
        }
    }

    pub(crate) fn settle_now(&self, outcome: Result<T>) {
        settle_inner(&self.inner, outcome);
    }

    pub(crate) fn set_cancel_root(&self, root: std::rc::Weak<CancelShared>) {
        *self.inner.cancel_root.borrow_mut() = Some(root);
    }

    fn inherit_cancel_root<U: Clone + 'static>(&self, child: &Promise<U>) {
        let root = self.inner.cancel_root.borrow().clone();
        *child.inner.cancel_root.borrow_mut() = root;
    }

    /// Derive a promise by mapping the fulfillment value. Rejections pass
    /// through untouched.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let (next, settler) = Promise::pending_on(&self.inner.handle);
        self.inherit_cancel_root(&next);
        self.on_settle(move |outcome| match outcome {
            Ok(value) => settler.resolve(on_fulfilled(value)),
            Err(reason) => settler.reject(reason),
        });
        next
    }

    /// Derive a promise whose outcome is adopted from the promise returned
    /// by the handler.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Promise<U> + 'static,
    {
        let (next, settler) = Promise::pending_on(&self.inner.handle);
        self.inherit_cancel_root(&next);
        self.on_settle(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value).on_settle(move |adopted| settler.settle(adopted)),
            Err(reason) => settler.reject(reason),
        });
        next
    }

    /// Recover from a rejection. Fulfillment passes through untouched.
    pub fn catch<F>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Error) -> T + 'static,
    {
        let (next, settler) = Promise::pending_on(&self.inner.handle);
        self.inherit_cancel_root(&next);
        self.on_settle(move |outcome| match outcome {
            Ok(value) => settler.resolve(value),
            Err(reason) => settler.resolve(on_rejected(reason)),
        });
        next
    }

    /// Run a callback on any settlement. The outcome passes through
    /// unchanged unless the callback fails, in which case the derived
    /// promise rejects with that failure.
    pub fn finally<F>(&self, on_settled: F) -> Promise<T>
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        let (next, settler) = Promise::pending_on(&self.inner.handle);
        self.inherit_cancel_root(&next);
        self.on_settle(move |outcome| match on_settled() {
            Ok(()) => settler.settle(outcome),
            Err(reason) => settler.reject(reason),
        });
        next
    }
}

impl<T: Clone + 'static> Future for Promise<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let snapshot = match &*self.inner.state.borrow() {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        };
        match snapshot {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                self.inner.wakers.borrow_mut().push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// The one-shot sending half of a promise.
///
/// Cloneable; the first settlement wins and the rest are no-ops. If every
/// settler is dropped while the promise is still pending, the promise is
/// rejected with [`Error::Cancelled`] so no awaiter hangs forever.
pub struct Settler<T: Clone + 'static> {
    inner: Rc<Inner<T>>,
}

impl<T: Clone + 'static> Clone for Settler<T> {
    fn clone(&self) -> Self {
        self.inner.settlers.set(self.inner.settlers.get() + 1);
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> Drop for Settler<T> {
    fn drop(&mut self) {
        let remaining = self.inner.settlers.get().saturating_sub(1);
        self.inner.settlers.set(remaining);
        if remaining == 0 && matches!(*self.inner.state.borrow(), State::Pending) {
            settle_inner(&self.inner, Err(Error::Cancelled));
        }
    }
}

impl<T: Clone + 'static> Settler<T> {
    pub fn resolve(&self, value: T) {
        settle_inner(&self.inner, Ok(value));
    }

    pub fn reject(&self, reason: Error) {
        settle_inner(&self.inner, Err(reason));
    }

    pub fn settle(&self, outcome: Result<T>) {
        settle_inner(&self.inner, outcome);
    }

    pub fn promise(&self) -> Promise<T> {
        Promise {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Handle {
    /// A fresh pending promise with its settler.
    pub fn promise<T: Clone + 'static>(&self) -> (Promise<T>, Settler<T>) {
        Promise::pending_on(self)
    }
}
