//! Cancellable promises.
//!
//! A cancellable promise is a promise plus a cancel flag, an optional
//! cancel handler, and an optional timer handle. Derived promises carry a
//! weak back-reference to the cancel root; when the root is cancelled,
//! handlers of not-yet-dispatched chains observe a cancellation rejection
//! instead of their fulfillment value, so downstream fulfillment handlers
//! are skipped. The back-reference is weak on purpose: no strong cycles.

use std::cell::{Cell, RefCell};
use std::ops::Deref;
use std::rc::Rc;
use std::time::Duration;

use crate::error::Error;
use crate::runtime::{Handle, TimerHandle};

use super::{Promise, Settler};

pub(crate) struct CancelShared {
    cancelled: Cell<bool>,
    on_cancel: RefCell<Option<Box<dyn FnOnce()>>>,
    timer: RefCell<Option<TimerHandle>>,
}

impl CancelShared {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// A promise that can be cancelled before it settles.
///
/// Cancellation rejects with the canonical [`Error::Cancelled`] reason,
/// runs the cancel handler exactly once on the next tick, and cancels the
/// associated timer, if any.
pub struct CancellablePromise<T: Clone + 'static> {
    promise: Promise<T>,
    shared: Rc<CancelShared>,
}

impl<T: Clone + 'static> Deref for CancellablePromise<T> {
    type Target = Promise<T>;

    fn deref(&self) -> &Self::Target {
        &self.promise
    }
}

impl<T: Clone + 'static> CancellablePromise<T> {
    pub fn pending_on(handle: &Handle) -> (Self, Settler<T>) {
        Self::with_cancel_handler_opt(handle, None)
    }

    /// A pending cancellable promise whose handler runs if (and only if)
    /// the promise is cancelled.
    pub fn with_cancel_handler(
        handle: &Handle,
        on_cancel: impl FnOnce() + 'static,
    ) -> (Self, Settler<T>) {
        Self::with_cancel_handler_opt(handle, Some(Box::new(on_cancel)))
    }

    fn with_cancel_handler_opt(
        handle: &Handle,
        on_cancel: Option<Box<dyn FnOnce()>>,
    ) -> (Self, Settler<T>) {
        let (promise, settler) = Promise::pending_on(handle);
        let shared = Rc::new(CancelShared {
            cancelled: Cell::new(false),
            on_cancel: RefCell::new(on_cancel),
            timer: RefCell::new(None),
        });
        promise.set_cancel_root(Rc::downgrade(&shared));
        (Self { promise, shared }, settler)
    }

    /// Tie a timer to this promise; cancellation also cancels the timer.
    pub(crate) fn attach_timer(&self, timer: TimerHandle) {
        *self.shared.timer.borrow_mut() = Some(timer);
    }

    /// Cancel the promise. Returns `false` if it was already settled or
    /// already cancelled.
    pub fn cancel(&self) -> bool {
        if self.shared.cancelled.get() || !self.promise.is_pending() {
            return false;
        }
        self.shared.cancelled.set(true);
        if let Some(timer) = self.shared.timer.borrow_mut().take() {
            timer.cancel();
        }
        if let Some(on_cancel) = self.shared.on_cancel.borrow_mut().take() {
            self.promise.handle().next_tick(on_cancel);
        }
        self.promise.settle_now(Err(Error::Cancelled));
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.get()
    }

    /// The plain promise half, for chaining or storing. Chains derived from
    /// it keep the weak back-reference to this cancel root.
    pub fn promise(&self) -> Promise<T> {
        self.promise.clone()
    }
}

impl Handle {
    /// Async sleep: a cancellable promise resolving after `delay`.
    pub fn delay(&self, delay: Duration) -> CancellablePromise<()> {
        let (sleep, settler) = CancellablePromise::pending_on(self);
        let timer = self.set_timeout(delay, move || settler.resolve(()));
        sleep.attach_timer(timer);
        sleep
    }
}
