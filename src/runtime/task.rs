//! Fiber manager.
//!
//! A fiber is a spawned local future. Suspension happens at `.await` on a
//! pending promise or readiness future; the waker pushes the fiber's id
//! onto the shared run queue and the loop polls it again on its next
//! iteration. Futures are taken out of their slot while polled so a fiber
//! may freely spawn, wake, or cancel other fibers from inside `poll`.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use slab::Slab;

pub(crate) type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Queue of fiber ids ready to be polled. Shared with wakers, which must be
/// `Send + Sync`, hence the mutex; contention is nil on a single thread.
#[derive(Default)]
pub(crate) struct RunQueue {
    queue: Mutex<VecDeque<usize>>,
}

impl RunQueue {
    pub(crate) fn push(&self, id: usize) {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(id);
        }
    }

    pub(crate) fn pop(&self) -> Option<usize> {
        self.queue.lock().ok().and_then(|mut q| q.pop_front())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }
}

struct FiberWaker {
    id: usize,
    queue: Arc<RunQueue>,
}

impl Wake for FiberWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.id);
    }
}

/// Slab of live fibers. A slot holds `None` while its future is out being
/// polled.
#[derive(Default)]
pub(crate) struct TaskSet {
    slots: Slab<Option<LocalFuture>>,
}

impl TaskSet {
    pub(crate) fn insert(&mut self, fut: LocalFuture) -> usize {
        self.slots.insert(Some(fut))
    }

    pub(crate) fn take(&mut self, id: usize) -> Option<LocalFuture> {
        self.slots.get_mut(id).and_then(Option::take)
    }

    pub(crate) fn restore(&mut self, id: usize, fut: LocalFuture) {
        if let Some(slot) = self.slots.get_mut(id) {
            *slot = Some(fut);
        }
    }

    pub(crate) fn complete(&mut self, id: usize) {
        if self.slots.contains(id) {
            self.slots.remove(id);
        }
    }

    /// Detach a fiber without polling it to completion. The future is
    /// returned so the caller can drop it after releasing the borrow of the
    /// task set (its destructors may touch the runtime).
    pub(crate) fn cancel(&mut self, id: usize) -> Option<LocalFuture> {
        if self.slots.contains(id) {
            self.slots.remove(id)
        } else {
            None
        }
    }

    /// Remove every fiber, returning the futures so the caller can drop
    /// them with no borrow of the task set outstanding.
    pub(crate) fn drain_all(&mut self) -> Vec<LocalFuture> {
        self.slots.drain().flatten().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Poll one runnable fiber. Returns `false` when the run queue is empty.
pub(crate) fn poll_one(tasks: &std::cell::RefCell<TaskSet>, queue: &Arc<RunQueue>) -> bool {
    let Some(id) = queue.pop() else {
        return false;
    };
    // A stale wake for a finished fiber, or a duplicate wake while the
    // future is already out being polled.
    let Some(mut fut) = tasks.borrow_mut().take(id) else {
        return true;
    };
    let waker = Waker::from(Arc::new(FiberWaker {
        id,
        queue: Arc::clone(queue),
    }));
    let mut cx = Context::from_waker(&waker);
    match catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
        Ok(Poll::Ready(())) => tasks.borrow_mut().complete(id),
        Ok(Poll::Pending) => tasks.borrow_mut().restore(id, fut),
        Err(payload) => {
            let msg = super::tick::panic_message(&payload);
            tracing::error!(fiber = id, panic = %msg, "fiber panicked; dropping it");
            tasks.borrow_mut().complete(id);
        }
    }
    true
}
