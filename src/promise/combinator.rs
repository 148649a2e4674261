//! Collection combinators: `all`, `race`, `any`, `timeout`, `concurrent`,
//! `batch`.
//!
//! All of them take the loop handle explicitly (no ambient singleton) and
//! settle through ordinary promise dispatch, so the usual ordering rules
//! apply.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::error::Error;
use crate::runtime::Handle;

use super::{Promise, Settler};

/// A deferred unit of work for [`concurrent`] and [`batch`]: invoked at
/// most once, when a concurrency slot frees up.
pub type TaskFn<T> = Box<dyn FnOnce() -> Promise<T>>;

/// Fulfills with every value (input order preserved) once all inputs
/// fulfill; rejects on the first rejection.
pub fn all<T: Clone + 'static>(handle: &Handle, promises: Vec<Promise<T>>) -> Promise<Vec<T>> {
    let (out, settler) = Promise::pending_on(handle);
    let n = promises.len();
    if n == 0 {
        settler.resolve(Vec::new());
        return out;
    }
    let slots: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new((0..n).map(|_| None).collect()));
    let remaining = Rc::new(std::cell::Cell::new(n));
    for (index, promise) in promises.into_iter().enumerate() {
        let slots = Rc::clone(&slots);
        let remaining = Rc::clone(&remaining);
        let settler = settler.clone();
        promise.on_settle(move |outcome| match outcome {
            Ok(value) => {
                slots.borrow_mut()[index] = Some(value);
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    let values = slots.borrow_mut().iter_mut().filter_map(Option::take).collect();
                    settler.resolve(values);
                }
            }
            Err(reason) => settler.reject(reason),
        });
    }
    out
}

/// Settles with the first input to settle, value or rejection.
pub fn race<T: Clone + 'static>(handle: &Handle, promises: Vec<Promise<T>>) -> Promise<T> {
    let (out, settler) = Promise::pending_on(handle);
    for promise in promises {
        let settler = settler.clone();
        promise.on_settle(move |outcome| settler.settle(outcome));
    }
    out
}

/// Fulfills with the first fulfillment; rejects only once every input has
/// rejected.
pub fn any<T: Clone + 'static>(handle: &Handle, promises: Vec<Promise<T>>) -> Promise<T> {
    let (out, settler) = Promise::pending_on(handle);
    let n = promises.len();
    if n == 0 {
        settler.reject(Error::AllRejected {
            count: 0,
            last: Box::new(Error::Cancelled),
        });
        return out;
    }
    let remaining = Rc::new(std::cell::Cell::new(n));
    let last: Rc<RefCell<Option<Error>>> = Rc::new(RefCell::new(None));
    for promise in promises {
        let remaining = Rc::clone(&remaining);
        let last = Rc::clone(&last);
        let settler = settler.clone();
        promise.on_settle(move |outcome| match outcome {
            Ok(value) => settler.resolve(value),
            Err(reason) => {
                *last.borrow_mut() = Some(reason);
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    let reason = last.borrow_mut().take().unwrap_or(Error::Cancelled);
                    settler.reject(Error::AllRejected {
                        count: n,
                        last: Box::new(reason),
                    });
                }
            }
        });
    }
    out
}

/// Rejects with [`Error::Timeout`] if `promise` has not settled within
/// `delay`; otherwise adopts its outcome. The wrapped promise is not
/// cancelled when the timeout wins - wrap it in a
/// [`super::CancellablePromise`] for hard cancellation.
pub fn timeout<T: Clone + 'static>(
    handle: &Handle,
    promise: Promise<T>,
    delay: Duration,
) -> Promise<T> {
    let (out, settler) = Promise::pending_on(handle);
    let deadline_settler = settler.clone();
    let timer = handle.set_timeout(delay, move || deadline_settler.reject(Error::Timeout));
    promise.on_settle(move |outcome| {
        timer.cancel();
        settler.settle(outcome);
    });
    out
}

struct ConcurrentState<T: Clone + 'static> {
    queue: VecDeque<(usize, TaskFn<T>)>,
    slots: Vec<Option<T>>,
    remaining: usize,
    active: usize,
    failed: bool,
    limit: usize,
}

/// Run `tasks` with at most `limit` in flight. Fulfills with every result
/// (input order preserved); the first rejection rejects the whole batch
/// and stops launching queued tasks.
pub fn concurrent<T: Clone + 'static>(
    handle: &Handle,
    tasks: Vec<TaskFn<T>>,
    limit: usize,
) -> Promise<Vec<T>> {
    let (out, settler) = Promise::pending_on(handle);
    let n = tasks.len();
    if n == 0 {
        settler.resolve(Vec::new());
        return out;
    }
    let state = Rc::new(RefCell::new(ConcurrentState {
        queue: tasks.into_iter().enumerate().collect(),
        slots: (0..n).map(|_| None).collect(),
        remaining: n,
        active: 0,
        failed: false,
        limit: limit.max(1),
    }));
    pump(handle, &state, &settler);
    out
}

fn pump<T: Clone + 'static>(
    handle: &Handle,
    state: &Rc<RefCell<ConcurrentState<T>>>,
    settler: &Settler<Vec<T>>,
) {
    loop {
        let next = {
            let mut st = state.borrow_mut();
            if st.failed || st.active >= st.limit {
                None
            } else if let Some(entry) = st.queue.pop_front() {
                st.active += 1;
                Some(entry)
            } else {
                None
            }
        };
        let Some((index, task)) = next else { break };
        let promise = task();
        let handle = handle.clone();
        let state = Rc::clone(state);
        let settler = settler.clone();
        promise.on_settle(move |outcome| {
            let done = {
                let mut st = state.borrow_mut();
                st.active -= 1;
                match outcome {
                    Ok(value) => {
                        st.slots[index] = Some(value);
                        st.remaining -= 1;
                        if st.remaining == 0 {
                            Some(Ok(st.slots.iter_mut().filter_map(Option::take).collect()))
                        } else {
                            None
                        }
                    }
                    Err(reason) => {
                        st.failed = true;
                        st.queue.clear();
                        Some(Err(reason))
                    }
                }
            };
            match done {
                Some(outcome) => settler.settle(outcome),
                None => pump(&handle, &state, &settler),
            }
        });
    }
}

/// Run `tasks` in sequential batches of `batch_size`; within a batch, at
/// most `concurrency` tasks are in flight (the whole batch when `None`).
/// Results preserve input order across batches.
pub fn batch<T: Clone + 'static>(
    handle: &Handle,
    tasks: Vec<TaskFn<T>>,
    batch_size: usize,
    concurrency: Option<usize>,
) -> Promise<Vec<T>> {
    let (out, settler) = Promise::pending_on(handle);
    let batch_size = batch_size.max(1);
    let mut chunks: VecDeque<Vec<TaskFn<T>>> = VecDeque::new();
    let mut tasks = tasks;
    while !tasks.is_empty() {
        let rest = tasks.split_off(batch_size.min(tasks.len()));
        chunks.push_back(tasks);
        tasks = rest;
    }
    run_batches(handle, chunks, Vec::new(), concurrency, settler);
    out
}

fn run_batches<T: Clone + 'static>(
    handle: &Handle,
    mut chunks: VecDeque<Vec<TaskFn<T>>>,
    mut acc: Vec<T>,
    concurrency: Option<usize>,
    settler: Settler<Vec<T>>,
) {
    let Some(chunk) = chunks.pop_front() else {
        settler.resolve(acc);
        return;
    };
    let limit = concurrency.unwrap_or_else(|| chunk.len().max(1));
    let handle2 = handle.clone();
    concurrent(handle, chunk, limit).on_settle(move |outcome| match outcome {
        Ok(mut values) => {
            acc.append(&mut values);
            run_batches(&handle2, chunks, acc, concurrency, settler);
        }
        Err(reason) => settler.reject(reason),
    });
}
