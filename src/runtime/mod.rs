//! The event loop: a single-threaded cooperative scheduler multiplexing
//! timers, socket readiness, HTTP requests, file operations, tick/deferred
//! callbacks, and suspended fibers.
//!
//! One iteration runs, in order: the next-tick drain, offload completions,
//! the HTTP drive, fiber resumption, file-op dispatch, ready timers, the
//! readiness poll (which doubles as the idle sleep), and the deferred
//! drain. `run()` returns once `stop()` is called or no work remains.

pub(crate) mod blocking;
pub(crate) mod net;
pub(crate) mod poller;
pub(crate) mod task;
pub(crate) mod tick;
pub(crate) mod timer;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::os::fd::RawFd;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use smart_default::SmartDefault;

use crate::error::{Error, Result};
use crate::fs::FsState;
use crate::http::HttpManager;
use crate::promise::Promise;

use blocking::BlockingPool;
use poller::{Dir, Poller};
use task::{RunQueue, TaskSet};
use tick::{TickQueues, run_guarded};
use timer::TimerWheel;

pub use poller::WatcherId;
pub use timer::TimerId;

/// The iteration counter wraps here rather than running to `u64::MAX`.
const ITERATION_CEILING: u64 = 1 << 62;

thread_local! {
    static CURRENT: RefCell<Option<Weak<LoopShared>>> = const { RefCell::new(None) };
}

/// Tunables for the event loop.
///
/// The sleep bounds were empirical constants in earlier revisions; they are
/// configuration now.
#[derive(Debug, Clone, SmartDefault)]
pub struct LoopConfig {
    /// Sleeps shorter than this are skipped to avoid syscall overhead.
    #[default(Duration::from_micros(50))]
    pub min_sleep: Duration,

    /// Longest slice the loop blocks in the readiness poll while idle.
    #[default(Duration::from_micros(500))]
    pub max_idle_slice: Duration,

    /// Wall-clock cadence of the maintenance step.
    #[default(Duration::from_secs(1))]
    pub maintenance_interval: Duration,

    /// Worker threads for file ops and DNS resolution.
    #[default = 2]
    pub blocking_threads: usize,

    /// Capacity of the readiness event buffer.
    #[default = 256]
    pub event_capacity: usize,
}

pub(crate) struct LoopShared {
    pub(crate) config: LoopConfig,
    pub(crate) ticks: RefCell<TickQueues>,
    pub(crate) timers: RefCell<TimerWheel>,
    pub(crate) poller: RefCell<Poller>,
    pub(crate) tasks: RefCell<TaskSet>,
    pub(crate) runnable: Arc<RunQueue>,
    pub(crate) blocking: BlockingPool,
    pub(crate) http: RefCell<HttpManager>,
    pub(crate) fs: RefCell<FsState>,
    running: Cell<bool>,
    stop_flag: Cell<bool>,
    iteration: Cell<u64>,
    last_maintenance: Cell<Instant>,
}

/// The event loop. Owns every sub-system; exactly one instance should exist
/// per thread. [`Handle`]s are cheap clones used by everything that needs
/// to schedule work.
pub struct EventLoop {
    shared: Rc<LoopShared>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> Result<Self> {
        let poller = Poller::new(config.event_capacity)?;
        let waker = poller.waker();
        let blocking = BlockingPool::new(config.blocking_threads, waker);
        let shared = Rc::new(LoopShared {
            config,
            ticks: RefCell::new(TickQueues::default()),
            timers: RefCell::new(TimerWheel::default()),
            poller: RefCell::new(poller),
            tasks: RefCell::new(TaskSet::default()),
            runnable: Arc::new(RunQueue::default()),
            blocking,
            http: RefCell::new(HttpManager::default()),
            fs: RefCell::new(FsState::default()),
            running: Cell::new(false),
            stop_flag: Cell::new(false),
            iteration: Cell::new(0),
            last_maintenance: Cell::new(Instant::now()),
        });
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.as_ref().is_some_and(|w| w.strong_count() > 0) {
                tracing::warn!("replacing the thread's current event loop");
            }
            *current = Some(Rc::downgrade(&shared));
        });
        Ok(Self { shared })
    }

    pub fn handle(&self) -> Handle {
        Handle {
            shared: Rc::clone(&self.shared),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    /// Ask the loop to finish the current iteration and return from `run`.
    pub fn stop(&self) {
        self.shared.stop_flag.set(true);
    }

    /// Run until stopped or until no work remains.
    ///
    /// Not reentrant: calling `run` (or `block_on`) while the loop is
    /// already running fails with [`Error::LoopBusy`].
    pub fn run(&self) -> Result<()> {
        if self.shared.running.replace(true) {
            return Err(Error::LoopBusy);
        }
        while !self.shared.stop_flag.get() {
            self.turn();
            if self.shared.stop_flag.get() || self.no_work_left() {
                break;
            }
        }
        self.shared.running.set(false);
        self.shared.stop_flag.set(false);
        Ok(())
    }

    /// Run the loop until `promise` settles and return its outcome.
    ///
    /// This is the out-of-fiber form of `await`. Fails with
    /// [`Error::Deadlock`] if the loop runs out of work while the promise
    /// is still pending, and with [`Error::LoopBusy`] when called from
    /// inside a running loop (use `.await` in a fiber instead).
    pub fn block_on<T: Clone + 'static>(&self, promise: Promise<T>) -> Result<T> {
        if self.shared.running.replace(true) {
            return Err(Error::LoopBusy);
        }
        let outcome = loop {
            if let Some(out) = promise.try_result() {
                break out;
            }
            self.turn();
            if let Some(out) = promise.try_result() {
                break out;
            }
            if self.shared.stop_flag.get() {
                break Err(Error::Cancelled);
            }
            if self.no_work_left() {
                break Err(Error::Deadlock);
            }
        };
        self.shared.running.set(false);
        self.shared.stop_flag.set(false);
        outcome
    }

    /// Spawn a fiber and run the loop until it finishes.
    pub fn run_fiber<T, F>(&self, fut: F) -> Result<T>
    where
        T: Clone + 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let promise = self.handle().spawn(fut);
        self.block_on(promise)
    }

    /// One loop iteration.
    fn turn(&self) {
        let shared = &self.shared;
        let iter = shared.iteration.get();
        shared
            .iteration
            .set(if iter >= ITERATION_CEILING { 0 } else { iter + 1 });

        // 1. Next-tick callbacks, including ones queued mid-drain.
        loop {
            let cb = shared.ticks.borrow_mut().next.pop_front();
            match cb {
                Some(cb) => run_guarded(cb),
                None => break,
            }
        }

        // 2. Offload completions, then drive HTTP completions.
        shared.blocking.drain();
        crate::http::drive(&self.handle());

        // 3. Resume fibers whose awaited promises settled.
        while task::poll_one(&shared.tasks, &shared.runnable) {}

        // 4. Dispatch queued file operations.
        crate::fs::process(&self.handle());

        // 5. Fire ready timers.
        let due = shared.timers.borrow_mut().drain_ready(Instant::now());
        for (id, cb) in due {
            tracing::trace!(timer = %id, "firing");
            run_guarded(cb);
        }

        // 6. Readiness poll; its timeout is the idle sleep.
        let timeout = self.poll_timeout();
        let fired = match shared.poller.borrow_mut().poll(timeout) {
            Ok(fired) => fired,
            Err(e) => {
                tracing::error!(error = %e, "readiness poll failed");
                Vec::new()
            }
        };
        for cb in fired {
            run_guarded(cb);
        }

        // 7. Deferred callbacks from a snapshot; later additions wait.
        let batch: Vec<_> = shared.ticks.borrow_mut().deferred.drain(..).collect();
        for cb in batch {
            run_guarded(cb);
        }

        self.maintenance();
    }

    /// Idle-sleep budget for the readiness poll: zero when immediate work is
    /// pending, otherwise `min(next_timer_delay, max_idle_slice)` with
    /// sub-`min_sleep` sleeps rounded down to zero.
    fn poll_timeout(&self) -> Option<Duration> {
        let shared = &self.shared;
        let immediate = {
            let ticks = shared.ticks.borrow();
            !ticks.next.is_empty() || !ticks.deferred.is_empty()
        } || !shared.runnable.is_empty()
            || shared.blocking.has_completions()
            || shared.http.borrow().has_ready()
            || shared.fs.borrow().has_queued()
            || shared.stop_flag.get();
        if immediate {
            return Some(Duration::ZERO);
        }

        let config = &shared.config;
        let idle = match shared.timers.borrow_mut().next_deadline() {
            Some(deadline) => deadline
                .saturating_duration_since(Instant::now())
                .min(config.max_idle_slice),
            None => config.max_idle_slice,
        };
        if idle < config.min_sleep {
            Some(Duration::ZERO)
        } else {
            Some(idle)
        }
    }

    fn maintenance(&self) {
        let shared = &self.shared;
        let now = Instant::now();
        if now.duration_since(shared.last_maintenance.get()) < shared.config.maintenance_interval {
            return;
        }
        shared.last_maintenance.set(now);
        shared.timers.borrow_mut().prune();
        tracing::trace!(
            iteration = shared.iteration.get(),
            fibers = shared.tasks.borrow().len(),
            timers = shared.timers.borrow().len(),
            watchers = shared.poller.borrow().watcher_count(),
            "maintenance"
        );
    }

    fn no_work_left(&self) -> bool {
        let shared = &self.shared;
        shared.ticks.borrow().is_empty()
            && shared.runnable.is_empty()
            && shared.tasks.borrow().is_empty()
            && shared.timers.borrow().is_empty()
            && shared.poller.borrow().is_idle()
            && shared.blocking.is_idle()
            && shared.http.borrow().is_idle()
            && shared.fs.borrow().is_idle()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Break Rc cycles: live fibers, queued callbacks, and offload
        // continuations all capture handles back into the loop.
        let fibers = self.shared.tasks.borrow_mut().drain_all();
        drop(fibers);
        {
            let mut ticks = self.shared.ticks.borrow_mut();
            ticks.next.clear();
            ticks.deferred.clear();
        }
        *self.shared.timers.borrow_mut() = TimerWheel::default();
        self.shared.blocking.clear();
        self.shared.http.borrow_mut().clear();
        self.shared.fs.borrow_mut().clear();
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            let is_us = current
                .as_ref()
                .is_some_and(|w| w.as_ptr() == Rc::as_ptr(&self.shared));
            if is_us {
                *current = None;
            }
        });
    }
}

/// A cheap handle onto the event loop.
#[derive(Clone)]
pub struct Handle {
    shared: Rc<LoopShared>,
}

impl Handle {
    /// The current thread's loop, installed by [`EventLoop::new`].
    pub fn current() -> Result<Handle> {
        CURRENT.with(|current| {
            current
                .borrow()
                .as_ref()
                .and_then(Weak::upgrade)
                .map(|shared| Handle { shared })
                .ok_or(Error::NoEventLoop)
        })
    }

    pub(crate) fn shared(&self) -> &Rc<LoopShared> {
        &self.shared
    }

    /// Ask the loop to finish the current iteration and return from `run`.
    pub fn stop(&self) {
        self.shared.stop_flag.set(true);
    }

    /// Queue a callback on the high-priority next-tick queue.
    pub fn next_tick(&self, cb: impl FnOnce() + 'static) {
        self.shared.ticks.borrow_mut().next.push_back(Box::new(cb));
    }

    /// Queue a callback on the end-of-iteration deferred queue.
    pub fn defer(&self, cb: impl FnOnce() + 'static) {
        self.shared
            .ticks
            .borrow_mut()
            .deferred
            .push_back(Box::new(cb));
    }

    /// Arm a one-shot timer. The returned handle can cancel it before fire.
    pub fn set_timeout(&self, delay: Duration, cb: impl FnOnce() + 'static) -> TimerHandle {
        let deadline = Instant::now() + delay;
        let id = self
            .shared
            .timers
            .borrow_mut()
            .add(deadline, Box::new(cb));
        TimerHandle {
            id,
            handle: self.clone(),
        }
    }

    pub(crate) fn cancel_timer(&self, id: TimerId) -> bool {
        self.shared.timers.borrow_mut().cancel(id)
    }

    /// Spawn a fiber. The promise settles with the fiber's result.
    pub fn spawn<T, F>(&self, fut: F) -> Promise<T>
    where
        T: Clone + 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        self.spawn_tracked(fut).0
    }

    /// Spawn a fiber and also return its task id so the caller can detach
    /// it later (used by request cancellation).
    pub(crate) fn spawn_tracked<T, F>(&self, fut: F) -> (Promise<T>, usize)
    where
        T: Clone + 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        let (promise, settler) = self.promise();
        let body = async move {
            let out = fut.await;
            settler.settle(out);
        };
        let id = self.shared.tasks.borrow_mut().insert(Box::pin(body));
        self.shared.runnable.push(id);
        (promise, id)
    }

    /// Drop a fiber without running it to completion.
    pub(crate) fn cancel_fiber(&self, id: usize) -> bool {
        let fut = self.shared.tasks.borrow_mut().cancel(id);
        // Dropped outside the borrow: destructors may touch the runtime.
        fut.is_some()
    }

    /// Are there live fibers (runnable or suspended)?
    pub fn has_active_fibers(&self) -> bool {
        !self.shared.tasks.borrow().is_empty()
    }

    pub(crate) fn readiness(&self, fd: RawFd, dir: Dir) -> ReadinessFuture {
        ReadinessFuture {
            handle: self.clone(),
            fd,
            dir,
            watcher: None,
            ready: Rc::new(Cell::new(false)),
            waker_slot: Rc::new(RefCell::new(None)),
        }
    }

    /// Resolves when `fd` becomes readable.
    pub(crate) fn readable(&self, fd: RawFd) -> ReadinessFuture {
        self.readiness(fd, Dir::Read)
    }

    /// Resolves when `fd` becomes writable.
    pub(crate) fn writable(&self, fd: RawFd) -> ReadinessFuture {
        self.readiness(fd, Dir::Write)
    }

    /// Run `work` on the blocking pool, then `complete` on the loop thread.
    pub(crate) fn unblock<V, W, C>(&self, work: W, complete: C)
    where
        V: std::any::Any + Send + 'static,
        W: FnOnce() -> V + Send + 'static,
        C: FnOnce(V) + 'static,
    {
        self.shared.blocking.submit(work, complete);
    }

    pub fn iteration(&self) -> u64 {
        self.shared.iteration.get()
    }
}

/// Cancellable handle to a pending timer.
pub struct TimerHandle {
    id: TimerId,
    handle: Handle,
}

impl TimerHandle {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Cancel the timer. Returns `false` if it already fired or was
    /// cancelled before.
    pub fn cancel(&self) -> bool {
        self.handle.cancel_timer(self.id)
    }
}

/// Future that resolves once an fd reports readiness.
///
/// The watcher is registered on first poll and removed again if the future
/// is dropped before firing, so a lost race (timeout, cancellation) leaves
/// nothing behind in the poller.
pub(crate) struct ReadinessFuture {
    handle: Handle,
    fd: RawFd,
    dir: Dir,
    watcher: Option<WatcherId>,
    ready: Rc<Cell<bool>>,
    waker_slot: Rc<RefCell<Option<Waker>>>,
}

impl Future for ReadinessFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.ready.get() {
            this.watcher = None;
            return Poll::Ready(Ok(()));
        }
        *this.waker_slot.borrow_mut() = Some(cx.waker().clone());
        if this.watcher.is_none() {
            let ready = Rc::clone(&this.ready);
            let slot = Rc::clone(&this.waker_slot);
            let registered = this.handle.shared.poller.borrow_mut().add(
                this.fd,
                this.dir,
                Box::new(move || {
                    ready.set(true);
                    if let Some(waker) = slot.borrow_mut().take() {
                        waker.wake();
                    }
                }),
            );
            match registered {
                Ok(id) => this.watcher = Some(id),
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
        Poll::Pending
    }
}

impl Drop for ReadinessFuture {
    fn drop(&mut self) {
        if !self.ready.get()
            && let Some(id) = self.watcher.take()
        {
            self.handle.shared.poller.borrow_mut().remove(id);
        }
    }
}
