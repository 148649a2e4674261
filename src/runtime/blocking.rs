//! Thread offload for operations the reactor cannot make nonblocking
//! (file syscalls, DNS resolution).
//!
//! Jobs run on a small pool of worker threads and push their type-erased
//! results onto a lock-free queue; the loop drains that queue once per
//! iteration and runs the matching continuation on the loop thread. A
//! `mio::Waker` interrupts an idle poll when a completion lands, so a
//! sleeping loop picks results up immediately.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use crossbeam_queue::SegQueue;

type Payload = Box<dyn Any + Send>;
type Continuation = Box<dyn FnOnce(Payload)>;

struct Job {
    id: u64,
    run: Box<dyn FnOnce() -> Payload + Send>,
}

pub(crate) struct BlockingPool {
    threads: usize,
    tx: mpsc::Sender<Job>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    done: Arc<SegQueue<(u64, Payload)>>,
    waker: Arc<mio::Waker>,
    continuations: RefCell<HashMap<u64, Continuation>>,
    in_flight: Cell<usize>,
    next_id: Cell<u64>,
    spawned: Cell<usize>,
}

impl BlockingPool {
    pub(crate) fn new(threads: usize, waker: Arc<mio::Waker>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            threads: threads.max(1),
            tx,
            rx: Arc::new(Mutex::new(rx)),
            done: Arc::new(SegQueue::new()),
            waker,
            continuations: RefCell::new(HashMap::new()),
            in_flight: Cell::new(0),
            next_id: Cell::new(0),
            spawned: Cell::new(0),
        }
    }

    /// Run `work` on a worker thread and `complete` with its result on the
    /// loop thread during a later iteration.
    pub(crate) fn submit<V, W, C>(&self, work: W, complete: C)
    where
        V: Any + Send + 'static,
        W: FnOnce() -> V + Send + 'static,
        C: FnOnce(V) + 'static,
    {
        let id = self.next_id.get();
        self.next_id.set(id + 1);

        self.continuations.borrow_mut().insert(
            id,
            Box::new(move |payload| match payload.downcast::<V>() {
                Ok(v) => complete(*v),
                Err(_) => tracing::error!(job = id, "offload result had unexpected type"),
            }),
        );
        self.in_flight.set(self.in_flight.get() + 1);
        self.ensure_workers();

        let job = Job {
            id,
            run: Box::new(move || Box::new(work()) as Payload),
        };
        if self.tx.send(job).is_err() {
            // Workers only exit once the pool is being torn down.
            tracing::error!(job = id, "blocking pool is gone; job dropped");
            self.in_flight.set(self.in_flight.get() - 1);
            self.continuations.borrow_mut().remove(&id);
        }
    }

    /// Lazily start worker threads, at most `threads` of them.
    fn ensure_workers(&self) {
        if self.spawned.get() >= self.threads {
            return;
        }
        let n = self.spawned.get();
        self.spawned.set(n + 1);

        let rx = Arc::clone(&self.rx);
        let done = Arc::clone(&self.done);
        let waker = Arc::clone(&self.waker);
        std::thread::Builder::new()
            .name(format!("weft-blocking-{}", n))
            .spawn(move || {
                loop {
                    let job = {
                        let Ok(guard) = rx.lock() else { return };
                        guard.recv()
                    };
                    let Ok(job) = job else { return };
                    let out = (job.run)();
                    done.push((job.id, out));
                    if let Err(e) = waker.wake() {
                        tracing::warn!(error = %e, "failed to wake the loop");
                    }
                }
            })
            .map(drop)
            .unwrap_or_else(|e| tracing::error!(error = %e, "failed to spawn worker thread"));
    }

    /// Run completions for every finished job. Returns whether any ran.
    pub(crate) fn drain(&self) -> bool {
        let mut any = false;
        while let Some((id, payload)) = self.done.pop() {
            self.in_flight.set(self.in_flight.get().saturating_sub(1));
            let cont = self.continuations.borrow_mut().remove(&id);
            if let Some(cont) = cont {
                cont(payload);
                any = true;
            }
        }
        any
    }

    pub(crate) fn has_completions(&self) -> bool {
        !self.done.is_empty()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight.get() == 0
    }

    /// Drop loop-side continuations so shutdown breaks any reference cycles
    /// through captured handles.
    pub(crate) fn clear(&self) {
        self.continuations.borrow_mut().clear();
    }
}
