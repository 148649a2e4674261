//! Readiness multiplexer over `mio::Poll`.
//!
//! Watchers are one-shot: they are unregistered before their callback runs
//! and re-registration is the caller's business. One epoll/kqueue
//! registration exists per fd; its interest set is the union of the fd's
//! live watchers and is adjusted whenever a watcher is added or removed.
//! A `mio::Waker` shares the poll instance so worker threads can interrupt
//! an idle `poll`.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use super::tick::Callback;

/// Token reserved for the cross-thread waker; slab keys stay well below it.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Opaque watcher identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(pub(crate) u64);

impl std::fmt::Display for WatcherId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watcher-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dir {
    Read,
    Write,
}

struct Watcher {
    id: WatcherId,
    cb: Callback,
}

struct FdSlot {
    fd: RawFd,
    read: Vec<Watcher>,
    write: Vec<Watcher>,
}

impl FdSlot {
    fn interest(&self) -> Option<Interest> {
        match (!self.read.is_empty(), !self.write.is_empty()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<mio::Waker>,
    slots: Slab<FdSlot>,
    by_fd: HashMap<RawFd, usize>,
    by_id: HashMap<WatcherId, RawFd>,
    next_id: u64,
}

impl Poller {
    pub(crate) fn new(event_capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(event_capacity),
            waker,
            slots: Slab::new(),
            by_fd: HashMap::new(),
            by_id: HashMap::new(),
            next_id: 0,
        })
    }

    pub(crate) fn waker(&self) -> Arc<mio::Waker> {
        Arc::clone(&self.waker)
    }

    pub(crate) fn add(&mut self, fd: RawFd, dir: Dir, cb: Callback) -> io::Result<WatcherId> {
        let id = WatcherId(self.next_id);
        self.next_id += 1;
        let watcher = Watcher { id, cb };

        match self.by_fd.get(&fd).copied() {
            Some(key) => {
                let slot = &mut self.slots[key];
                let had = slot.interest();
                match dir {
                    Dir::Read => slot.read.push(watcher),
                    Dir::Write => slot.write.push(watcher),
                }
                let want = slot.interest();
                if want != had {
                    if let Some(interest) = want {
                        self.poll.registry().reregister(
                            &mut SourceFd(&fd),
                            Token(key),
                            interest,
                        )?;
                    }
                }
            }
            None => {
                let entry = self.slots.vacant_entry();
                let key = entry.key();
                let slot = entry.insert(FdSlot {
                    fd,
                    read: Vec::new(),
                    write: Vec::new(),
                });
                match dir {
                    Dir::Read => slot.read.push(watcher),
                    Dir::Write => slot.write.push(watcher),
                }
                let interest = match dir {
                    Dir::Read => Interest::READABLE,
                    Dir::Write => Interest::WRITABLE,
                };
                if let Err(e) =
                    self.poll
                        .registry()
                        .register(&mut SourceFd(&fd), Token(key), interest)
                {
                    self.slots.remove(key);
                    return Err(e);
                }
                self.by_fd.insert(fd, key);
            }
        }
        self.by_id.insert(id, fd);
        tracing::trace!(%id, fd, ?dir, "watcher registered");
        Ok(id)
    }

    /// Remove a watcher by id. Returns `false` if it already fired or never
    /// existed.
    pub(crate) fn remove(&mut self, id: WatcherId) -> bool {
        let Some(fd) = self.by_id.remove(&id) else {
            return false;
        };
        let Some(&key) = self.by_fd.get(&fd) else {
            return false;
        };
        let slot = &mut self.slots[key];
        slot.read.retain(|w| w.id != id);
        slot.write.retain(|w| w.id != id);
        self.sync_registration(key);
        true
    }

    /// Drop every watcher for an fd (used when its owner goes away).
    pub(crate) fn clear(&mut self, fd: RawFd) {
        let Some(&key) = self.by_fd.get(&fd) else {
            return;
        };
        let slot = &mut self.slots[key];
        for w in slot.read.drain(..).chain(slot.write.drain(..)) {
            self.by_id.remove(&w.id);
        }
        self.sync_registration(key);
    }

    /// Re-register or tear down the slot's registration to match the
    /// remaining watchers.
    fn sync_registration(&mut self, key: usize) {
        let (fd, interest) = {
            let slot = &self.slots[key];
            (slot.fd, slot.interest())
        };
        match interest {
            Some(interest) => {
                if let Err(e) =
                    self.poll
                        .registry()
                        .reregister(&mut SourceFd(&fd), Token(key), interest)
                {
                    tracing::warn!(fd, error = %e, "reregister failed");
                }
            }
            None => {
                // The fd may already be closed; the kernel drops closed fds
                // from the interest list on its own.
                if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                    tracing::trace!(fd, error = %e, "deregister failed");
                }
                self.slots.remove(key);
                self.by_fd.remove(&fd);
            }
        }
    }

    /// Wait for readiness at most `max_block` and collect the callbacks of
    /// every watcher that fired. Callbacks are returned, not invoked, so the
    /// caller can run them with no borrow of the poller outstanding.
    pub(crate) fn poll(&mut self, max_block: Option<Duration>) -> io::Result<Vec<Callback>> {
        match self.poll.poll(&mut self.events, max_block) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e),
        }

        let mut hits: Vec<(usize, bool, bool)> = Vec::new();
        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let readable = event.is_readable() || event.is_read_closed() || event.is_error();
            let writable = event.is_writable() || event.is_write_closed() || event.is_error();
            hits.push((event.token().0, readable, writable));
        }

        let mut fired = Vec::new();
        for (key, readable, writable) in hits {
            if !self.slots.contains(key) {
                continue;
            }
            let slot = &mut self.slots[key];
            if readable {
                for w in slot.read.drain(..) {
                    self.by_id.remove(&w.id);
                    fired.push(w.cb);
                }
            }
            if writable {
                for w in slot.write.drain(..) {
                    self.by_id.remove(&w.id);
                    fired.push(w.cb);
                }
            }
            self.sync_registration(key);
        }
        Ok(fired)
    }

    pub(crate) fn watcher_count(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.by_id.is_empty()
    }
}
