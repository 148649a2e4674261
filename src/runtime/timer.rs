//! Timer wheel: a min-heap of `(deadline, insertion-seq)` entries.
//!
//! Equal deadlines fire in insertion order (the sequence number is the
//! tie-break), and a drain fires everything due at the observed `now` in
//! non-decreasing deadline order. Cancellation removes the callback and
//! leaves a tombstone in the heap that is skipped on pop and swept by the
//! loop's maintenance step.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;

use super::tick::Callback;

/// Opaque timer identifier, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

#[derive(PartialEq, Eq)]
struct Entry {
    deadline: Instant,
    seq: u64,
    id: TimerId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct TimerWheel {
    heap: BinaryHeap<Reverse<Entry>>,
    callbacks: HashMap<TimerId, Callback>,
    next_seq: u64,
    next_id: u64,
}

impl TimerWheel {
    pub(crate) fn add(&mut self, deadline: Instant, cb: Callback) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Entry { deadline, seq, id }));
        self.callbacks.insert(id, cb);
        id
    }

    /// Cancel a pending timer. Returns `false` for unknown or already-fired
    /// ids.
    pub(crate) fn cancel(&mut self, id: TimerId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    /// Pop every timer due at `now`, in deadline order. Callbacks are
    /// returned rather than invoked so the caller can run them without
    /// holding any borrow of the wheel.
    pub(crate) fn drain_ready(&mut self, now: Instant) -> Vec<(TimerId, Callback)> {
        let mut ready = Vec::new();
        while let Some(Reverse(head)) = self.heap.peek() {
            if head.deadline > now {
                break;
            }
            let id = head.id;
            self.heap.pop();
            // Tombstoned (cancelled) entries have no callback.
            if let Some(cb) = self.callbacks.remove(&id) {
                ready.push((id, cb));
            }
        }
        ready
    }

    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.callbacks.contains_key(&head.id) {
                return Some(head.deadline);
            }
            self.heap.pop();
        }
        None
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Rebuild the heap without tombstones once they dominate it.
    pub(crate) fn prune(&mut self) {
        if self.heap.len() > 64 && self.heap.len() > self.callbacks.len() * 2 {
            let live: Vec<_> = self
                .heap
                .drain()
                .filter(|Reverse(e)| self.callbacks.contains_key(&e.id))
                .collect();
            self.heap = live.into_iter().collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn fires_in_deadline_order_with_stable_ties() {
        let mut wheel = TimerWheel::default();
        let base = Instant::now();
        let order = Rc::new(RefCell::new(Vec::new()));

        let mut add = |offset_ms: u64, tag: &'static str| {
            let order = Rc::clone(&order);
            wheel.add(
                base + Duration::from_millis(offset_ms),
                Box::new(move || order.borrow_mut().push(tag)),
            )
        };
        add(50, "a");
        add(10, "b");
        add(10, "c");
        add(20, "d");

        for (_, cb) in wheel.drain_ready(base + Duration::from_millis(100)) {
            cb();
        }
        assert_eq!(*order.borrow(), vec!["b", "c", "d", "a"]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_prevents_fire_and_is_single_shot() {
        let mut wheel = TimerWheel::default();
        let base = Instant::now();
        let id = wheel.add(base, Box::new(|| {}));
        assert!(wheel.cancel(id));
        assert!(!wheel.cancel(id));
        assert!(wheel.drain_ready(base + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn next_deadline_skips_tombstones() {
        let mut wheel = TimerWheel::default();
        let base = Instant::now();
        let early = wheel.add(base + Duration::from_millis(1), Box::new(|| {}));
        wheel.add(base + Duration::from_millis(5), Box::new(|| {}));
        wheel.cancel(early);
        assert_eq!(wheel.next_deadline(), Some(base + Duration::from_millis(5)));
    }

    #[test]
    fn not_ready_before_deadline() {
        let mut wheel = TimerWheel::default();
        let base = Instant::now();
        wheel.add(base + Duration::from_secs(60), Box::new(|| {}));
        assert!(wheel.drain_ready(base).is_empty());
        assert_eq!(wheel.len(), 1);
    }
}
