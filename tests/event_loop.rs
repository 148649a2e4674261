//! Event loop behavior: timer ordering, tick queue phases, shutdown, and
//! reentrancy.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use weft::{Error, EventLoop};

#[test]
fn timers_fire_in_deadline_order() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let order = Rc::new(RefCell::new(Vec::new()));
    let started = Instant::now();

    for (delay_ms, tag) in [(50u64, "t1"), (10, "t2"), (20, "t3")] {
        let order = Rc::clone(&order);
        handle.set_timeout(Duration::from_millis(delay_ms), move || {
            order.borrow_mut().push(tag);
        });
    }

    lp.run().unwrap();
    let elapsed = started.elapsed();

    assert_eq!(*order.borrow(), vec!["t2", "t3", "t1"]);
    assert!(elapsed >= Duration::from_millis(45), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "elapsed {:?}", elapsed);
}

#[test]
fn equal_deadlines_fire_in_insertion_order() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();
    let order = Rc::new(RefCell::new(Vec::new()));
    for tag in ["a", "b", "c"] {
        let order = Rc::clone(&order);
        handle.set_timeout(Duration::from_millis(5), move || {
            order.borrow_mut().push(tag);
        });
    }
    lp.run().unwrap();
    assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
}

#[test]
fn cancelled_timer_does_not_fire() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();
    let fired = Rc::new(Cell::new(false));

    let flag = Rc::clone(&fired);
    let timer = handle.set_timeout(Duration::from_millis(5), move || flag.set(true));
    assert!(timer.cancel());
    assert!(!timer.cancel(), "second cancel is a no-op");

    // Anchor timer so the loop has something to do.
    handle.set_timeout(Duration::from_millis(20), || {});
    lp.run().unwrap();
    assert!(!fired.get());
}

#[test]
fn next_tick_drains_recursively_before_deferred() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();
    let order = Rc::new(RefCell::new(Vec::new()));

    {
        let order = Rc::clone(&order);
        handle.defer(move || order.borrow_mut().push("deferred"));
    }
    {
        let order = Rc::clone(&order);
        let chained = Rc::clone(&order);
        let h = handle.clone();
        handle.next_tick(move || {
            order.borrow_mut().push("tick");
            h.next_tick(move || chained.borrow_mut().push("tick-chained"));
        });
    }

    lp.run().unwrap();
    assert_eq!(*order.borrow(), vec!["tick", "tick-chained", "deferred"]);
}

#[test]
fn deferred_added_during_deferred_waits_one_iteration() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();
    let order = Rc::new(RefCell::new(Vec::new()));

    let h = handle.clone();
    let order2 = Rc::clone(&order);
    handle.defer(move || {
        order2.borrow_mut().push("first");
        let order3 = Rc::clone(&order2);
        let late = Rc::clone(&order2);
        h.defer(move || late.borrow_mut().push("second-iteration"));
        h.next_tick(move || order3.borrow_mut().push("next-iteration-tick"));
    });

    lp.run().unwrap();
    // The deferred callback queued mid-drain runs after the next
    // iteration's next-tick phase.
    assert_eq!(
        *order.borrow(),
        vec!["first", "next-iteration-tick", "second-iteration"]
    );
}

#[test]
fn callback_panics_do_not_abort_the_loop() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();
    let survived = Rc::new(Cell::new(false));

    handle.next_tick(|| panic!("tick panic"));
    let flag = Rc::clone(&survived);
    handle.set_timeout(Duration::from_millis(5), move || flag.set(true));

    lp.run().unwrap();
    assert!(survived.get());
}

#[test]
fn run_is_not_reentrant() {
    let lp = Rc::new(EventLoop::new().unwrap());
    let handle = lp.handle();
    let seen = Rc::new(RefCell::new(None));

    let inner = Rc::clone(&lp);
    let out = Rc::clone(&seen);
    handle.next_tick(move || {
        *out.borrow_mut() = Some(inner.run());
    });

    lp.run().unwrap();
    let nested = seen.borrow_mut().take().expect("callback ran");
    assert!(matches!(nested, Err(Error::LoopBusy)));
}

#[test]
fn stop_finishes_the_current_iteration() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    // Without the stop this would keep the loop alive for 10 seconds.
    handle.set_timeout(Duration::from_secs(10), || {});
    let stopper = handle.clone();
    handle.set_timeout(Duration::from_millis(10), move || stopper.stop());

    let started = Instant::now();
    lp.run().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[test]
fn run_returns_immediately_with_no_work() {
    let lp = EventLoop::new().unwrap();
    let started = Instant::now();
    lp.run().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[test]
fn loop_can_run_again_after_finishing() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();
    let count = Rc::new(Cell::new(0));

    let c = Rc::clone(&count);
    handle.set_timeout(Duration::from_millis(5), move || c.set(c.get() + 1));
    lp.run().unwrap();

    let c = Rc::clone(&count);
    handle.set_timeout(Duration::from_millis(5), move || c.set(c.get() + 1));
    lp.run().unwrap();

    assert_eq!(count.get(), 2);
}

#[test]
fn iteration_counter_advances() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();
    handle.set_timeout(Duration::from_millis(5), || {});
    lp.run().unwrap();
    assert!(handle.iteration() > 0);
}
