//! Promise semantics: settle-once, asynchronous handler dispatch,
//! chaining, combinators, and cancellation.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use weft::promise::{TaskFn, all, any, batch, concurrent, race, timeout};
use weft::{CancellablePromise, Error, EventLoop, Promise};

#[test]
fn settlement_is_once_and_state_is_exclusive() {
    let lp = EventLoop::new().unwrap();
    let (promise, settler) = lp.handle().promise::<i32>();

    assert!(promise.is_pending());
    settler.resolve(1);
    assert!(promise.is_fulfilled());
    settler.reject(Error::Timeout);
    settler.resolve(2);
    assert!(promise.is_fulfilled(), "state never changes after settling");
    assert_eq!(lp.block_on(promise).unwrap(), 1);
}

#[test]
fn handlers_never_run_synchronously() {
    let lp = EventLoop::new().unwrap();
    let (promise, settler) = lp.handle().promise::<i32>();
    settler.resolve(7);

    let observed = Rc::new(Cell::new(false));
    let flag = Rc::clone(&observed);
    let derived = promise.then(move |v| {
        flag.set(true);
        v
    });
    // Registered after settlement, but still dispatched through the
    // next-tick queue.
    assert!(!observed.get());
    assert_eq!(lp.block_on(derived).unwrap(), 7);
    assert!(observed.get());
}

#[test]
fn then_catch_finally_chain() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let (promise, settler) = handle.promise::<i32>();
    settler.resolve(20);
    let doubled = promise.then(|v| v * 2);
    assert_eq!(lp.block_on(doubled).unwrap(), 40);

    let (promise, settler) = handle.promise::<i32>();
    settler.reject(Error::Timeout);
    let recovered = promise.catch(|_| -1);
    assert_eq!(lp.block_on(recovered).unwrap(), -1);

    // Rejections skip `then` handlers entirely.
    let (promise, settler) = handle.promise::<i32>();
    settler.reject(Error::Timeout);
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    let chained = promise.then(move |v| {
        flag.set(true);
        v
    });
    assert!(matches!(lp.block_on(chained), Err(Error::Timeout)));
    assert!(!ran.get());
}

#[test]
fn finally_runs_on_both_outcomes_and_can_reject() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let runs = Rc::new(Cell::new(0));

    let (promise, settler) = handle.promise::<i32>();
    settler.resolve(1);
    let counter = Rc::clone(&runs);
    let passthrough = promise.finally(move || {
        counter.set(counter.get() + 1);
        Ok(())
    });
    assert_eq!(lp.block_on(passthrough).unwrap(), 1);

    let (promise, settler) = handle.promise::<i32>();
    settler.reject(Error::Timeout);
    let counter = Rc::clone(&runs);
    let passthrough = promise.finally(move || {
        counter.set(counter.get() + 1);
        Ok(())
    });
    assert!(matches!(lp.block_on(passthrough), Err(Error::Timeout)));

    assert_eq!(runs.get(), 2);

    // A failing finally rejects downstream even on fulfillment.
    let (promise, settler) = handle.promise::<i32>();
    settler.resolve(9);
    let poisoned = promise.finally(|| Err(Error::Deadlock));
    assert!(matches!(lp.block_on(poisoned), Err(Error::Deadlock)));
}

#[test]
fn and_then_adopts_the_inner_outcome() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let (promise, settler) = handle.promise::<i32>();
    settler.resolve(3);
    let h = handle.clone();
    let adopted = promise.and_then(move |v| {
        let sleep = h.delay(Duration::from_millis(10));
        sleep.promise().then(move |_| v + 100)
    });
    assert_eq!(lp.block_on(adopted).unwrap(), 103);
}

#[test]
fn handlers_run_in_registration_order() {
    let lp = EventLoop::new().unwrap();
    let (promise, settler) = lp.handle().promise::<i32>();
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut tails = Vec::new();
    for tag in 1..=3 {
        let order = Rc::clone(&order);
        tails.push(promise.then(move |_| order.borrow_mut().push(tag)));
    }
    settler.resolve(0);
    let joined = all(&lp.handle(), tails);
    lp.block_on(joined).unwrap();
    assert_eq!(*order.borrow(), vec![1, 2, 3]);
}

#[test]
fn dropping_every_settler_rejects_with_cancelled() {
    let lp = EventLoop::new().unwrap();
    let (promise, settler) = lp.handle().promise::<i32>();
    let extra = settler.clone();
    drop(settler);
    assert!(promise.is_pending(), "a settler clone is still alive");
    drop(extra);
    assert!(matches!(lp.block_on(promise), Err(Error::Cancelled)));
}

#[test]
fn block_on_a_stuck_promise_reports_deadlock() {
    let lp = EventLoop::new().unwrap();
    let (promise, settler) = lp.handle().promise::<i32>();
    let result = lp.block_on(promise);
    assert!(matches!(result, Err(Error::Deadlock)));
    drop(settler);
}

#[test]
fn all_preserves_order_and_rejects_on_first_failure() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let promises: Vec<Promise<u64>> = [30u64, 10, 20]
        .into_iter()
        .map(|ms| {
            let sleep = handle.delay(Duration::from_millis(ms));
            sleep.promise().then(move |_| ms)
        })
        .collect();
    let joined = all(&handle, promises);
    assert_eq!(lp.block_on(joined).unwrap(), vec![30, 10, 20]);

    let (failing, settler) = handle.promise::<u64>();
    settler.reject(Error::Timeout);
    let sleep = handle.delay(Duration::from_millis(5));
    let joined = all(&handle, vec![sleep.promise().then(|_| 1), failing]);
    assert!(matches!(lp.block_on(joined), Err(Error::Timeout)));

    let empty = all::<u64>(&handle, Vec::new());
    assert_eq!(lp.block_on(empty).unwrap(), Vec::<u64>::new());
}

#[test]
fn race_settles_with_the_first() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();
    let slow = handle.delay(Duration::from_millis(100)).promise().then(|_| "slow");
    let fast = handle.delay(Duration::from_millis(10)).promise().then(|_| "fast");
    let winner = race(&handle, vec![slow, fast]);
    assert_eq!(lp.block_on(winner).unwrap(), "fast");
}

#[test]
fn any_ignores_rejections_until_all_fail() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let (rejected, settler) = handle.promise::<&'static str>();
    settler.reject(Error::Timeout);
    let ok = handle.delay(Duration::from_millis(10)).promise().then(|_| "ok");
    let first = any(&handle, vec![rejected, ok]);
    assert_eq!(lp.block_on(first).unwrap(), "ok");

    let (r1, s1) = handle.promise::<&'static str>();
    let (r2, s2) = handle.promise::<&'static str>();
    s1.reject(Error::Timeout);
    s2.reject(Error::Deadlock);
    let none = any(&handle, vec![r1, r2]);
    match lp.block_on(none) {
        Err(Error::AllRejected { count, .. }) => assert_eq!(count, 2),
        other => panic!("expected AllRejected, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn timeout_rejects_late_promises_within_bounds() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let fast = handle.delay(Duration::from_millis(10)).promise().then(|_| 1);
    let bounded = timeout(&handle, fast, Duration::from_millis(500));
    assert_eq!(lp.block_on(bounded).unwrap(), 1);

    let slow = handle.delay(Duration::from_millis(5000)).promise().then(|_| 1);
    let bounded = timeout(&handle, slow, Duration::from_millis(30));
    let started = Instant::now();
    let result = lp.block_on(bounded);
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(started.elapsed() < Duration::from_millis(1000));
    lp.stop();
}

#[test]
fn concurrent_respects_the_limit_and_order() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let active = Rc::new(Cell::new(0usize));
    let peak = Rc::new(Cell::new(0usize));

    let tasks: Vec<TaskFn<usize>> = (0..5)
        .map(|i| {
            let handle = handle.clone();
            let active = Rc::clone(&active);
            let peak = Rc::clone(&peak);
            let task: TaskFn<usize> = Box::new(move || {
                active.set(active.get() + 1);
                peak.set(peak.get().max(active.get()));
                let sleep = handle.delay(Duration::from_millis(15));
                sleep.promise().then(move |_| {
                    active.set(active.get() - 1);
                    i
                })
            });
            task
        })
        .collect();

    let joined = concurrent(&handle, tasks, 2);
    assert_eq!(lp.block_on(joined).unwrap(), vec![0, 1, 2, 3, 4]);
    assert!(peak.get() <= 2, "peak concurrency {} > 2", peak.get());
}

#[test]
fn batch_processes_chunks_sequentially() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let tasks: Vec<TaskFn<usize>> = (0..6)
        .map(|i| {
            let handle = handle.clone();
            let task: TaskFn<usize> = Box::new(move || {
                let sleep = handle.delay(Duration::from_millis(5));
                sleep.promise().then(move |_| i)
            });
            task
        })
        .collect();

    let joined = batch(&handle, tasks, 2, None);
    assert_eq!(lp.block_on(joined).unwrap(), vec![0, 1, 2, 3, 4, 5]);
}

#[test]
fn cancellation_rejects_and_skips_downstream_fulfillment() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let sleep = handle.delay(Duration::from_secs(1));
    let downstream_ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&downstream_ran);
    let chained = sleep.promise().then(move |_| {
        flag.set(true);
        1
    });

    let canceller = handle.clone();
    // Sharing the cancellable promise with a timer callback.
    let sleep = Rc::new(sleep);
    let target = Rc::clone(&sleep);
    canceller.set_timeout(Duration::from_millis(50), move || {
        assert!(target.cancel());
        assert!(!target.cancel(), "cancel is one-shot");
    });

    let started = Instant::now();
    let result = lp.block_on(chained);
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(started.elapsed() < Duration::from_millis(900));
    assert!(!downstream_ran.get());
    assert!(sleep.is_cancelled());
}

#[test]
fn cancel_handler_runs_exactly_once() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let runs = Rc::new(Cell::new(0));
    let counter = Rc::clone(&runs);
    let (cancellable, _settler) = CancellablePromise::<i32>::with_cancel_handler(&handle, move || {
        counter.set(counter.get() + 1);
    });
    assert!(cancellable.cancel());
    assert!(!cancellable.cancel());

    let observed = cancellable.promise().catch(|e| {
        assert!(matches!(e, Error::Cancelled));
        0
    });
    assert_eq!(lp.block_on(observed).unwrap(), 0);
    assert_eq!(runs.get(), 1);
}

#[test]
fn cancelled_root_skips_handlers_registered_before_settlement() {
    let lp = EventLoop::new().unwrap();
    let handle = lp.handle();

    let (cancellable, settler) = CancellablePromise::<i32>::pending_on(&handle);
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    let chained = cancellable.promise().then(move |v| {
        flag.set(true);
        v
    });

    cancellable.cancel();
    // A resolve racing the cancellation loses: the promise was already
    // rejected.
    settler.resolve(5);

    assert!(matches!(lp.block_on(chained), Err(Error::Cancelled)));
    assert!(!ran.get());
}
