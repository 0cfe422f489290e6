use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nevio::{EventFuture, EventLoopGroup, LoopError};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// State Under Test: callbacks registered before resolution.
///
/// Expected Behavior: every callback fires exactly once, in registration
/// order, on the future's bound loop thread, with the same outcome.
#[test]
fn callbacks_fire_in_registration_order_on_the_loop() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let promise = event_loop.new_promise::<i32>();
    let order = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    for i in 0..3 {
        let order = order.clone();
        let tx = tx.clone();
        let on_loop = event_loop.clone();
        promise.future().when_complete(move |outcome| {
            assert!(on_loop.in_event_loop());
            assert_eq!(*outcome.as_ref().unwrap(), 7);
            order.lock().unwrap().push(i);
            if i == 2 {
                tx.send(()).unwrap();
            }
        });
    }

    // Resolve from a foreign thread; delivery must hop onto the loop.
    promise.succeed(7);

    rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn callbacks_registered_after_resolution_fire() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let future = event_loop.new_succeeded_future(5);
    let (tx, rx) = mpsc::channel();
    future.when_success(move |value| {
        tx.send(*value).unwrap();
    });
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), 5);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn map_and_flat_map_chain() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let promise = event_loop.new_promise::<i32>();
    let chained_loop = event_loop.clone();
    let chained = promise
        .future()
        .map(|value| value * 2)
        .flat_map(move |value| chained_loop.new_succeeded_future(value + 1));

    promise.succeed(7);
    assert_eq!(chained.wait().unwrap(), 15);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn failure_bypasses_map_and_propagates() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let promise = event_loop.new_promise::<i32>();
    let mapped = promise
        .future()
        .map(|_| -> i32 { panic!("map must not run on failure") });
    promise.fail(LoopError::Cancelled);

    match mapped.wait() {
        Err(LoopError::Cancelled) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn when_failure_fires_only_on_failure() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let (tx, rx) = mpsc::channel();
    let failure_tx = tx.clone();
    event_loop
        .new_failed_future::<i32>(LoopError::Cancelled)
        .when_failure(move |error| {
            failure_tx.send(error.to_string()).unwrap();
        });
    assert!(rx.recv_timeout(RECV_TIMEOUT).unwrap().contains("cancelled"));

    event_loop.new_succeeded_future(1).when_failure(move |_| {
        tx.send("should not fire".to_string()).unwrap();
    });
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    group.sync_shutdown_gracefully().unwrap();
}

/// State Under Test: a future chain spanning two loops, resolved from a
/// third thread.
///
/// Expected Behavior: the map closure runs on the first loop, the cascaded
/// callback on the second, and the mapped value arrives intact.
#[test]
fn cascade_carries_outcomes_across_loops() {
    let group = EventLoopGroup::new(2).unwrap();
    let first = group.next();
    let second = group.next();

    let promise = first.new_promise::<i32>();
    let target = second.new_promise::<i32>();

    let on_first = first.clone();
    let mapped = promise.future().map(move |value| {
        assert!(on_first.in_event_loop());
        value + 1
    });
    mapped.cascade(target.clone());

    let (tx, rx) = mpsc::channel();
    let on_second = second.clone();
    target.future().when_success(move |value| {
        assert!(on_second.in_event_loop());
        tx.send(*value).unwrap();
    });

    let resolver = promise.clone();
    thread::spawn(move || resolver.succeed(7)).join().unwrap();

    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), 8);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn and_combines_both_values() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let left = event_loop.new_promise::<i32>();
    let right = event_loop.new_promise::<i32>();
    let both = left.future().and(&right.future());

    right.succeed(2);
    left.succeed(1);
    assert_eq!(both.wait().unwrap(), (1, 2));

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn and_fails_with_the_first_failure() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let left = event_loop.new_promise::<i32>();
    let right = event_loop.new_promise::<i32>();
    let both = left.future().and(&right.future());

    left.fail(LoopError::Cancelled);
    match both.wait() {
        Err(LoopError::Cancelled) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }
    // Resolve the remaining promise so nothing is left pending.
    right.succeed(0);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn and_all_resolves_after_every_input() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let promises: Vec<_> = (0..4).map(|_| event_loop.new_promise::<i32>()).collect();
    let futures = promises.iter().map(|p| p.future()).collect();
    let all = EventFuture::and_all(&event_loop, futures);

    for (i, promise) in promises.iter().enumerate() {
        promise.succeed(i as i32);
    }
    assert!(all.wait().is_ok());

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn and_all_fails_fast() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let promises: Vec<_> = (0..3).map(|_| event_loop.new_promise::<i32>()).collect();
    let futures = promises.iter().map(|p| p.future()).collect();
    let all = EventFuture::and_all(&event_loop, futures);

    promises[1].fail(LoopError::Cancelled);
    match all.wait() {
        Err(LoopError::Cancelled) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }
    promises[0].succeed(0);
    promises[2].succeed(2);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn panic_in_map_becomes_task_panic_failure() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let promise = event_loop.new_promise::<i32>();
    let derived = promise.future().map(|_| -> i32 { panic!("boom") });
    promise.succeed(1);

    match derived.wait() {
        Err(LoopError::TaskPanic(message)) => assert!(message.contains("boom")),
        other => panic!("unexpected outcome: {:?}", other),
    }

    group.sync_shutdown_gracefully().unwrap();
}
