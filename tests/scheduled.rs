use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use nevio::{EventLoopGroup, LoopError, TimeAmount};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// State Under Test: three tasks scheduled out of deadline order.
///
/// Expected Behavior: they run in deadline order, each no earlier than its
/// own deadline.
#[test]
fn tasks_run_in_deadline_order_and_never_early() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let start = Instant::now();
    let runs = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();

    for &(label, delay_ms) in &[("a", 50i64), ("b", 10), ("c", 30)] {
        let runs = runs.clone();
        let tx = tx.clone();
        event_loop.schedule(TimeAmount::milliseconds(delay_ms), move || {
            runs.lock().unwrap().push((label, Instant::now()));
            tx.send(()).unwrap();
            Ok(())
        });
    }

    for _ in 0..3 {
        rx.recv_timeout(RECV_TIMEOUT).unwrap();
    }

    let runs = runs.lock().unwrap();
    let order: Vec<&str> = runs.iter().map(|(label, _)| *label).collect();
    assert_eq!(order, vec!["b", "c", "a"]);
    for &(label, at) in runs.iter() {
        let deadline = match label {
            "a" => Duration::from_millis(50),
            "b" => Duration::from_millis(10),
            _ => Duration::from_millis(30),
        };
        assert!(at - start >= deadline, "{} ran before its deadline", label);
    }

    group.sync_shutdown_gracefully().unwrap();
}

/// State Under Test: a task scheduled one second out, cancelled at ~100ms.
///
/// Expected Behavior: the future fails with `Cancelled` and the task body
/// never runs.
#[test]
fn cancellation_before_the_deadline_wins() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let ran = Arc::new(AtomicBool::new(false));
    let ran_in_task = ran.clone();
    let scheduled = event_loop.schedule(TimeAmount::seconds(1), move || {
        ran_in_task.store(true, Ordering::SeqCst);
        Ok(())
    });

    thread::sleep(Duration::from_millis(100));
    scheduled.cancel();

    match scheduled.future_result().wait() {
        Err(LoopError::Cancelled) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }

    thread::sleep(Duration::from_millis(1_100));
    assert!(!ran.load(Ordering::SeqCst), "cancelled task still ran");

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn cancel_after_completion_is_a_noop() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let scheduled = event_loop.schedule(TimeAmount::milliseconds(10), || Ok(7));
    assert_eq!(scheduled.future_result().wait().unwrap(), 7);

    scheduled.cancel();
    assert_eq!(scheduled.future_result().wait().unwrap(), 7);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn same_delay_tasks_run_in_submission_order() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let runs = Arc::new(Mutex::new(Vec::new()));
    let (tx, rx) = mpsc::channel();
    for i in 0..5 {
        let runs = runs.clone();
        let tx = tx.clone();
        event_loop.schedule(TimeAmount::milliseconds(20), move || {
            runs.lock().unwrap().push(i);
            tx.send(()).unwrap();
            Ok(())
        });
    }
    for _ in 0..5 {
        rx.recv_timeout(RECV_TIMEOUT).unwrap();
    }
    assert_eq!(*runs.lock().unwrap(), vec![0, 1, 2, 3, 4]);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn non_positive_delays_are_due_immediately() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let zero = event_loop.schedule(TimeAmount::ZERO, || Ok("zero"));
    let negative = event_loop.schedule(TimeAmount::milliseconds(-5), || Ok("negative"));
    assert_eq!(zero.future_result().wait().unwrap(), "zero");
    assert_eq!(negative.future_result().wait().unwrap(), "negative");

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn scheduled_task_errors_fail_the_future() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let scheduled = event_loop.schedule(
        TimeAmount::milliseconds(5),
        || -> Result<i32, LoopError> { Err(LoopError::Unsupported("not today")) },
    );
    match scheduled.future_result().wait() {
        Err(LoopError::Unsupported(reason)) => assert_eq!(reason, "not today"),
        other => panic!("unexpected outcome: {:?}", other),
    }

    group.sync_shutdown_gracefully().unwrap();
}
