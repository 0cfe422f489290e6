use std::cell::Cell;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nevio::channel::{Channel, ChannelKind, ChannelRef};
use nevio::selector::ChannelInterest;
use nevio::{EventLoop, EventLoopGroup, LoopError};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// State Under Test: an immediate task submitted from a non-loop thread.
///
/// Expected Behavior: the task runs on the loop within bounded time.
#[test]
fn execute_runs_the_task_from_a_foreign_thread() {
    let _ = env_logger::builder().is_test(true).try_init();
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let (tx, rx) = mpsc::channel();
    event_loop.execute(move || {
        tx.send(1).unwrap();
    });
    assert_eq!(rx.recv_timeout(RECV_TIMEOUT).unwrap(), 1);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn in_event_loop_is_true_only_on_the_worker_thread() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    assert!(!event_loop.in_event_loop());

    let probe = event_loop.clone();
    let on_loop = event_loop
        .submit(move || Ok(probe.in_event_loop()))
        .wait()
        .unwrap();
    assert!(on_loop);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn current_returns_the_driving_loop() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    assert!(EventLoop::try_current().is_none());

    let expected = event_loop.name().to_string();
    let observed = event_loop
        .submit(move || Ok(EventLoop::current().name().to_string()))
        .wait()
        .unwrap();
    assert_eq!(observed, expected);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn tasks_from_one_thread_run_in_submission_order() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
        let seen = seen.clone();
        event_loop.execute(move || {
            seen.lock().unwrap().push(i);
        });
    }
    let after = event_loop.submit(|| Ok(()));
    after.wait().unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (0..100).collect::<Vec<_>>());

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn submit_propagates_values_and_errors() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    assert_eq!(event_loop.submit(|| Ok("value")).wait().unwrap(), "value");
    match event_loop
        .submit(|| -> Result<i32, LoopError> { Err(LoopError::Unsupported("nope")) })
        .wait()
    {
        Err(LoopError::Unsupported("nope")) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn submit_panics_are_trapped_into_failures() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    match event_loop
        .submit(|| -> Result<i32, LoopError> { panic!("task exploded") })
        .wait()
    {
        Err(LoopError::TaskPanic(message)) => assert!(message.contains("task exploded")),
        other => panic!("unexpected outcome: {:?}", other),
    }

    // The loop survived the panic.
    assert_eq!(event_loop.submit(|| Ok(2)).wait().unwrap(), 2);

    group.sync_shutdown_gracefully().unwrap();
}

/// A connected test channel over one end of a `UnixStream` pair. Reads are
/// drained to `WouldBlock` because readiness is edge-style.
struct PipeChannel {
    stream: UnixStream,
    received: Arc<Mutex<Vec<u8>>>,
    notify: mpsc::Sender<usize>,
    open: Cell<bool>,
}

impl PipeChannel {
    fn new(
        stream: UnixStream,
        received: Arc<Mutex<Vec<u8>>>,
        notify: mpsc::Sender<usize>,
    ) -> PipeChannel {
        PipeChannel {
            stream,
            received,
            notify,
            open: Cell::new(true),
        }
    }
}

impl Channel for PipeChannel {
    fn is_open(&self) -> bool {
        self.open.get()
    }

    fn readable(&self) {
        let mut buf = [0u8; 256];
        loop {
            match (&self.stream).read(&mut buf) {
                Ok(0) => {
                    self.open.set(false);
                    break;
                }
                Ok(n) => {
                    self.received.lock().unwrap().extend_from_slice(&buf[..n]);
                    let _ = self.notify.send(n);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.open.set(false);
                    break;
                }
            }
        }
    }

    fn writable(&self) {}

    fn selectable_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn interest(&self) -> ChannelInterest {
        ChannelInterest::Read
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Connected
    }
}

#[test]
fn registered_channel_receives_readable_dispatch() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let (near, mut far) = UnixStream::pair().unwrap();
    near.set_nonblocking(true).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let (notify_tx, notify_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();

    let received_in_channel = received.clone();
    event_loop.execute(move || {
        let channel: ChannelRef =
            Rc::new(PipeChannel::new(near, received_in_channel, notify_tx));
        EventLoop::current().register(channel).unwrap();
        ready_tx.send(()).unwrap();
    });
    ready_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    far.write_all(b"hello").unwrap();

    assert_eq!(notify_rx.recv_timeout(RECV_TIMEOUT).unwrap(), 5);
    assert_eq!(*received.lock().unwrap(), b"hello".to_vec());

    // Closing the far end reports EOF; the channel marks itself closed and
    // the loop deregisters it without falling over.
    drop(far);
    std::thread::sleep(Duration::from_millis(100));

    group.sync_shutdown_gracefully().unwrap();
}

/// State Under Test: a task that perpetually re-submits itself.
///
/// Expected Behavior: I/O dispatch still happens; the pump cannot starve
/// the selector.
#[test]
fn self_resubmitting_task_does_not_starve_io() {
    fn pump(event_loop: &EventLoop, stop: &Arc<AtomicBool>, ticks: &Arc<AtomicUsize>) {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        ticks.fetch_add(1, Ordering::SeqCst);
        let next_loop = event_loop.clone();
        let next_stop = stop.clone();
        let next_ticks = ticks.clone();
        event_loop.execute(move || pump(&next_loop, &next_stop, &next_ticks));
    }

    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    let (near, mut far) = UnixStream::pair().unwrap();
    near.set_nonblocking(true).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let (notify_tx, notify_rx) = mpsc::channel();
    let (ready_tx, ready_rx) = mpsc::channel();
    let received_in_channel = received.clone();
    event_loop.execute(move || {
        let channel: ChannelRef =
            Rc::new(PipeChannel::new(near, received_in_channel, notify_tx));
        EventLoop::current().register(channel).unwrap();
        ready_tx.send(()).unwrap();
    });
    ready_rx.recv_timeout(RECV_TIMEOUT).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let ticks = Arc::new(AtomicUsize::new(0));
    {
        let event_loop = event_loop.clone();
        let stop = stop.clone();
        let ticks = ticks.clone();
        event_loop
            .clone()
            .execute(move || pump(&event_loop, &stop, &ticks));
    }

    far.write_all(b"x").unwrap();
    assert_eq!(notify_rx.recv_timeout(RECV_TIMEOUT).unwrap(), 1);

    stop.store(true, Ordering::SeqCst);
    assert!(ticks.load(Ordering::SeqCst) > 0);

    group.sync_shutdown_gracefully().unwrap();
}

#[test]
fn close_gently_rejects_a_second_close() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    assert!(event_loop.close_gently().wait().is_ok());
    match event_loop.close_gently().wait() {
        Err(LoopError::AlreadyClosed) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }

    // The group tears the closing loop down on drop.
}

#[test]
fn submissions_after_close_fail_with_shutdown() {
    let group = EventLoopGroup::new(1).unwrap();
    let event_loop = group.next();

    event_loop.close_gently().wait().unwrap();

    match event_loop.submit(|| Ok(1)).wait() {
        Err(LoopError::Shutdown) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }

    let scheduled = event_loop.schedule(nevio::TimeAmount::milliseconds(1), || Ok(1));
    match scheduled.future_result().wait() {
        Err(LoopError::Shutdown) => {}
        other => panic!("unexpected outcome: {:?}", other),
    }

    // Fire-and-forget submissions are dropped silently.
    event_loop.execute(|| panic!("must never run"));
}
