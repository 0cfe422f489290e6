//! The single-threaded run loop and its submission surface.
//!
//! An [`EventLoop`] owns one worker thread, one selector and one timer
//! queue. Everything the loop executes — I/O handlers, immediate tasks,
//! scheduled tasks, future callbacks — runs sequentially on that one thread
//! with no preemption, so loop-bound code never needs locks of its own.
//! Tasks must not block: a blocked task stalls every channel on the loop.
//!
//! Each tick of the loop performs three steps:
//!
//! 1. pick a wait strategy from the nearest timer deadline (block forever,
//!    poll, or block until the deadline),
//! 2. wait on the selector and dispatch readiness to channels,
//! 3. drain all scheduled tasks that are due.
//!
//! Cross-thread submissions interrupt a blocked wait through the selector's
//! wakeup handle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use crate::channel::{ChannelKind, ChannelRef};
use crate::error::{panic_message, LoopError};
use crate::future::{EventFuture, Promise};
use crate::scheduled::{Scheduled, ScheduledTask, TimerQueue};
use crate::selector::{ChannelId, PollSelector, Readiness, Selector, SelectorEvent, WaitStrategy, Wakeup};
use crate::time::TimeAmount;

/// Invoked after a worker thread starts or before it stops.
pub(crate) type ThreadCallback = Arc<dyn Fn() + Send + Sync>;

/// Per-loop configuration assembled by the group builder.
pub(crate) struct LoopConfig {
    pub(crate) index: usize,
    pub(crate) name: String,
    pub(crate) stack_size: Option<usize>,
    pub(crate) after_start: Option<ThreadCallback>,
    pub(crate) before_stop: Option<ThreadCallback>,
}

/// Lifecycle of a loop. Transitions are monotonic:
/// `Open` → `Closing` → `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopState {
    Open,
    Closing,
    Closed,
}

struct Shared {
    queue: TimerQueue,
    state: LoopState,
    next_task_id: u64,
}

struct Inner {
    index: usize,
    name: String,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
    wakeup: Arc<dyn Wakeup>,
    shared: Mutex<Shared>,
    /// Promises created against this loop and not yet resolved; reported
    /// at loop termination as a leak diagnostic.
    pending_promises: AtomicUsize,
}

/// Handle to a single event loop.
///
/// The handle is cheap to clone and safe to use from any thread; only
/// channel registration demands the loop's own thread. Loops are created
/// through an [`EventLoopGroup`](crate::group::EventLoopGroup).
pub struct EventLoop {
    inner: Arc<Inner>,
}

impl Clone for EventLoop {
    fn clone(&self) -> EventLoop {
        EventLoop {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.inner.name)
            .field("index", &self.inner.index)
            .finish()
    }
}

struct Registration {
    channel: ChannelRef,
    kind: ChannelKind,
}

/// The worker-thread-only half of a loop: the selector and the channel
/// registry. Reached through the thread-local context.
struct LoopCore {
    selector: Box<dyn Selector>,
    channels: HashMap<ChannelId, Registration>,
    by_fd: HashMap<RawFd, ChannelId>,
}

struct CurrentLoop {
    handle: EventLoop,
    core: Rc<RefCell<LoopCore>>,
}

thread_local! {
    /// The loop driving the current thread, if any.
    static CURRENT: RefCell<Option<CurrentLoop>> = RefCell::new(None);
}

impl EventLoop {
    /// Spawns the worker thread and returns the loop handle.
    pub(crate) fn spawn(config: LoopConfig) -> io::Result<EventLoop> {
        let selector = PollSelector::new()?;
        let wakeup = selector.wakeup_handle();

        // The worker needs its own handle, which cannot exist until the
        // join handle does; it is passed in through a rendezvous channel.
        let (handle_tx, handle_rx) = mpsc::channel::<EventLoop>();
        let after_start = config.after_start.clone();
        let before_stop = config.before_stop.clone();

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let join = builder.spawn(move || {
            let event_loop = match handle_rx.recv() {
                Ok(event_loop) => event_loop,
                Err(_) => return,
            };
            if let Some(callback) = after_start {
                callback();
            }
            run_loop(&event_loop, Box::new(selector));
            if let Some(callback) = before_stop {
                callback();
            }
        })?;

        let inner = Arc::new(Inner {
            index: config.index,
            name: config.name,
            thread_id: join.thread().id(),
            join: Mutex::new(Some(join)),
            wakeup,
            shared: Mutex::new(Shared {
                queue: TimerQueue::new(),
                state: LoopState::Open,
                next_task_id: 0,
            }),
            pending_promises: AtomicUsize::new(0),
        });
        let event_loop = EventLoop { inner };
        let _ = handle_tx.send(event_loop.clone());
        Ok(event_loop)
    }

    /// The loop driving the calling thread.
    ///
    /// # Panics
    ///
    /// Panics when the calling thread is not an event loop worker.
    pub fn current() -> EventLoop {
        match Self::try_current() {
            Some(event_loop) => event_loop,
            None => panic!("EventLoop::current() called from outside an event loop thread"),
        }
    }

    /// The loop driving the calling thread, or `None` off-loop.
    pub fn try_current() -> Option<EventLoop> {
        CURRENT.with(|current| current.borrow().as_ref().map(|c| c.handle.clone()))
    }

    /// Whether the calling thread is this loop's worker thread.
    pub fn in_event_loop(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// The loop's thread name, e.g. `nevio-loop-0`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueues a task for immediate execution on this loop.
    ///
    /// Safe to call from any thread; a cross-thread call wakes the
    /// selector. On a loop that is closing or closed the task is dropped
    /// (there is no future to fail); use [`submit`] when the outcome
    /// matters.
    ///
    /// [`submit`]: EventLoop::submit
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let accepted = self
            .enqueue_at(Instant::now(), Box::new(task), Box::new(|_| {}), false)
            .is_some();
        if !accepted {
            debug!("{}: execute() after shutdown; task dropped", self.name());
        }
    }

    /// Runs a fallible callable on this loop and returns a future of its
    /// outcome.
    ///
    /// A panic inside the callable is trapped and becomes a
    /// [`LoopError::TaskPanic`] failure. On a loop past its open window the
    /// returned future is already failed with [`LoopError::Shutdown`].
    pub fn submit<T, F>(&self, task: F) -> EventFuture<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, LoopError> + Send + 'static,
    {
        let promise = self.new_promise::<T>();
        let future = promise.future();
        let runner = promise.clone();
        let failer = promise.clone();
        let queued = self.enqueue_at(
            Instant::now(),
            Box::new(move || match panic::catch_unwind(AssertUnwindSafe(task)) {
                Ok(result) => {
                    runner.try_complete(result);
                }
                Err(payload) => {
                    runner.try_fail(LoopError::TaskPanic(panic_message(&*payload)));
                }
            }),
            Box::new(move |error| {
                failer.try_fail(error);
            }),
            false,
        );
        if queued.is_none() {
            promise.try_fail(LoopError::Shutdown);
        }
        future
    }

    /// Schedules a fallible callable to run `delay` from now.
    ///
    /// A non-positive delay is due immediately. The returned handle exposes
    /// the result future and best-effort cancellation. On a loop past its
    /// open window the future is already failed with
    /// [`LoopError::Shutdown`].
    pub fn schedule<T, F>(&self, delay: TimeAmount, task: F) -> Scheduled<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T, LoopError> + Send + 'static,
    {
        let promise = self.new_promise::<T>();
        let future = promise.future();
        let ready_time = Instant::now() + delay.as_duration();

        let runner = promise.clone();
        let failer = promise.clone();
        let queued = self.enqueue_at(
            ready_time,
            Box::new(move || {
                // A cancellation that won the race leaves the promise
                // resolved; the task is skipped, not run.
                if runner.is_resolved() {
                    return;
                }
                match panic::catch_unwind(AssertUnwindSafe(task)) {
                    Ok(result) => {
                        runner.try_complete(result);
                    }
                    Err(payload) => {
                        runner.try_fail(LoopError::TaskPanic(panic_message(&*payload)));
                    }
                }
            }),
            Box::new(move |error| {
                failer.try_fail(error);
            }),
            false,
        );
        if queued.is_none() {
            promise.try_fail(LoopError::Shutdown);
        }
        Scheduled::new(future, promise, self.clone(), queued)
    }

    /// A fresh unresolved promise bound to this loop.
    pub fn new_promise<T>(&self) -> Promise<T>
    where
        T: Send + Sync + 'static,
    {
        Promise::new(self.clone())
    }

    /// A future already succeeded with `value`, bound to this loop.
    pub fn new_succeeded_future<T>(&self, value: T) -> EventFuture<T>
    where
        T: Send + Sync + 'static,
    {
        let promise = self.new_promise();
        let future = promise.future();
        promise.try_succeed(value);
        future
    }

    /// A future already failed with `error`, bound to this loop.
    pub fn new_failed_future<T>(&self, error: LoopError) -> EventFuture<T>
    where
        T: Send + Sync + 'static,
    {
        let promise = self.new_promise();
        let future = promise.future();
        promise.try_fail(error);
        future
    }

    /// Registers a channel with this loop's selector.
    ///
    /// # Panics
    ///
    /// Panics when called from any thread but this loop's worker thread;
    /// external threads must route registration through [`execute`].
    ///
    /// [`execute`]: EventLoop::execute
    pub fn register(&self, channel: ChannelRef) -> Result<(), LoopError> {
        self.assert_in_event_loop("register");
        with_core(|core| {
            let fd = channel.selectable_fd();
            let interest = channel.interest();
            let kind = channel.kind();
            let mut core = core.borrow_mut();
            let id = core.selector.register(fd, interest)?;
            core.channels.insert(id, Registration { channel, kind });
            core.by_fd.insert(fd, id);
            trace!("{}: registered {:?} channel fd={}", self.name(), kind, fd);
            Ok(())
        })
    }

    /// Removes a channel from this loop's selector. Unknown channels are
    /// ignored, making deregistration idempotent.
    ///
    /// # Panics
    ///
    /// Panics when called off the loop thread.
    pub fn deregister(&self, channel: &ChannelRef) -> Result<(), LoopError> {
        self.assert_in_event_loop("deregister");
        with_core(|core| {
            let fd = channel.selectable_fd();
            remove_registration(&mut core.borrow_mut(), fd)?;
            trace!("{}: deregistered channel fd={}", self.name(), fd);
            Ok(())
        })
    }

    /// Re-declares a channel's interest set with the selector.
    ///
    /// # Panics
    ///
    /// Panics when called off the loop thread.
    pub fn reregister(&self, channel: &ChannelRef) -> Result<(), LoopError> {
        self.assert_in_event_loop("reregister");
        with_core(|core| {
            let fd = channel.selectable_fd();
            let interest = channel.interest();
            let mut core = core.borrow_mut();
            let id = match core.by_fd.get(&fd) {
                Some(id) => *id,
                None => return Err(LoopError::Unsupported("channel is not registered")),
            };
            core.selector.reregister(fd, id, interest)?;
            Ok(())
        })
    }

    /// Begins a gentle close: the loop stops accepting work, drains its
    /// channels, and the returned future resolves once the drain is done.
    ///
    /// The loop keeps running (serving already-queued work) until it is
    /// terminated by its group's shutdown. Calling this on a loop that is
    /// not open yields a future failed with [`LoopError::AlreadyClosed`].
    pub fn close_gently(&self) -> EventFuture<()> {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            match shared.state {
                LoopState::Open => shared.state = LoopState::Closing,
                LoopState::Closing | LoopState::Closed => {
                    drop(shared);
                    return self.new_failed_future(LoopError::AlreadyClosed);
                }
            }
        }
        debug!("{}: closing gently", self.name());

        let promise = self.new_promise::<()>();
        let future = promise.future();
        let on_drain = promise.clone();
        let on_fail = promise.clone();
        let queued = self.enqueue_at(
            Instant::now(),
            Box::new(move || match drain_current_channels() {
                Ok(()) => {
                    on_drain.try_succeed(());
                }
                Err(error) => {
                    on_drain.try_fail(LoopError::from(error));
                }
            }),
            Box::new(move |error| {
                on_fail.try_fail(error);
            }),
            true,
        );
        if queued.is_none() {
            promise.try_fail(LoopError::Shutdown);
        }
        future
    }

    /// Drains this loop and terminates it, invoking `callback` with the
    /// outcome.
    ///
    /// The callback is delivered off-loop, on a dedicated thread — the loop
    /// cannot announce its own death through its own futures.
    pub fn shutdown_gracefully<F>(&self, callback: F)
    where
        F: FnOnce(Result<(), LoopError>) + Send + 'static,
    {
        let event_loop = self.clone();
        thread::Builder::new()
            .name(format!("{}-shutdown", self.name()))
            .spawn(move || {
                let outcome = event_loop.shutdown_blocking();
                callback(outcome);
            })
            .expect("failed to spawn shutdown thread");
    }

    pub(crate) fn shutdown_blocking(&self) -> Result<(), LoopError> {
        let drain_error = self.close_gently().wait().err();
        self.terminate()?;
        match drain_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Moves the loop to `Closed`, wakes it, and joins the worker thread.
    /// Idempotent; must not be called from the loop thread itself.
    pub(crate) fn terminate(&self) -> Result<(), LoopError> {
        debug_assert!(!self.in_event_loop(), "terminate() would join the current thread");
        {
            let mut shared = self.inner.shared.lock().unwrap();
            shared.state = LoopState::Closed;
        }
        self.wake();
        let join = self.inner.join.lock().unwrap().take();
        match join {
            Some(handle) => handle.join().map_err(|_| LoopError::ShutdownFailed),
            None => Ok(()),
        }
    }

    /// Queues a task, waking the selector on cross-thread submission.
    ///
    /// `while_closing` admits internal work (future-callback delivery, the
    /// gentle-close drain) into a loop that no longer accepts user
    /// submissions. Returns the task id, or `None` when the loop refused
    /// the task.
    pub(crate) fn enqueue_at(
        &self,
        ready_time: Instant,
        run: Box<dyn FnOnce() + Send>,
        fail: Box<dyn FnOnce(LoopError) + Send>,
        while_closing: bool,
    ) -> Option<u64> {
        let id = {
            let mut shared = self.inner.shared.lock().unwrap();
            let accepted = match shared.state {
                LoopState::Open => true,
                LoopState::Closing => while_closing,
                LoopState::Closed => false,
            };
            if !accepted {
                return None;
            }
            let id = shared.next_task_id;
            shared.next_task_id += 1;
            shared.queue.push(ScheduledTask {
                id,
                ready_time,
                run,
                fail,
            });
            id
        };
        if !self.in_event_loop() {
            self.wake();
        }
        Some(id)
    }

    /// Queues an immediate task; reports only acceptance.
    pub(crate) fn enqueue_now(
        &self,
        run: Box<dyn FnOnce() + Send>,
        fail: Box<dyn FnOnce(LoopError) + Send>,
        while_closing: bool,
    ) -> bool {
        self.enqueue_at(Instant::now(), run, fail, while_closing).is_some()
    }

    /// Removes a scheduled task after its cancellation and wakes the loop
    /// so the wait strategy reflects the new earliest deadline.
    pub(crate) fn remove_scheduled(&self, id: u64) {
        let removed = {
            let mut shared = self.inner.shared.lock().unwrap();
            shared.queue.remove(id)
        };
        drop(removed);
        if !self.in_event_loop() {
            self.wake();
        }
    }

    pub(crate) fn promise_created(&self) {
        self.inner.pending_promises.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn promise_resolved(&self) {
        self.inner.pending_promises.fetch_sub(1, Ordering::Relaxed);
    }

    /// Interrupts the selector wait. A failed wakeup aborts the process:
    /// the loop can no longer honor cross-thread submissions, and that is
    /// an invariant it cannot recover from.
    fn wake(&self) {
        if let Err(error) = self.inner.wakeup.wakeup() {
            error!("{}: selector wakeup failed: {}; aborting", self.name(), error);
            std::process::abort();
        }
    }

    fn assert_in_event_loop(&self, operation: &str) {
        assert!(
            self.in_event_loop(),
            "{} must be called on the event loop thread ({})",
            operation,
            self.inner.name
        );
    }

    /// Picks the wait strategy for the next tick, or `None` once the loop
    /// has been closed.
    fn next_strategy(&self) -> Option<WaitStrategy> {
        let shared = self.inner.shared.lock().unwrap();
        if shared.state == LoopState::Closed {
            return None;
        }
        if shared.queue.is_empty() {
            return Some(WaitStrategy::Block);
        }
        match shared.queue.peek_deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    Some(WaitStrategy::PollNow)
                } else {
                    Some(WaitStrategy::BlockFor(TimeAmount::from(deadline - now)))
                }
            }
            None => Some(WaitStrategy::Block),
        }
    }

    /// Runs every task that is due, re-entering until no freshly due task
    /// remains.
    ///
    /// `now` is snapshotted once for the whole pass: tasks enqueued during
    /// execution carry later ready times and wait for the next tick, which
    /// keeps a self-resubmitting task from starving I/O dispatch.
    fn drain_ready_tasks(&self) {
        let pass_now = Instant::now();
        loop {
            let mut batch: Vec<ScheduledTask> = Vec::new();
            {
                let mut shared = self.inner.shared.lock().unwrap();
                while shared
                    .queue
                    .peek_deadline()
                    .map_or(false, |deadline| deadline <= pass_now)
                {
                    match shared.queue.pop() {
                        Some(task) => batch.push(task),
                        None => break,
                    }
                }
            }
            if batch.is_empty() {
                return;
            }
            for task in batch {
                let ScheduledTask { run, .. } = task;
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(run)) {
                    error!("{}: task panicked: {}", self.name(), panic_message(&*payload));
                }
            }
        }
    }

    /// Fails every task still queued at loop termination.
    fn fail_pending_tasks(&self) {
        let drained = {
            let mut shared = self.inner.shared.lock().unwrap();
            let remaining = shared.queue.len();
            if remaining > 0 {
                debug!("{}: failing {} tasks still queued at shutdown", self.name(), remaining);
            }
            shared.queue.drain()
        };
        for task in drained {
            let ScheduledTask { fail, .. } = task;
            if let Err(payload) =
                panic::catch_unwind(AssertUnwindSafe(move || fail(LoopError::Shutdown)))
            {
                error!(
                    "{}: shutdown callback panicked: {}",
                    self.name(),
                    panic_message(&*payload)
                );
            }
        }
    }
}

/// Accesses the current thread's loop core. Callers must already have
/// proven loop affinity.
fn with_core<R>(f: impl FnOnce(&Rc<RefCell<LoopCore>>) -> R) -> R {
    CURRENT.with(|current| {
        let current = current.borrow();
        let current = current
            .as_ref()
            .expect("loop core accessed outside the event loop thread");
        f(&current.core)
    })
}

fn remove_registration(core: &mut LoopCore, fd: RawFd) -> Result<(), LoopError> {
    let id = match core.by_fd.remove(&fd) {
        Some(id) => id,
        None => return Ok(()),
    };
    core.channels.remove(&id);
    core.selector.deregister(fd, id)?;
    Ok(())
}

/// Deregisters every channel on the calling loop thread; the gentle-close
/// drain step.
fn drain_current_channels() -> io::Result<()> {
    with_core(|core| {
        let mut core = core.borrow_mut();
        let drained = core.channels.len();
        if drained > 0 {
            trace!("draining {} channels on gentle close", drained);
        }
        core.channels.clear();
        core.by_fd.clear();
        core.selector.close_gently()
    })
}

/// The worker thread body.
fn run_loop(event_loop: &EventLoop, selector: Box<dyn Selector>) {
    trace!("{}: event loop started", event_loop.name());
    let core = Rc::new(RefCell::new(LoopCore {
        selector,
        channels: HashMap::new(),
        by_fd: HashMap::new(),
    }));
    CURRENT.with(|current| {
        *current.borrow_mut() = Some(CurrentLoop {
            handle: event_loop.clone(),
            core: core.clone(),
        });
    });

    // Scratch buffer reused across ticks.
    let mut ready: Vec<SelectorEvent> = Vec::with_capacity(64);

    loop {
        let strategy = match event_loop.next_strategy() {
            Some(strategy) => strategy,
            None => break,
        };

        ready.clear();
        let waited = core.borrow_mut().selector.wait(strategy, &mut ready);
        if let Err(error) = waited {
            // Anything the selector did not absorb itself means the
            // readiness primitive is corrupt; the loop cannot go on.
            error!("{}: selector wait failed: {}", event_loop.name(), error);
            break;
        }

        for event in &ready {
            dispatch_event(event_loop, &core, event);
        }

        event_loop.drain_ready_tasks();
    }

    // The state is normally `Closed` already; a fatal selector error exits
    // the loop directly, and submissions must stop landing in the queue
    // before it is drained for the last time.
    {
        let mut shared = event_loop.inner.shared.lock().unwrap();
        shared.state = LoopState::Closed;
    }

    // Termination: everything still queued fails with a shutdown error.
    // This runs on the loop thread, so future callbacks registered on the
    // failing tasks are delivered synchronously, in-affinity.
    event_loop.fail_pending_tasks();

    {
        let mut core = core.borrow_mut();
        if let Err(error) = core.selector.close_gently() {
            debug!("{}: deregistration at shutdown failed: {}", event_loop.name(), error);
        }
        core.channels.clear();
        core.by_fd.clear();
        if let Err(error) = core.selector.close() {
            debug!("{}: selector close failed: {}", event_loop.name(), error);
        }
    }
    CURRENT.with(|current| {
        *current.borrow_mut() = None;
    });

    let leaked = event_loop.inner.pending_promises.load(Ordering::Relaxed);
    if leaked > 0 {
        debug!(
            "{}: {} promises never resolved at loop termination",
            event_loop.name(),
            leaked
        );
    }
    debug!("{}: event loop terminated", event_loop.name());
}

/// Routes one readiness event to its channel, honoring the write-then-read
/// order for dual readiness and dropping channels that report closed.
fn dispatch_event(event_loop: &EventLoop, core: &Rc<RefCell<LoopCore>>, event: &SelectorEvent) {
    let target = core
        .borrow()
        .channels
        .get(&event.id)
        .map(|registration| registration.channel.clone());
    let channel = match target {
        Some(channel) => channel,
        // Deregistered earlier in this tick; skip the stale event.
        None => return,
    };

    let dispatched = panic::catch_unwind(AssertUnwindSafe(|| match event.readiness {
        Readiness::Read => channel.readable(),
        Readiness::Write => channel.writable(),
        Readiness::Both => {
            channel.writable();
            if channel.is_open() {
                channel.readable();
            }
        }
        Readiness::None => {}
    }));
    if let Err(payload) = dispatched {
        error!(
            "{}: channel handler panicked: {}",
            event_loop.name(),
            panic_message(&*payload)
        );
    }

    if !channel.is_open() {
        let fd = channel.selectable_fd();
        if let Err(error) = remove_registration(&mut core.borrow_mut(), fd) {
            debug!(
                "{}: deregistering closed channel fd={} failed: {}",
                event_loop.name(),
                fd,
                error
            );
        } else {
            trace!("{}: channel fd={} closed; deregistered", event_loop.name(), fd);
        }
    }
}
