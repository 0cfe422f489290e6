//! Fixed-size collections of event loops and group-wide shutdown.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use crate::error::LoopError;
use crate::eventloop::{EventLoop, LoopConfig, ThreadCallback};

/// Thread names carry the loop index reduced to this bound, keeping them
/// within the platform's name-length limit.
const MAX_NAMED_INDEX: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Open,
    ShuttingDown,
    Closed,
}

struct GroupInner {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
    state: Mutex<GroupState>,
}

/// A fixed-size set of event loops, each with its own worker thread.
///
/// Loops are handed out in round-robin order by [`next`]; the distribution
/// over `K` calls gives every loop either `⌊K/N⌋` or `⌈K/N⌉` of them. The
/// group never resizes and does not steal work between loops.
///
/// Dropping a group that was never shut down closes it abruptly: queued
/// tasks fail with [`LoopError::Shutdown`] and worker threads are joined.
///
/// [`next`]: EventLoopGroup::next
pub struct EventLoopGroup {
    inner: Arc<GroupInner>,
}

impl Clone for EventLoopGroup {
    fn clone(&self) -> EventLoopGroup {
        EventLoopGroup {
            inner: self.inner.clone(),
        }
    }
}

impl fmt::Debug for EventLoopGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopGroup")
            .field("loops", &self.inner.loops.len())
            .finish()
    }
}

impl EventLoopGroup {
    /// Creates a group of `threads` loops with default settings.
    pub fn new(threads: usize) -> io::Result<EventLoopGroup> {
        Builder::new().threads(threads).build()
    }

    /// A builder for customizing thread count, naming and thread hooks.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The number of loops in this group.
    pub fn len(&self) -> usize {
        self.inner.loops.len()
    }

    /// Whether the group holds no loops. Always false for built groups.
    pub fn is_empty(&self) -> bool {
        self.inner.loops.is_empty()
    }

    /// Returns the next loop in round-robin order.
    pub fn next(&self) -> EventLoop {
        let index = self.inner.next.fetch_add(1, Ordering::Relaxed);
        self.inner.loops[index % self.inner.loops.len()].clone()
    }

    /// Shuts the whole group down gracefully and delivers the outcome to
    /// `callback` on a dedicated thread.
    ///
    /// Every loop is asked to close gently; once all drains have resolved,
    /// each loop is terminated and joined. The callback fires exactly once
    /// with `Ok(())`, the first captured drain error, or
    /// [`LoopError::ShutdownFailed`] when a final close step failed. After
    /// completion no further submitted task runs; new submissions yield
    /// futures failed with [`LoopError::Shutdown`].
    pub fn shutdown_gracefully<F>(&self, callback: F)
    where
        F: FnOnce(Result<(), LoopError>) + Send + 'static,
    {
        let group = self.clone();
        thread::Builder::new()
            .name("nevio-shutdown".to_string())
            .spawn(move || {
                let outcome = group.shutdown_blocking();
                callback(outcome);
            })
            .expect("failed to spawn shutdown thread");
    }

    /// Blocking variant of [`shutdown_gracefully`].
    ///
    /// # Panics
    ///
    /// Panics when called from one of the group's own loop threads, which
    /// could never complete.
    ///
    /// [`shutdown_gracefully`]: EventLoopGroup::shutdown_gracefully
    pub fn sync_shutdown_gracefully(&self) -> Result<(), LoopError> {
        for event_loop in &self.inner.loops {
            assert!(
                !event_loop.in_event_loop(),
                "sync_shutdown_gracefully() called from an event loop thread"
            );
        }
        self.shutdown_blocking()
    }

    fn shutdown_blocking(&self) -> Result<(), LoopError> {
        {
            let mut state = self.inner.state.lock().unwrap();
            match *state {
                GroupState::Open => *state = GroupState::ShuttingDown,
                GroupState::ShuttingDown | GroupState::Closed => {
                    return Err(LoopError::AlreadyClosed)
                }
            }
        }
        debug!("shutting down event loop group ({} loops)", self.inner.loops.len());

        // Drain completions arrive on the loops being shut down, so they
        // are collected through an off-loop channel acting as a countdown.
        let (drained_tx, drained_rx) = mpsc::channel::<Option<LoopError>>();
        for event_loop in &self.inner.loops {
            let drained_tx = drained_tx.clone();
            event_loop.close_gently().when_complete(move |outcome| {
                let _ = drained_tx.send(outcome.as_ref().err().cloned());
            });
        }
        drop(drained_tx);

        let mut first_error: Option<LoopError> = None;
        while let Ok(outcome) = drained_rx.recv() {
            if let Some(error) = outcome {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }

        let mut close_failed = false;
        for event_loop in &self.inner.loops {
            if event_loop.terminate().is_err() {
                close_failed = true;
            }
        }

        {
            let mut state = self.inner.state.lock().unwrap();
            *state = GroupState::Closed;
        }
        debug!("event loop group shut down");

        if close_failed {
            Err(LoopError::ShutdownFailed)
        } else {
            match first_error {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        let state = *self.state.get_mut().unwrap();
        if state == GroupState::Closed {
            return;
        }
        debug!("event loop group dropped while open; closing abruptly");
        for event_loop in &self.loops {
            let _ = event_loop.terminate();
        }
    }
}

/// Configures and builds an [`EventLoopGroup`].
///
/// ```no_run
/// use nevio::EventLoopGroup;
///
/// let group = EventLoopGroup::builder()
///     .threads(2)
///     .name("acceptor")
///     .build()
///     .unwrap();
/// ```
pub struct Builder {
    threads: Option<usize>,
    name: String,
    stack_size: Option<usize>,
    after_start: Option<ThreadCallback>,
    before_stop: Option<ThreadCallback>,
}

impl Builder {
    /// A builder with default settings.
    pub fn new() -> Builder {
        Builder {
            threads: None,
            name: "nevio-loop".to_string(),
            stack_size: None,
            after_start: None,
            before_stop: None,
        }
    }

    /// The number of loops (and worker threads) to create.
    ///
    /// Defaults to the number of physical CPU cores.
    pub fn threads(mut self, threads: usize) -> Builder {
        assert_ne!(threads, 0, "thread count cannot be zero");
        self.threads = Some(threads);
        self
    }

    /// The worker thread name prefix; the loop index is appended.
    pub fn name(mut self, name: impl Into<String>) -> Builder {
        self.name = name.into();
        self
    }

    /// Stack size for each worker thread.
    pub fn stack_size(mut self, stack_size: usize) -> Builder {
        self.stack_size = Some(stack_size);
        self
    }

    /// Callback to run on each worker thread right after it starts.
    pub fn on_thread_start<F>(mut self, f: F) -> Builder
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.after_start = Some(Arc::new(f));
        self
    }

    /// Callback to run on each worker thread just before it stops.
    pub fn on_thread_stop<F>(mut self, f: F) -> Builder
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.before_stop = Some(Arc::new(f));
        self
    }

    /// Spawns the loops and returns the group.
    pub fn build(self) -> io::Result<EventLoopGroup> {
        let threads = self
            .threads
            .unwrap_or_else(|| usize::max(1, num_cpus::get_physical()));

        let mut loops = Vec::with_capacity(threads);
        for index in 0..threads {
            let config = LoopConfig {
                index,
                name: format!("{}-{}", self.name, index % MAX_NAMED_INDEX),
                stack_size: self.stack_size,
                after_start: self.after_start.clone(),
                before_stop: self.before_stop.clone(),
            };
            match EventLoop::spawn(config) {
                Ok(event_loop) => loops.push(event_loop),
                Err(error) => {
                    // Unwind the loops spawned so far before reporting.
                    for event_loop in &loops {
                        let _ = event_loop.terminate();
                    }
                    return Err(error);
                }
            }
        }

        Ok(EventLoopGroup {
            inner: Arc::new(GroupInner {
                loops,
                next: AtomicUsize::new(0),
                state: Mutex::new(GroupState::Open),
            }),
        })
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("threads", &self.threads)
            .field("name", &self.name)
            .field("stack_size", &self.stack_size)
            .field("after_start", &self.after_start.as_ref().map(|_| "..."))
            .field("before_stop", &self.before_stop.as_ref().map(|_| "..."))
            .finish()
    }
}
