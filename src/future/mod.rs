//! Single-assignment result cells with callback chaining.
//!
//! A [`Promise`] is the write side of an asynchronous result: it is
//! fulfilled exactly once, with a value or a [`LoopError`]. An
//! [`EventFuture`] is the read side: it carries an append-only list of
//! callbacks which all execute on the future's bound event loop, in
//! registration order.
//!
//! # Callback delivery
//!
//! When a promise resolves, the callback list is detached from the cell and
//! delivered as one batch. If the resolving thread *is* the bound loop's
//! thread the batch runs synchronously within the current tick; otherwise it
//! is posted to the loop as an immediate task. Callbacks registered after
//! resolution follow the same rule. Detaching the list at resolution time
//! also breaks the retention cycles that cross-cascaded futures would
//! otherwise form.
//!
//! Combinators never panic across the chain: a panic inside a `map` or
//! `flat_map` closure is trapped and becomes a [`LoopError::TaskPanic`]
//! failure of the derived future.

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::{panic_message, LoopError};
use crate::eventloop::EventLoop;

/// A callback as stored in the cell: it receives the shared outcome.
type RawCallback<T> = Box<dyn FnOnce(Arc<Result<T, LoopError>>) + Send>;

enum CellState<T> {
    Pending(Vec<RawCallback<T>>),
    Resolved(Arc<Result<T, LoopError>>),
}

struct FutureInner<T> {
    executor: EventLoop,
    cell: Mutex<CellState<T>>,
    resolved: Condvar,
}

/// The write side of an asynchronous result, bound to one event loop.
///
/// A promise is fulfilled at most once; the transition out of the pending
/// state is irreversible. Attempting a second resolution through the public
/// API is a contract violation: it trips a `debug_assert!` in debug builds
/// and is ignored (with an error log) in release builds.
///
/// Clones of a promise all write the same cell; the first resolution wins.
pub struct Promise<T> {
    inner: Arc<FutureInner<T>>,
}

/// The read side of a [`Promise`]: register callbacks, derive new futures,
/// or block for the outcome at a shutdown boundary.
pub struct EventFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Promise<T> {
        Promise {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for EventFuture<T> {
    fn clone(&self) -> EventFuture<T> {
        EventFuture {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> FutureInner<T> {
    /// Appends a callback, or delivers it immediately when already resolved.
    fn add_callback(&self, cb: RawCallback<T>) {
        let mut cell = self.cell.lock().unwrap();
        match &mut *cell {
            CellState::Pending(callbacks) => callbacks.push(cb),
            CellState::Resolved(outcome) => {
                let outcome = outcome.clone();
                drop(cell);
                deliver(&self.executor, vec![cb], outcome);
            }
        }
    }

    /// Moves the cell to resolved and returns the detached callbacks, or
    /// `None` when a resolution already happened.
    fn transition(&self, outcome: &Arc<Result<T, LoopError>>) -> Option<Vec<RawCallback<T>>> {
        let mut cell = self.cell.lock().unwrap();
        match &mut *cell {
            CellState::Pending(callbacks) => {
                let callbacks = mem::replace(callbacks, Vec::new());
                *cell = CellState::Resolved(outcome.clone());
                Some(callbacks)
            }
            CellState::Resolved(_) => None,
        }
    }
}

/// Runs a detached callback batch under the delivery rule: synchronously on
/// the bound loop thread, otherwise posted as an immediate task. When the
/// loop can no longer accept tasks the batch runs on the calling thread so
/// that no callback is ever lost.
fn deliver<T: Send + Sync + 'static>(
    executor: &EventLoop,
    callbacks: Vec<RawCallback<T>>,
    outcome: Arc<Result<T, LoopError>>,
) {
    if callbacks.is_empty() {
        return;
    }
    if executor.in_event_loop() {
        for cb in callbacks {
            cb(outcome.clone());
        }
        return;
    }

    // The batch is shared between the task body and the task's failure
    // path: whichever fires first takes it, so delivery happens exactly
    // once even when the loop terminates mid-shutdown.
    let batch = Arc::new(Mutex::new(Some((callbacks, outcome))));
    let run_batch = batch.clone();
    let fail_batch = batch.clone();
    let posted = executor.enqueue_now(
        Box::new(move || {
            if let Some((callbacks, outcome)) = run_batch.lock().unwrap().take() {
                for cb in callbacks {
                    cb(outcome.clone());
                }
            }
        }),
        Box::new(move |_err| {
            // Loop-exit drain runs on the loop thread, so affinity holds.
            if let Some((callbacks, outcome)) = fail_batch.lock().unwrap().take() {
                for cb in callbacks {
                    cb(outcome.clone());
                }
            }
        }),
        true,
    );
    if !posted {
        debug!(
            "{}: loop closed; delivering future callbacks on the resolving thread",
            executor.name()
        );
        if let Some((callbacks, outcome)) = batch.lock().unwrap().take() {
            for cb in callbacks {
                cb(outcome.clone());
            }
        }
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    pub(crate) fn new(executor: EventLoop) -> Promise<T> {
        executor.promise_created();
        Promise {
            inner: Arc::new(FutureInner {
                executor,
                cell: Mutex::new(CellState::Pending(Vec::new())),
                resolved: Condvar::new(),
            }),
        }
    }

    /// The read side of this promise.
    pub fn future(&self) -> EventFuture<T> {
        EventFuture {
            inner: self.inner.clone(),
        }
    }

    /// The event loop this promise's callbacks execute on.
    pub fn executor(&self) -> &EventLoop {
        &self.inner.executor
    }

    /// Fulfills the promise with a value.
    pub fn succeed(&self, value: T) {
        self.resolve(Arc::new(Ok(value)), true);
    }

    /// Fails the promise with an error.
    pub fn fail(&self, error: LoopError) {
        self.resolve(Arc::new(Err(error)), true);
    }

    /// Fulfills or fails the promise from a `Result`.
    pub fn complete_with(&self, result: Result<T, LoopError>) {
        self.resolve(Arc::new(result), true);
    }

    pub(crate) fn try_succeed(&self, value: T) -> bool {
        self.resolve(Arc::new(Ok(value)), false)
    }

    pub(crate) fn try_fail(&self, error: LoopError) -> bool {
        self.resolve(Arc::new(Err(error)), false)
    }

    pub(crate) fn try_complete(&self, result: Result<T, LoopError>) -> bool {
        self.resolve(Arc::new(result), false)
    }

    /// Resolves from an outcome that is already shared, without cloning the
    /// payload. Used by `flat_map` and `cascade`.
    pub(crate) fn resolve_shared(&self, outcome: Arc<Result<T, LoopError>>) -> bool {
        self.resolve(outcome, false)
    }

    pub(crate) fn is_resolved(&self) -> bool {
        matches!(&*self.inner.cell.lock().unwrap(), CellState::Resolved(_))
    }

    fn resolve(&self, outcome: Arc<Result<T, LoopError>>, enforce_single: bool) -> bool {
        let callbacks = match self.inner.transition(&outcome) {
            Some(callbacks) => callbacks,
            None => {
                if enforce_single {
                    debug_assert!(false, "promise resolved more than once");
                    error!(
                        "{}: promise resolved more than once; second resolution ignored",
                        self.inner.executor.name()
                    );
                }
                return false;
            }
        };
        self.inner.resolved.notify_all();
        self.inner.executor.promise_resolved();
        deliver(&self.inner.executor, callbacks, outcome);
        true
    }
}

impl<T: Send + Sync + 'static> EventFuture<T> {
    /// The event loop this future's callbacks execute on.
    pub fn executor(&self) -> &EventLoop {
        &self.inner.executor
    }

    /// Registers a callback invoked with the outcome, successful or not.
    pub fn when_complete<F>(&self, f: F)
    where
        F: FnOnce(&Result<T, LoopError>) + Send + 'static,
    {
        self.inner.add_callback(Box::new(move |outcome| f(&*outcome)));
    }

    /// Registers a callback invoked only on success.
    pub fn when_success<F>(&self, f: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        self.when_complete(move |outcome| {
            if let Ok(value) = outcome {
                f(value);
            }
        });
    }

    /// Registers a callback invoked only on failure.
    pub fn when_failure<F>(&self, f: F)
    where
        F: FnOnce(&LoopError) + Send + 'static,
    {
        self.when_complete(move |outcome| {
            if let Err(error) = outcome {
                f(error);
            }
        });
    }

    /// Returns a future of `f` applied to this future's value.
    ///
    /// `f` runs on this future's bound loop. A failure outcome bypasses `f`
    /// and fails the derived future with the same error; a panic inside `f`
    /// fails it with [`LoopError::TaskPanic`].
    pub fn map<U, F>(&self, f: F) -> EventFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let promise = self.inner.executor.new_promise::<U>();
        let future = promise.future();
        self.inner.add_callback(Box::new(move |outcome| match &*outcome {
            Ok(value) => match panic::catch_unwind(AssertUnwindSafe(|| f(value))) {
                Ok(mapped) => {
                    promise.try_succeed(mapped);
                }
                Err(payload) => {
                    promise.try_fail(LoopError::TaskPanic(panic_message(&*payload)));
                }
            },
            Err(error) => {
                promise.try_fail(error.clone());
            }
        }));
        future
    }

    /// Returns a future chained through the future `f` produces.
    ///
    /// The derived future adopts the inner future's outcome without copying
    /// it. Failures and panics propagate as for [`map`].
    ///
    /// [`map`]: EventFuture::map
    pub fn flat_map<U, F>(&self, f: F) -> EventFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> EventFuture<U> + Send + 'static,
    {
        let promise = self.inner.executor.new_promise::<U>();
        let future = promise.future();
        self.inner.add_callback(Box::new(move |outcome| match &*outcome {
            Ok(value) => match panic::catch_unwind(AssertUnwindSafe(|| f(value))) {
                Ok(next) => {
                    next.inner.add_callback(Box::new(move |inner_outcome| {
                        promise.resolve_shared(inner_outcome);
                    }));
                }
                Err(payload) => {
                    promise.try_fail(LoopError::TaskPanic(panic_message(&*payload)));
                }
            },
            Err(error) => {
                promise.try_fail(error.clone());
            }
        }));
        future
    }

    /// Forwards this future's outcome into `target` when it arrives.
    pub fn cascade(&self, target: Promise<T>) {
        self.inner.add_callback(Box::new(move |outcome| {
            target.resolve_shared(outcome);
        }));
    }

    /// Combines two futures into a future of both values.
    ///
    /// The combined future is bound to this future's loop; it fails with
    /// the first failure to arrive.
    pub fn and<U>(&self, other: &EventFuture<U>) -> EventFuture<(T, U)>
    where
        T: Clone,
        U: Clone + Send + Sync + 'static,
    {
        let promise = self.inner.executor.new_promise::<(T, U)>();
        let future = promise.future();
        let slots: Arc<Mutex<(Option<T>, Option<U>)>> = Arc::new(Mutex::new((None, None)));

        let left_promise = promise.clone();
        let left_slots = slots.clone();
        self.inner.add_callback(Box::new(move |outcome| match &*outcome {
            Ok(value) => {
                let ready = {
                    let mut guard = left_slots.lock().unwrap();
                    guard.0 = Some(value.clone());
                    take_pair(&mut guard)
                };
                if let Some(pair) = ready {
                    left_promise.try_succeed(pair);
                }
            }
            Err(error) => {
                left_promise.try_fail(error.clone());
            }
        }));

        let right_promise = promise;
        let right_slots = slots;
        other.inner.add_callback(Box::new(move |outcome| match &*outcome {
            Ok(value) => {
                let ready = {
                    let mut guard = right_slots.lock().unwrap();
                    guard.1 = Some(value.clone());
                    take_pair(&mut guard)
                };
                if let Some(pair) = ready {
                    right_promise.try_succeed(pair);
                }
            }
            Err(error) => {
                right_promise.try_fail(error.clone());
            }
        }));

        future
    }

    /// Returns a future that succeeds once every input future has
    /// succeeded, bound to `executor`; it fails with the first failure.
    pub fn and_all(executor: &EventLoop, futures: Vec<EventFuture<T>>) -> EventFuture<()> {
        let promise = executor.new_promise::<()>();
        let future = promise.future();
        if futures.is_empty() {
            promise.try_succeed(());
            return future;
        }
        let remaining = Arc::new(AtomicUsize::new(futures.len()));
        for input in &futures {
            let promise = promise.clone();
            let remaining = remaining.clone();
            input.inner.add_callback(Box::new(move |outcome| match &*outcome {
                Ok(_) => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        promise.try_succeed(());
                    }
                }
                Err(error) => {
                    promise.try_fail(error.clone());
                }
            }));
        }
        future
    }

    /// Blocks the calling thread until the outcome is available.
    ///
    /// Must not be called on the bound loop's own thread (it would deadlock
    /// the loop); intended for shutdown boundaries and tests.
    ///
    /// # Panics
    ///
    /// Panics when invoked from the bound event loop thread.
    pub fn wait(&self) -> Result<T, LoopError>
    where
        T: Clone,
    {
        assert!(
            !self.inner.executor.in_event_loop(),
            "wait() must not be called from the event loop thread"
        );
        let mut cell = self.inner.cell.lock().unwrap();
        loop {
            match &*cell {
                CellState::Resolved(outcome) => return (**outcome).clone(),
                CellState::Pending(_) => {
                    cell = self.inner.resolved.wait(cell).unwrap();
                }
            }
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &state_name(&self.inner))
            .finish()
    }
}

impl<T> fmt::Debug for EventFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventFuture")
            .field("state", &state_name(&self.inner))
            .finish()
    }
}

/// Takes both slots out when both are filled, leaving them untouched
/// otherwise.
fn take_pair<T, U>(slots: &mut (Option<T>, Option<U>)) -> Option<(T, U)> {
    match (slots.0.take(), slots.1.take()) {
        (Some(left), Some(right)) => Some((left, right)),
        (left, right) => {
            slots.0 = left;
            slots.1 = right;
            None
        }
    }
}

fn state_name<T>(inner: &FutureInner<T>) -> &'static str {
    match inner.cell.try_lock() {
        Ok(cell) => match &*cell {
            CellState::Pending(_) => "pending",
            CellState::Resolved(outcome) => match &**outcome {
                Ok(_) => "succeeded",
                Err(_) => "failed",
            },
        },
        Err(_) => "contended",
    }
}
