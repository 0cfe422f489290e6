//! Abstraction over the kernel's I/O readiness primitive.
//!
//! An event loop never talks to `epoll`/`kqueue` directly; it drives a
//! [`Selector`], which multiplexes readiness for many registered file
//! descriptors and can be interrupted from other threads through its
//! [`Wakeup`] handle. The blocking behaviour of a single wait is chosen per
//! tick via [`WaitStrategy`], letting the loop sleep exactly until its
//! nearest timer deadline.
//!
//! The default implementation, [`PollSelector`], is backed by `mio`.
//!
//! # Wakeup model
//!
//! * Calling [`Wakeup::wakeup`] while a wait is in progress interrupts it;
//!   calling it before a wait makes the next wait return immediately.
//! * Wakeups are idempotent: many calls coalesce into one interruption.
//! * Spurious wakeups are permitted; they surface as a wait producing no
//!   events and must be treated as a no-op by the caller.

mod poll;

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::time::TimeAmount;

pub use self::poll::PollSelector;

/// Identifies one registration within a selector.
///
/// The id is allocated by [`Selector::register`] and carried back on every
/// readiness event for that registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub(crate) usize);

/// The interest set a channel asks the selector to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelInterest {
    /// Readable readiness only.
    Read,
    /// Writable readiness only.
    Write,
    /// Both readable and writable readiness.
    Both,
}

/// Readiness reported by one selector event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The registration is readable.
    Read,
    /// The registration is writable.
    Write,
    /// The registration is both readable and writable.
    Both,
    /// No readiness; produced by spurious wakeups and ignored at dispatch.
    None,
}

/// One readiness notification produced by a selector wait.
#[derive(Debug, Clone, Copy)]
pub struct SelectorEvent {
    /// The registration the event belongs to.
    pub id: ChannelId,
    /// The readiness observed for it.
    pub readiness: Readiness,
}

/// How long a single selector wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Block until an I/O event or a wakeup arrives.
    Block,
    /// Do not block; report whatever is ready right now.
    PollNow,
    /// Block for at most the given amount of time.
    BlockFor(TimeAmount),
}

/// Cross-thread handle that interrupts a selector wait.
///
/// Handles are cheap to clone via `Arc` and remain valid for the lifetime of
/// the selector they came from.
pub trait Wakeup: Send + Sync + 'static {
    /// Interrupts the current (or next) wait on the originating selector.
    fn wakeup(&self) -> io::Result<()>;
}

/// The I/O readiness multiplexer an event loop drives.
///
/// A selector is owned by exactly one loop thread; only the [`Wakeup`]
/// handle obtained from [`wakeup_handle`] may be used from other threads.
///
/// [`wakeup_handle`]: Selector::wakeup_handle
pub trait Selector {
    /// Starts watching `fd` with the given interest set and returns the id
    /// carried by subsequent events for it.
    fn register(&mut self, fd: RawFd, interest: ChannelInterest) -> io::Result<ChannelId>;

    /// Replaces the interest set of an existing registration.
    fn reregister(&mut self, fd: RawFd, id: ChannelId, interest: ChannelInterest)
        -> io::Result<()>;

    /// Stops watching a registration.
    fn deregister(&mut self, fd: RawFd, id: ChannelId) -> io::Result<()>;

    /// Waits according to `strategy` and appends the readiness events that
    /// arrived to `events`. Wakeup notifications are consumed internally and
    /// never surface as events.
    fn wait(&mut self, strategy: WaitStrategy, events: &mut Vec<SelectorEvent>)
        -> io::Result<()>;

    /// Returns the cross-thread wakeup handle for this selector.
    fn wakeup_handle(&self) -> Arc<dyn Wakeup>;

    /// Drops every remaining registration, leaving the selector usable for
    /// further waits. Used while draining a loop that is closing gently.
    fn close_gently(&mut self) -> io::Result<()>;

    /// Releases the underlying readiness primitive. The selector must not
    /// be used afterwards.
    fn close(&mut self) -> io::Result<()>;
}
