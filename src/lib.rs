#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub
)]

//! A callback-driven, non-blocking network event-loop core.
//!
//! `nevio` multiplexes I/O readiness for many endpoints onto a small, fixed
//! set of worker threads. Each [`EventLoop`] owns one thread, one selector
//! and one timer queue; an [`EventLoopGroup`] hands loops out round-robin
//! and orchestrates graceful shutdown across all of them. Results of
//! submitted work travel through a [`Promise`]/[`EventFuture`] pair whose
//! callbacks always execute on the future's bound loop.
//!
//! # Example
//!
//! ```no_run
//! use nevio::{EventLoopGroup, TimeAmount};
//!
//! let group = EventLoopGroup::new(2).unwrap();
//! let event_loop = group.next();
//!
//! // Immediate work, fire-and-forget.
//! event_loop.execute(|| println!("running on the loop"));
//!
//! // Fallible work with a future of the outcome.
//! let doubled = event_loop
//!     .submit(|| Ok(21))
//!     .map(|n| n * 2);
//! assert_eq!(doubled.wait().unwrap(), 42);
//!
//! // Delayed work with a cancellation handle.
//! let scheduled = event_loop.schedule(TimeAmount::milliseconds(50), || Ok("later"));
//! scheduled.cancel();
//!
//! group.sync_shutdown_gracefully().unwrap();
//! ```

#[macro_use]
extern crate log;

pub mod channel;
pub mod error;
pub mod future;
pub mod group;
pub mod selector;
pub mod time;

mod eventloop;
mod scheduled;

pub use self::error::LoopError;
pub use self::eventloop::EventLoop;
pub use self::future::{EventFuture, Promise};
pub use self::group::{Builder, EventLoopGroup};
pub use self::scheduled::Scheduled;
pub use self::time::TimeAmount;
