//! Error types surfaced through futures and shutdown callbacks.

use std::any::Any;
use std::error::Error;
use std::io;
use std::sync::Arc;

use derive_more::Display;

/// Errors produced by event loops, scheduled tasks and futures.
///
/// Every error a loop produces reaches the caller through the failure of an
/// [`EventFuture`] or through a shutdown callback; the loop itself never
/// panics out of a task boundary. The type is cheaply cloneable because one
/// resolved outcome fans out to every registered callback and to cascaded
/// promises.
///
/// [`EventFuture`]: crate::future::EventFuture
#[derive(Debug, Clone, Display)]
pub enum LoopError {
    /// An operation is not implemented by this concrete event loop.
    #[display(fmt = "operation not supported by this event loop: {}", _0)]
    Unsupported(&'static str),

    /// A scheduled task was cancelled before it ran.
    #[display(fmt = "scheduled task was cancelled")]
    Cancelled,

    /// Work was submitted to, or drained from, a loop past its open window.
    #[display(fmt = "event loop is shut down")]
    Shutdown,

    /// Group-wide shutdown could not complete cleanly.
    #[display(fmt = "event loop group failed to shut down cleanly")]
    ShutdownFailed,

    /// `close_gently` was invoked on a loop that is no longer open.
    #[display(fmt = "event loop is already closed")]
    AlreadyClosed,

    /// A submitted callable or future callback panicked; the panic was
    /// trapped at the task boundary.
    #[display(fmt = "task panicked: {}", _0)]
    TaskPanic(String),

    /// An I/O error from the selector surface.
    #[display(fmt = "{}", _0)]
    Io(Arc<io::Error>),

    /// An application error propagated out of a submitted callable.
    #[display(fmt = "{}", _0)]
    Other(Arc<dyn Error + Send + Sync>),
}

impl LoopError {
    /// Wraps an arbitrary application error for propagation through a
    /// future chain.
    pub fn other<E>(err: E) -> LoopError
    where
        E: Error + Send + Sync + 'static,
    {
        LoopError::Other(Arc::new(err))
    }
}

impl Error for LoopError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            LoopError::Io(err) => Some(err.as_ref()),
            LoopError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for LoopError {
    fn from(err: io::Error) -> LoopError {
        LoopError::Io(Arc::new(err))
    }
}

/// Extracts a printable message from a trapped panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

