//! The default selector, backed by `mio`'s cross-platform poll.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;

use super::{ChannelId, ChannelInterest, Readiness, Selector, SelectorEvent, WaitStrategy, Wakeup};

/// Token reserved for the waker; never allocated to a registration.
const TOKEN_WAKEUP: Token = Token(usize::max_value());

/// Capacity of the preallocated event buffer per wait.
const EVENTS_CAPACITY: usize = 256;

fn mio_interest(interest: ChannelInterest) -> Interest {
    match interest {
        ChannelInterest::Read => Interest::READABLE,
        ChannelInterest::Write => Interest::WRITABLE,
        ChannelInterest::Both => Interest::READABLE | Interest::WRITABLE,
    }
}

/// `mio::Poll`-backed [`Selector`].
///
/// Registrations are tracked in a slab so ids stay dense and O(1) to look
/// up; the slab stores the raw fd because `mio` needs it again at
/// deregistration time.
pub struct PollSelector {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    registrations: Slab<RawFd>,
}

impl PollSelector {
    /// Creates a selector and its wakeup registration.
    pub fn new() -> io::Result<PollSelector> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), TOKEN_WAKEUP)?);
        Ok(PollSelector {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            waker,
            registrations: Slab::new(),
        })
    }
}

impl Selector for PollSelector {
    fn register(&mut self, fd: RawFd, interest: ChannelInterest) -> io::Result<ChannelId> {
        let entry = self.registrations.vacant_entry();
        let token = Token(entry.key());
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, mio_interest(interest))?;
        entry.insert(fd);
        Ok(ChannelId(token.0))
    }

    fn reregister(
        &mut self,
        fd: RawFd,
        id: ChannelId,
        interest: ChannelInterest,
    ) -> io::Result<()> {
        if !self.registrations.contains(id.0) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "selector registration not found",
            ));
        }
        self.poll
            .registry()
            .reregister(&mut SourceFd(&fd), Token(id.0), mio_interest(interest))
    }

    fn deregister(&mut self, fd: RawFd, id: ChannelId) -> io::Result<()> {
        if !self.registrations.contains(id.0) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "selector registration not found",
            ));
        }
        self.registrations.remove(id.0);
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    fn wait(
        &mut self,
        strategy: WaitStrategy,
        events: &mut Vec<SelectorEvent>,
    ) -> io::Result<()> {
        let timeout = match strategy {
            WaitStrategy::Block => None,
            WaitStrategy::PollNow => Some(std::time::Duration::from_millis(0)),
            WaitStrategy::BlockFor(amount) => Some(amount.as_duration()),
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            // An interrupted wait is indistinguishable from a spurious
            // wakeup as far as the loop is concerned.
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        for event in self.events.iter() {
            let token = event.token();
            if token == TOKEN_WAKEUP {
                continue;
            }
            let readiness = match (event.is_readable(), event.is_writable()) {
                (true, true) => Readiness::Both,
                (true, false) => Readiness::Read,
                (false, true) => Readiness::Write,
                (false, false) => Readiness::None,
            };
            events.push(SelectorEvent {
                id: ChannelId(token.0),
                readiness,
            });
        }
        Ok(())
    }

    fn wakeup_handle(&self) -> Arc<dyn Wakeup> {
        Arc::new(PollWakeup {
            waker: self.waker.clone(),
        })
    }

    fn close_gently(&mut self) -> io::Result<()> {
        let fds: Vec<RawFd> = self.registrations.drain().collect();
        let mut first_err = None;
        for fd in fds {
            if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        // Dropping the `Poll` when the selector itself is dropped releases
        // the kernel object; there is nothing to flush beforehand.
        Ok(())
    }
}

impl std::fmt::Debug for PollSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSelector")
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

struct PollWakeup {
    waker: Arc<Waker>,
}

impl Wakeup for PollWakeup {
    fn wakeup(&self) -> io::Result<()> {
        self.waker.wake()
    }
}
