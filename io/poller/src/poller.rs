//! Readiness set with cross-thread wakeup.

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// A readiness event, decoded from the backing mio event.
///
/// Decoding up front sidesteps borrow conflicts between the event buffer
/// and the state the caller mutates while dispatching.
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
    pub error: bool,
}

/// A readiness set plus a waker that can interrupt a blocked poll from
/// any thread.
///
/// The waker is registered at the token passed to [`Poller::new`]; wakeup
/// events surface as readable events on that token.
pub struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    waker_token: Token,
}

impl Poller {
    /// Create a poller with the waker bound to `waker_token`.
    pub fn new(waker_token: Token) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), waker_token)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            waker,
            waker_token,
        })
    }

    /// Handle used to wake this poller from another thread.
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// The token wakeup events arrive on.
    pub fn waker_token(&self) -> Token {
        self.waker_token
    }

    /// Register an event source for the given interest.
    pub fn register<S: Source>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().register(source, token, interest)
    }

    /// Change the interest set of a registered source.
    pub fn reregister<S: Source>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Remove a source from the readiness set.
    pub fn deregister<S: Source>(&self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    /// Wait for readiness, appending decoded events to `out`.
    ///
    /// An interrupted wait is treated as an empty one. Returns the number
    /// of events appended.
    pub fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<Event>) -> io::Result<usize> {
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(e);
        }

        let before = out.len();
        for event in self.events.iter() {
            out.push(Event {
                token: event.token(),
                readable: event.is_readable(),
                writable: event.is_writable(),
                closed: event.is_read_closed() || event.is_write_closed(),
                error: event.is_error(),
            });
        }
        Ok(out.len() - before)
    }
}
