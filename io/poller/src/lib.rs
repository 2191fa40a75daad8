//! Readiness-set and socket-building layer.
//!
//! Wraps mio (epoll on Linux, kqueue on macOS) behind a small [`Poller`]
//! type that yields plain [`Event`] records, plus socket construction
//! helpers built on socket2.

pub mod poller;
pub mod socket;

pub use poller::{Event, Poller};

// The caller addresses registrations with mio's own types.
pub use mio::{Interest, Token};
