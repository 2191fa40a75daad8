//! Multi-reactor TCP service framework.
//!
//! A pool of event-loop workers owns disjoint sets of TCP sessions,
//! addressable from any thread by a stable 64-bit [`SessionId`]. A listen
//! thread feeds inbound connections; the [`Connector`] drives outbound
//! non-blocking connects. Application code observes sessions through
//! enter/data/disconnect callbacks that run on the owning loop's thread.
//!
//! The service is transparent to payload: the data callback receives raw
//! bytes and reports how many it consumed.

pub mod config;
pub mod connector;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod service;
pub mod session;
pub mod tls;

mod channel;
mod event_loop;
mod listener;
mod workers;

pub use channel::{DataCallback, DisconnectCallback, EnterCallback, SentCallback};
pub use connector::{ConnectCallback, Connector};
pub use error::{ConnectError, ServiceError, TlsError};
pub use event_loop::FrameCallback;
pub use service::{ChannelOptions, TcpService, TlsMode};
pub use session::SessionId;
pub use tls::TlsIdentity;
