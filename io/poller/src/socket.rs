//! Socket construction via socket2.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};

/// Build a blocking TCP listener bound to `addr`.
///
/// Uses socket2 for control over options: `SO_REUSEADDR` is set so a
/// restarted service can rebind without waiting out TIME_WAIT.
pub fn build_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    Ok(socket.into())
}

/// Whether an accept-loop error is transient and worth retrying.
///
/// Interrupted accepts and fd exhaustion (EMFILE/ENFILE) recover on their
/// own; anything else indicates a broken listen socket.
pub fn accept_error_is_transient(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted
    ) {
        return true;
    }
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_binds_ephemeral_port() {
        let listener = build_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn listener_accepts_connection() {
        let listener = build_listener("127.0.0.1:0".parse().unwrap(), 128).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
        drop(accepted);
    }

    #[test]
    fn listener_ipv6() {
        // IPv6 may be unavailable in some environments.
        if let Ok(listener) = build_listener("[::1]:0".parse().unwrap(), 128) {
            assert!(listener.local_addr().unwrap().is_ipv6());
        }
    }

    #[test]
    fn transient_errors_classified() {
        assert!(accept_error_is_transient(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
        assert!(accept_error_is_transient(&io::Error::from_raw_os_error(
            libc::EMFILE
        )));
        assert!(!accept_error_is_transient(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
    }
}
