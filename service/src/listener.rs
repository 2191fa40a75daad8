//! Listen thread: a blocking accept loop feeding the admission callback.

use io_poller::socket;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Receives each accepted connection, synchronously on the listen thread.
pub(crate) type AcceptCallback = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

const ACCEPT_BACKLOG: u32 = 1024;
const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(10);
const SELF_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// A single thread blocked in `accept()`.
///
/// Stopping clears the run flag and self-connects to break the blocked
/// accept; the woken thread sees the flag and exits.
pub(crate) struct ListenThread {
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    join: Option<JoinHandle<()>>,
}

impl ListenThread {
    pub fn spawn(addr: SocketAddr, accept: AcceptCallback) -> io::Result<Self> {
        let listener = socket::build_listener(addr, ACCEPT_BACKLOG)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let flag = running.clone();
        let join = std::thread::Builder::new()
            .name("listen".to_string())
            .spawn(move || run_accept_loop(listener, flag, accept))?;

        Ok(Self {
            running,
            local_addr,
            join: Some(join),
        })
    }

    /// The bound address; resolves port 0 to the assigned port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = TcpStream::connect_timeout(&self.connect_addr(), SELF_CONNECT_TIMEOUT);
        }
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            tracing::error!("listen thread panicked");
        }
    }

    /// Address the self-connect targets; wildcard binds map to loopback.
    fn connect_addr(&self) -> SocketAddr {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(if addr.is_ipv4() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                IpAddr::V6(Ipv6Addr::LOCALHOST)
            });
        }
        addr
    }
}

impl Drop for ListenThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_accept_loop(listener: TcpListener, running: Arc<AtomicBool>, accept: AcceptCallback) {
    let addr = listener.local_addr().ok();
    tracing::info!(addr = ?addr, "listen thread started");

    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                // The shutdown self-connect lands here too; the flag
                // decides, and the stream just drops.
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                accept(stream, peer);
            }
            Err(e) if socket::accept_error_is_transient(&e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!(error = %e, "transient accept error, retrying");
                std::thread::sleep(TRANSIENT_RETRY_DELAY);
            }
            Err(e) => {
                tracing::error!(error = %e, "listen socket failed");
                break;
            }
        }
    }

    tracing::info!(addr = ?addr, "listen thread stopped");
}
