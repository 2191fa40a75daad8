//! Asynchronous outbound connector.
//!
//! A single thread drives many non-blocking `connect()` calls through one
//! readiness set. Results are delivered on the connector thread; callees
//! must be thread-safe or trampoline onto their own loop.

use crate::error::ConnectError;
use crate::metrics::{CONNECT_TIMEOUTS, CONNECTS_FAILED, CONNECTS_OK, CONNECTS_STARTED};
use crossbeam_channel::{Receiver, Sender};
use io_poller::{Event, Interest, Poller, Token};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Receives `(uid, result)` for every request, on the connector thread.
pub type ConnectCallback =
    Arc<dyn Fn(u64, Result<std::net::TcpStream, ConnectError>) + Send + Sync>;

const WAKER_TOKEN: Token = Token(0);
const TOKEN_BASE: usize = 1;
const POLL_QUANTUM: Duration = Duration::from_millis(10);
// The traditional readiness-set cap on concurrently connecting sockets.
const MAX_IN_FLIGHT: usize = 1024;

struct ConnectRequest {
    addr: SocketAddr,
    timeout: Duration,
    uid: u64,
}

struct Connecting {
    stream: mio::net::TcpStream,
    uid: u64,
    deadline: Instant,
}

enum Outcome {
    Connected,
    Failed(io::Error),
    Pending,
}

/// Handle to the connector thread.
///
/// Requests queue without bound; at most 1024 connects are in flight at
/// once, the rest wait their turn.
pub struct Connector {
    requests: Sender<ConnectRequest>,
    waker: Arc<mio::Waker>,
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl Connector {
    /// Spawn the connector thread.
    pub fn start(callback: ConnectCallback) -> io::Result<Self> {
        let poller = Poller::new(WAKER_TOKEN)?;
        let waker = poller.waker();
        let (tx, rx) = crossbeam_channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let flag = running.clone();
        let join = std::thread::Builder::new()
            .name("connector".to_string())
            .spawn(move || {
                ConnectorLoop {
                    poller,
                    requests: rx,
                    pending: Slab::new(),
                    events: Vec::new(),
                    callback,
                    running: flag,
                }
                .run()
            })?;

        Ok(Self {
            requests: tx,
            waker,
            running,
            join: Some(join),
        })
    }

    /// Queue a connect to `addr`; the result callback fires with `uid`
    /// once the connect completes, fails, or passes `timeout`.
    pub fn async_connect(&self, addr: SocketAddr, timeout: Duration, uid: u64) -> bool {
        if self
            .requests
            .send(ConnectRequest { addr, timeout, uid })
            .is_err()
        {
            return false;
        }
        let _ = self.waker.wake();
        true
    }

    /// Stop the thread. Outstanding connects are abandoned without a
    /// callback, matching close-time cancellation semantics.
    pub fn stop(&mut self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let _ = self.waker.wake();
        }
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            tracing::error!("connector thread panicked");
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ConnectorLoop {
    poller: Poller,
    requests: Receiver<ConnectRequest>,
    pending: Slab<Connecting>,
    events: Vec<Event>,
    callback: ConnectCallback,
    running: Arc<AtomicBool>,
}

impl ConnectorLoop {
    fn run(mut self) {
        tracing::debug!("connector started");

        while self.running.load(Ordering::SeqCst) {
            self.events.clear();
            if let Err(e) = self.poller.poll(Some(POLL_QUANTUM), &mut self.events) {
                tracing::error!(error = %e, "connector poll failed");
                break;
            }

            let events = std::mem::take(&mut self.events);
            for event in &events {
                self.check_completion(event);
            }
            self.events = events;

            self.admit_requests();
            self.sweep_timeouts();
        }

        tracing::debug!(abandoned = self.pending.len(), "connector stopped");
    }

    fn check_completion(&mut self, event: &Event) {
        if event.token == WAKER_TOKEN {
            return;
        }
        let key = event.token.0 - TOKEN_BASE;
        let Some(entry) = self.pending.get(key) else {
            return;
        };

        let outcome = if event.error || event.closed {
            match entry.stream.take_error() {
                Ok(Some(e)) | Err(e) => Outcome::Failed(e),
                Ok(None) => Outcome::Failed(io::Error::from(io::ErrorKind::ConnectionReset)),
            }
        } else if event.writable {
            // Writable after a non-blocking connect: SO_ERROR decides,
            // then peer_addr confirms the handshake really finished.
            match entry.stream.take_error() {
                Ok(Some(e)) | Err(e) => Outcome::Failed(e),
                Ok(None) => match entry.stream.peer_addr() {
                    Ok(_) => Outcome::Connected,
                    Err(e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        Outcome::Pending
                    }
                    Err(e) => Outcome::Failed(e),
                },
            }
        } else {
            Outcome::Pending
        };

        match outcome {
            Outcome::Connected => self.complete(key),
            Outcome::Failed(e) => self.fail(key, e),
            Outcome::Pending => {}
        }
    }

    fn complete(&mut self, key: usize) {
        let mut entry = self.pending.remove(key);
        let _ = self.poller.deregister(&mut entry.stream);
        CONNECTS_OK.increment();
        tracing::debug!(uid = entry.uid, "connect completed");
        (self.callback)(entry.uid, Ok(into_std(entry.stream)));
    }

    fn fail(&mut self, key: usize, error: io::Error) {
        let mut entry = self.pending.remove(key);
        let _ = self.poller.deregister(&mut entry.stream);
        CONNECTS_FAILED.increment();
        tracing::debug!(uid = entry.uid, error = %error, "connect failed");
        (self.callback)(entry.uid, Err(ConnectError::Io(error)));
    }

    /// Start queued connects while below the in-flight cap.
    fn admit_requests(&mut self) {
        while self.pending.len() < MAX_IN_FLIGHT {
            let Ok(req) = self.requests.try_recv() else {
                break;
            };
            CONNECTS_STARTED.increment();

            match mio::net::TcpStream::connect(req.addr) {
                Ok(mut stream) => {
                    let deadline = Instant::now() + req.timeout;
                    let entry = self.pending.vacant_entry();
                    let token = Token(entry.key() + TOKEN_BASE);
                    if let Err(e) = self.poller.register(&mut stream, token, Interest::WRITABLE) {
                        CONNECTS_FAILED.increment();
                        (self.callback)(req.uid, Err(ConnectError::Io(e)));
                        continue;
                    }
                    entry.insert(Connecting {
                        stream,
                        uid: req.uid,
                        deadline,
                    });
                }
                Err(e) => {
                    CONNECTS_FAILED.increment();
                    tracing::debug!(uid = req.uid, error = %e, "connect failed immediately");
                    (self.callback)(req.uid, Err(ConnectError::Io(e)));
                }
            }
        }
    }

    fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, c)| now >= c.deadline)
            .map(|(key, _)| key)
            .collect();

        for key in expired {
            let mut entry = self.pending.remove(key);
            let _ = self.poller.deregister(&mut entry.stream);
            CONNECT_TIMEOUTS.increment();
            CONNECTS_FAILED.increment();
            tracing::debug!(uid = entry.uid, "connect timed out");
            (self.callback)(entry.uid, Err(ConnectError::TimedOut));
        }
    }
}

fn into_std(stream: mio::net::TcpStream) -> std::net::TcpStream {
    // Ownership transfer; the fd stays non-blocking.
    unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    type Result = std::result::Result<std::net::TcpStream, ConnectError>;

    fn recording_connector() -> (Connector, mpsc::Receiver<(u64, Result)>) {
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let callback: ConnectCallback = Arc::new(move |uid, result| {
            let _ = tx.lock().unwrap().send((uid, result));
        });
        (Connector::start(callback).unwrap(), rx)
    }

    #[test]
    fn connect_succeeds_to_local_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let (mut connector, rx) = recording_connector();
        assert!(connector.async_connect(addr, Duration::from_secs(2), 77));

        let (uid, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(uid, 77);
        let stream = result.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);

        // The listener really saw the connection.
        listener.accept().unwrap();
        connector.stop();
    }

    #[test]
    fn connect_to_closed_port_fails() {
        // Bind then drop to find a port with nothing listening.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let (mut connector, rx) = recording_connector();
        assert!(connector.async_connect(addr, Duration::from_secs(2), 5));

        let (uid, result) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(uid, 5);
        assert!(result.is_err());
        connector.stop();
    }

    #[test]
    fn requests_after_stop_are_rejected() {
        let (mut connector, _rx) = recording_connector();
        connector.stop();
        connector.stop();
        assert!(!connector.async_connect("127.0.0.1:1".parse().unwrap(), Duration::from_secs(1), 1));
    }
}
