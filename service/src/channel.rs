//! Per-session data channel.
//!
//! A channel owns one TCP connection: the socket, the receive buffer, the
//! outbound send queue, optional TLS state, and the close state machine.
//! Channels are created and mutated only on their owning loop's thread;
//! cross-thread requests arrive as posted tasks.

use crate::metrics::{BYTES_RECEIVED, BYTES_SENT, RECV_OVERFLOW_DISCONNECTS};
use crate::session::SessionId;
use crate::tls::TlsSession;
use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Fired on the owning loop when a session is admitted.
pub type EnterCallback = Arc<dyn Fn(SessionId, SocketAddr) + Send + Sync>;

/// Fired exactly once on the owning loop when a session closes.
pub type DisconnectCallback = Arc<dyn Fn(SessionId) + Send + Sync>;

/// Fired on the owning loop with the accumulated receive buffer; returns
/// the number of bytes consumed.
pub type DataCallback = Arc<dyn Fn(SessionId, &[u8]) -> usize + Send + Sync>;

/// Fired once when a packet has been fully written.
pub type SentCallback = Box<dyn FnOnce() + Send>;

/// The callback set resolved for one session.
#[derive(Clone)]
pub struct SessionCallbacks {
    pub enter: EnterCallback,
    pub disconnect: DisconnectCallback,
    pub data: DataCallback,
}

impl Default for SessionCallbacks {
    /// No-op enter/disconnect; data consumes everything.
    fn default() -> Self {
        Self {
            enter: Arc::new(|_, _| {}),
            disconnect: Arc::new(|_| {}),
            data: Arc::new(|_, bytes| bytes.len()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Open,
    ShuttingDown,
    Closed,
}

struct Outbound {
    data: Bytes,
    offset: usize,
    sent: Option<SentCallback>,
}

pub(crate) struct Channel {
    stream: TcpStream,
    id: SessionId,
    peer: SocketAddr,
    recv_buf: BytesMut,
    max_recv_buf: usize,
    send_queue: VecDeque<Outbound>,
    tls: Option<TlsSession>,
    state: ChannelState,
    // Readiness flag mirrored from the poller; cleared on WouldBlock.
    writable: bool,
    fin_sent: bool,
    last_activity: Instant,
    ping_interval: Option<Duration>,
    callbacks: SessionCallbacks,
}

impl Channel {
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        callbacks: SessionCallbacks,
        tls: Option<TlsSession>,
        max_recv_buf: usize,
    ) -> Self {
        Self {
            stream,
            id: SessionId::from_u64(0),
            peer,
            recv_buf: BytesMut::new(),
            max_recv_buf,
            send_queue: VecDeque::new(),
            tls,
            state: ChannelState::Open,
            writable: false,
            fin_sent: false,
            last_activity: Instant::now(),
            ping_interval: None,
            callbacks,
        }
    }

    pub fn set_id(&mut self, id: SessionId) {
        self.id = id;
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn callbacks(&self) -> &SessionCallbacks {
        &self.callbacks
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval
    }

    pub fn set_ping_interval(&mut self, interval: Duration) {
        self.ping_interval = Some(interval);
        self.last_activity = Instant::now();
    }

    /// Drain the socket until it would block, deliver the accumulated
    /// buffer to the data callback, and enforce the receive cap.
    pub fn on_readable(&mut self, scratch: &mut [u8]) {
        if self.state == ChannelState::Closed {
            return;
        }

        let mut close = false;
        let mut received = 0usize;

        match self.tls.as_mut() {
            Some(tls) => {
                match tls.read_socket(&mut self.stream, &mut self.recv_buf) {
                    Ok(out) => {
                        received = out.plaintext;
                        if out.closed {
                            close = true;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(session = %self.id, error = %e, "tls read failed");
                        close = true;
                    }
                }
                // Handshake responses queue inside rustls; push them out.
                if tls.flush(&mut self.stream).is_err() {
                    close = true;
                }
            }
            None => loop {
                match self.stream.read(scratch) {
                    Ok(0) => {
                        close = true;
                        break;
                    }
                    Ok(n) => {
                        self.recv_buf.extend_from_slice(&scratch[..n]);
                        received += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::debug!(session = %self.id, error = %e, "read failed");
                        close = true;
                        break;
                    }
                }
            },
        }

        if received > 0 {
            self.last_activity = Instant::now();
            BYTES_RECEIVED.add(received as u64);
            self.dispatch_data();

            if self.recv_buf.len() > self.max_recv_buf {
                tracing::warn!(
                    session = %self.id,
                    buffered = self.recv_buf.len(),
                    cap = self.max_recv_buf,
                    "receive buffer cap exceeded, disconnecting"
                );
                RECV_OVERFLOW_DISCONNECTS.increment();
                close = true;
            }
        }

        if close {
            self.force_close();
        }
    }

    /// The socket reported writable readiness: flush the send queue.
    pub fn on_writable(&mut self) {
        self.writable = true;
        self.flush_queue();
    }

    /// Append a packet. Silently dropped unless the channel is open.
    /// Flushes opportunistically when the socket is already writable.
    pub fn enqueue(&mut self, data: Bytes, sent: Option<SentCallback>) {
        if self.state != ChannelState::Open {
            return;
        }
        self.send_queue.push_back(Outbound {
            data,
            offset: 0,
            sent,
        });
        if self.writable {
            self.flush_queue();
        }
    }

    /// Stop accepting sends; FIN goes out once the queue drains. The
    /// disconnect callback fires when the peer closes in turn.
    pub fn begin_shutdown(&mut self) {
        if self.state != ChannelState::Open {
            return;
        }
        self.state = ChannelState::ShuttingDown;
        if self.send_queue.is_empty() {
            self.send_fin();
        }
    }

    /// Cancel pending writes and transition to closed. The owning loop
    /// reaps the channel and fires the disconnect callback.
    pub fn force_close(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        self.send_queue.clear();
        self.state = ChannelState::Closed;
    }

    fn dispatch_data(&mut self) {
        if let Some(tls) = self.tls.as_ref()
            && tls.is_handshaking()
        {
            return;
        }
        if self.recv_buf.is_empty() {
            return;
        }
        let consumed = (self.callbacks.data)(self.id, &self.recv_buf);
        self.recv_buf.advance(consumed.min(self.recv_buf.len()));
    }

    fn flush_queue(&mut self) {
        if self.state == ChannelState::Closed {
            return;
        }
        if self.tls.is_some() {
            self.flush_queue_tls();
        } else {
            self.flush_queue_plain();
        }
        if self.state == ChannelState::ShuttingDown
            && self.send_queue.is_empty()
            && !self.fin_sent
        {
            self.send_fin();
        }
    }

    fn flush_queue_plain(&mut self) {
        loop {
            let Some(head) = self.send_queue.front_mut() else {
                break;
            };
            match self.stream.write(&head.data[head.offset..]) {
                Ok(n) => {
                    head.offset += n;
                    let finished = head.offset >= head.data.len();
                    self.last_activity = Instant::now();
                    BYTES_SENT.add(n as u64);
                    if finished
                        && let Some(entry) = self.send_queue.pop_front()
                        && let Some(cb) = entry.sent
                    {
                        cb();
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.writable = false;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(session = %self.id, error = %e, "write failed");
                    self.force_close();
                    break;
                }
            }
        }
    }

    fn flush_queue_tls(&mut self) {
        let Some(tls) = self.tls.as_mut() else {
            return;
        };

        if !tls.is_handshaking() {
            // Hand plaintext to rustls; it buffers and frames records.
            loop {
                let Some(head) = self.send_queue.front_mut() else {
                    break;
                };
                match tls.write_plaintext(&head.data[head.offset..]) {
                    Ok(n) => {
                        head.offset += n;
                        let finished = head.offset >= head.data.len();
                        self.last_activity = Instant::now();
                        BYTES_SENT.add(n as u64);
                        if finished
                            && let Some(entry) = self.send_queue.pop_front()
                            && let Some(cb) = entry.sent
                        {
                            cb();
                        }
                    }
                    Err(e) => {
                        tracing::debug!(session = %self.id, error = %e, "tls write failed");
                        self.force_close();
                        return;
                    }
                }
            }
        }

        match tls.flush(&mut self.stream) {
            Ok(()) => {
                if tls.wants_write() {
                    // Socket filled up mid-record; resume on the next
                    // writable event.
                    self.writable = false;
                }
            }
            Err(e) => {
                tracing::debug!(session = %self.id, error = %e, "tls flush failed");
                self.force_close();
            }
        }
    }

    fn send_fin(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.send_close_notify();
            let _ = tls.flush(&mut self.stream);
        }
        let _ = self.stream.shutdown(Shutdown::Write);
        self.fin_sent = true;
    }

    #[cfg(test)]
    fn recv_buffered(&self) -> usize {
        self.recv_buf.len()
    }

    #[cfg(test)]
    fn state(&self) -> ChannelState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn pair() -> (Channel, std::net::TcpStream) {
        pair_with(SessionCallbacks::default(), 1024 * 1024)
    }

    fn pair_with(callbacks: SessionCallbacks, max_recv: usize) -> (Channel, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let channel = Channel::new(
            TcpStream::from_std(server),
            peer,
            callbacks,
            None,
            max_recv,
        );
        (channel, client)
    }

    /// Call `on_readable` until `predicate` holds or a deadline passes.
    fn pump_read(channel: &mut Channel, predicate: impl Fn(&Channel) -> bool) {
        let mut scratch = vec![0u8; 16 * 1024];
        let deadline = Instant::now() + Duration::from_secs(2);
        while !predicate(channel) {
            assert!(Instant::now() < deadline, "timed out waiting on channel");
            channel.on_readable(&mut scratch);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn enqueue_flushes_when_writable() {
        let (mut channel, mut client) = pair();
        channel.on_writable();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        channel.enqueue(
            Bytes::from_static(b"hello"),
            Some(Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let mut buf = [0u8; 16];
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn packets_arrive_in_submission_order() {
        let (mut channel, mut client) = pair();
        channel.on_writable();

        for part in [&b"one "[..], b"two ", b"three"] {
            channel.enqueue(Bytes::copy_from_slice(part), None);
        }

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut got = Vec::new();
        while got.len() < 13 {
            let mut buf = [0u8; 32];
            let n = client.read(&mut buf).unwrap();
            assert!(n > 0);
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"one two three");
    }

    #[test]
    fn data_callback_consumes_partially() {
        let callbacks = SessionCallbacks {
            data: Arc::new(|_, _| 2),
            ..SessionCallbacks::default()
        };
        let (mut channel, mut client) = pair_with(callbacks, 1024);

        client.write_all(b"abcd").unwrap();
        pump_read(&mut channel, |c| c.recv_buffered() == 2);
    }

    #[test]
    fn receive_cap_disconnects() {
        let callbacks = SessionCallbacks {
            // A consumer that never keeps up.
            data: Arc::new(|_, _| 0),
            ..SessionCallbacks::default()
        };
        let (mut channel, mut client) = pair_with(callbacks, 16);

        client.write_all(&[0u8; 128]).unwrap();
        pump_read(&mut channel, |c| c.state() == ChannelState::Closed);
    }

    #[test]
    fn peer_eof_closes() {
        let (mut channel, client) = pair();
        drop(client);
        pump_read(&mut channel, |c| c.state() == ChannelState::Closed);
    }

    #[test]
    fn enqueue_after_shutdown_is_dropped() {
        let (mut channel, mut client) = pair();
        channel.on_writable();
        channel.begin_shutdown();
        channel.enqueue(Bytes::from_static(b"late"), None);

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0u8; 16];
        // FIN with no data: read returns 0.
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn shutdown_drains_queue_before_fin() {
        let (mut channel, mut client) = pair();
        channel.on_writable();

        let payload = vec![7u8; 16 * 1024];
        channel.enqueue(Bytes::from(payload.clone()), None);
        channel.begin_shutdown();
        channel.on_writable();

        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut got = Vec::new();
        client.read_to_end(&mut got).unwrap();
        assert_eq!(got, payload);
    }

    #[test]
    fn force_close_cancels_pending() {
        let (mut channel, _client) = pair();
        channel.enqueue(Bytes::from_static(b"pending"), None);
        channel.force_close();
        assert!(channel.is_closed());
        assert!(channel.send_queue.is_empty());
        // Idempotent.
        channel.force_close();
        assert!(channel.is_closed());
    }
}
