//! Event loop workers and the cross-thread task mailbox.
//!
//! Each worker thread drives one readiness set and owns a disjoint set of
//! sessions. All channel mutation happens here; other threads talk to a
//! worker by posting a [`Task`] through its [`LoopHandle`], which also
//! wakes the blocked poll.

use crate::channel::{Channel, SentCallback, SessionCallbacks};
use crate::metrics::{
    ADMISSION_FAILURES, PING_TIMEOUTS, SESSIONS_ACTIVE, SESSIONS_ADMITTED, SESSIONS_CLOSED,
};
use crate::session::{SessionId, SessionTable};
use crate::tls::{TlsInit, TlsSession};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use io_poller::{Event, Interest, Poller, Token};
use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Invoked once per loop iteration on the loop's own thread; receives the
/// loop index. Applications use it as a cooperative tick.
pub type FrameCallback = Arc<dyn Fn(u16) + Send + Sync>;

const WAKER_TOKEN: Token = Token(0);
// Channel tokens are slot + 1 so the waker keeps token 0.
const TOKEN_BASE: usize = 1;
const DEFAULT_TICK: Duration = Duration::from_millis(100);
const SCRATCH_SIZE: usize = 16 * 1024;

thread_local! {
    static CURRENT_LOOP: Cell<Option<u16>> = const { Cell::new(None) };
}

/// The loop index of the calling thread, when it is a worker thread.
pub(crate) fn current_loop_index() -> Option<u16> {
    CURRENT_LOOP.get()
}

/// Everything a worker needs to admit one channel.
pub(crate) struct ChannelConfig {
    pub callbacks: SessionCallbacks,
    pub tls: Option<TlsInit>,
    pub max_recv_buf: usize,
}

/// Work posted to a loop from another thread.
pub(crate) enum Task {
    Register {
        stream: std::net::TcpStream,
        peer: SocketAddr,
        config: ChannelConfig,
    },
    Send {
        id: SessionId,
        data: Bytes,
        sent: Option<SentCallback>,
    },
    SendBatch {
        entries: Vec<(SessionId, Bytes, Option<SentCallback>)>,
    },
    Shutdown {
        id: SessionId,
    },
    Disconnect {
        id: SessionId,
    },
    SetPingCheck {
        id: SessionId,
        interval: Duration,
    },
    Wakeup,
    CloseAll,
    Stop,
}

/// Cross-thread handle to one loop worker.
#[derive(Clone)]
pub(crate) struct LoopHandle {
    index: u16,
    tasks: Sender<Task>,
    waker: Arc<mio::Waker>,
}

impl LoopHandle {
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Post a task and wake the loop. False once the loop has exited.
    pub fn post(&self, task: Task) -> bool {
        if self.tasks.send(task).is_err() {
            return false;
        }
        let _ = self.waker.wake();
        true
    }
}

#[derive(PartialEq, Eq)]
struct TimerEntry {
    at: Instant,
    slot: u16,
    generation: u32,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.slot.cmp(&other.slot))
            .then_with(|| self.generation.cmp(&other.generation))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One reactor: readiness set, task mailbox, session table, timers.
pub(crate) struct EventLoop {
    index: u16,
    poller: Poller,
    tasks: Receiver<Task>,
    table: SessionTable<Channel>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    events: Vec<Event>,
    scratch: Vec<u8>,
    dead: Vec<u16>,
    frame: Option<FrameCallback>,
    running: bool,
}

impl EventLoop {
    /// Build a loop and its handle. The loop is driven by calling
    /// [`EventLoop::run`] on a dedicated thread.
    pub fn create(index: u16, frame: Option<FrameCallback>) -> io::Result<(Self, LoopHandle)> {
        let poller = Poller::new(WAKER_TOKEN)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = LoopHandle {
            index,
            tasks: tx,
            waker: poller.waker(),
        };
        Ok((
            Self {
                index,
                poller,
                tasks: rx,
                table: SessionTable::new(index),
                timers: BinaryHeap::new(),
                events: Vec::new(),
                scratch: vec![0u8; SCRATCH_SIZE],
                dead: Vec::new(),
                frame,
                running: true,
            },
            handle,
        ))
    }

    pub fn run(mut self) {
        CURRENT_LOOP.set(Some(self.index));
        tracing::debug!(loop_index = self.index, "event loop started");

        while self.running {
            self.drain_tasks();
            if !self.running {
                break;
            }

            let timeout = self.poll_timeout();
            self.events.clear();
            if let Err(e) = self.poller.poll(Some(timeout), &mut self.events) {
                tracing::error!(loop_index = self.index, error = %e, "poll failed");
                break;
            }

            let events = std::mem::take(&mut self.events);
            for event in &events {
                self.dispatch(event);
            }
            self.events = events;

            self.advance_timers();
            self.reap();

            if let Some(frame) = self.frame.clone() {
                frame(self.index);
            }
        }

        CURRENT_LOOP.set(None);
        tracing::debug!(
            loop_index = self.index,
            live = self.table.len(),
            "event loop stopped"
        );
    }

    fn poll_timeout(&self) -> Duration {
        let mut timeout = DEFAULT_TICK;
        if let Some(Reverse(next)) = self.timers.peek() {
            timeout = timeout.min(next.at.saturating_duration_since(Instant::now()));
        }
        timeout
    }

    fn drain_tasks(&mut self) {
        while let Ok(task) = self.tasks.try_recv() {
            match task {
                Task::Register {
                    stream,
                    peer,
                    config,
                } => self.register_channel(stream, peer, config),
                Task::Send { id, data, sent } => {
                    self.with_channel(id, |ch| ch.enqueue(data, sent));
                }
                Task::SendBatch { entries } => {
                    for (id, data, sent) in entries {
                        self.with_channel(id, |ch| ch.enqueue(data, sent));
                    }
                }
                Task::Shutdown { id } => {
                    self.with_channel(id, Channel::begin_shutdown);
                }
                Task::Disconnect { id } => {
                    self.with_channel(id, Channel::force_close);
                }
                Task::SetPingCheck { id, interval } => {
                    if let Some(ch) = self.table.get_mut(id) {
                        ch.set_ping_interval(interval);
                        self.timers.push(Reverse(TimerEntry {
                            at: Instant::now() + interval,
                            slot: id.slot(),
                            generation: id.generation(),
                        }));
                    }
                }
                Task::Wakeup => {}
                Task::CloseAll => self.close_all(),
                Task::Stop => self.running = false,
            }
        }
    }

    /// Run `f` on the channel for `id` if the ID is still live; stale IDs
    /// are silent no-ops.
    fn with_channel(&mut self, id: SessionId, f: impl FnOnce(&mut Channel)) {
        if let Some(ch) = self.table.get_mut(id) {
            f(ch);
            if ch.is_closed() {
                self.dead.push(id.slot());
            }
        }
    }

    fn register_channel(
        &mut self,
        stream: std::net::TcpStream,
        peer: SocketAddr,
        config: ChannelConfig,
    ) {
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!(peer = %peer, error = %e, "admission failed: set_nonblocking");
            ADMISSION_FAILURES.increment();
            return;
        }

        let tls = match config.tls.as_ref().map(TlsSession::new).transpose() {
            Ok(tls) => tls,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "admission failed: tls session");
                ADMISSION_FAILURES.increment();
                return;
            }
        };

        let channel = Channel::new(
            mio::net::TcpStream::from_std(stream),
            peer,
            config.callbacks,
            tls,
            config.max_recv_buf,
        );

        // Allocation failure drops the channel, closing the fd.
        let Some(id) = self.table.allocate(channel) else {
            tracing::warn!(
                loop_index = self.index,
                peer = %peer,
                "admission failed: session table exhausted"
            );
            ADMISSION_FAILURES.increment();
            return;
        };

        let token = Token(id.slot() as usize + TOKEN_BASE);
        let registered = match self.table.get_mut(id) {
            Some(ch) => {
                ch.set_id(id);
                self.poller
                    .register(ch.stream_mut(), token, Interest::READABLE | Interest::WRITABLE)
            }
            None => return,
        };
        if let Err(e) = registered {
            tracing::warn!(session = %id, error = %e, "admission failed: poll registration");
            ADMISSION_FAILURES.increment();
            self.table.release(id);
            return;
        }

        SESSIONS_ADMITTED.increment();
        SESSIONS_ACTIVE.increment();
        tracing::debug!(session = %id, peer = %peer, "session admitted");

        // Enter strictly precedes any data callback: readiness events are
        // only dispatched after the task drain completes.
        let (enter, peer_addr) = match self.table.get_mut(id) {
            Some(ch) => (ch.callbacks().enter.clone(), ch.peer_addr()),
            None => return,
        };
        enter(id, peer_addr);
    }

    fn dispatch(&mut self, event: &Event) {
        if event.token == WAKER_TOKEN {
            return;
        }
        let slot = (event.token.0 - TOKEN_BASE) as u16;
        let Some(ch) = self.table.get_mut_by_slot(slot) else {
            return;
        };

        if event.readable || event.closed {
            ch.on_readable(&mut self.scratch);
        }
        if event.writable {
            ch.on_writable();
        }
        if event.error {
            ch.force_close();
        }
        if ch.is_closed() {
            self.dead.push(slot);
        }
    }

    fn advance_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(next)) = self.timers.peek() {
            if next.at > now {
                break;
            }
            let Some(Reverse(entry)) = self.timers.pop() else {
                break;
            };

            // The timer may outlive its session; the generation decides.
            let Some(id) = self.table.id_by_slot(entry.slot) else {
                continue;
            };
            if id.generation() != entry.generation {
                continue;
            }
            let Some(ch) = self.table.get_mut_by_slot(entry.slot) else {
                continue;
            };
            let Some(interval) = ch.ping_interval() else {
                continue;
            };

            let idle = now.duration_since(ch.last_activity());
            if idle >= interval {
                tracing::debug!(session = %id, idle_ms = idle.as_millis() as u64, "ping check expired");
                PING_TIMEOUTS.increment();
                ch.force_close();
                self.dead.push(entry.slot);
            } else {
                let at = ch.last_activity() + interval;
                self.timers.push(Reverse(TimerEntry {
                    at,
                    slot: entry.slot,
                    generation: entry.generation,
                }));
            }
        }
    }

    /// Release closed channels: deregister, fire the disconnect callback
    /// exactly once, free the session ID.
    fn reap(&mut self) {
        while let Some(slot) = self.dead.pop() {
            let Some(id) = self.table.id_by_slot(slot) else {
                continue;
            };
            let Some(mut channel) = self.table.release(id) else {
                continue;
            };
            let _ = self.poller.deregister(channel.stream_mut());
            SESSIONS_ACTIVE.decrement();
            SESSIONS_CLOSED.increment();
            tracing::debug!(session = %id, "session closed");
            (channel.callbacks().disconnect.clone())(id);
        }
    }

    fn close_all(&mut self) {
        for slot in self.table.live_slots() {
            if let Some(ch) = self.table.get_mut_by_slot(slot) {
                ch.force_close();
                self.dead.push(slot);
            }
        }
        self.reap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn connected_pair() -> (std::net::TcpStream, std::net::TcpStream, SocketAddr) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        (server, client, peer)
    }

    #[test]
    fn stop_terminates_loop() {
        let (event_loop, handle) = EventLoop::create(0, None).unwrap();
        let join = std::thread::spawn(move || event_loop.run());
        assert!(handle.post(Task::Stop));
        join.join().unwrap();
        // Posting after exit fails.
        assert!(!handle.post(Task::Wakeup));
    }

    #[test]
    fn register_fires_enter_then_disconnect_once() {
        let (event_loop, handle) = EventLoop::create(0, None).unwrap();
        let join = std::thread::spawn(move || event_loop.run());

        let (tx, rx) = mpsc::channel();
        let enter_tx = std::sync::Mutex::new(tx.clone());
        let disconnect_tx = std::sync::Mutex::new(tx);
        let callbacks = SessionCallbacks {
            enter: Arc::new(move |id, _| enter_tx.lock().unwrap().send(("enter", id)).unwrap()),
            disconnect: Arc::new(move |id| {
                disconnect_tx.lock().unwrap().send(("disconnect", id)).unwrap()
            }),
            data: Arc::new(|_, b| b.len()),
        };

        let (server, _client, peer) = connected_pair();
        assert!(handle.post(Task::Register {
            stream: server,
            peer,
            config: ChannelConfig {
                callbacks,
                tls: None,
                max_recv_buf: 64 * 1024,
            },
        }));

        let (kind, id) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(kind, "enter");
        assert_eq!(id.loop_index(), 0);

        assert!(handle.post(Task::Disconnect { id }));
        let (kind, closed_id) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(kind, "disconnect");
        assert_eq!(closed_id, id);

        // A second disconnect on the now-stale ID is a silent no-op.
        assert!(handle.post(Task::Disconnect { id }));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        handle.post(Task::Stop);
        join.join().unwrap();
    }

    #[test]
    fn frame_callback_ticks() {
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let frame: FrameCallback = Arc::new(move |index| {
            let _ = tx.lock().unwrap().send(index);
        });
        let (event_loop, handle) = EventLoop::create(3, Some(frame)).unwrap();
        let join = std::thread::spawn(move || event_loop.run());

        // Wakeups force iterations even with no I/O.
        handle.post(Task::Wakeup);
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 3);

        handle.post(Task::Stop);
        join.join().unwrap();
    }
}
