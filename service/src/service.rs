//! The TCP service: owns the reactor pool, the listen thread, and the
//! public per-session API.

use crate::channel::{
    DataCallback, DisconnectCallback, EnterCallback, SentCallback, SessionCallbacks,
};
use crate::error::ServiceError;
use crate::event_loop::{self, ChannelConfig, EventLoop, FrameCallback, LoopHandle, Task};
use crate::listener::{AcceptCallback, ListenThread};
use crate::session::SessionId;
use crate::tls::{self, TlsIdentity, TlsInit};
use crate::workers::{self, WorkerHandle};
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustls_pki_types::ServerName;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// TLS setup for one admitted channel.
pub enum TlsMode {
    None,
    /// Accept-side TLS using the certificate context loaded by
    /// `start_listen`.
    Accept,
    /// Connect-side TLS, verifying the peer against `server_name`.
    Connect { server_name: String },
}

/// Admission options for [`TcpService::add_channel`].
///
/// Callback overrides fall back to the service-level defaults.
pub struct ChannelOptions {
    pub enter: Option<EnterCallback>,
    pub disconnect: Option<DisconnectCallback>,
    pub data: Option<DataCallback>,
    pub tls: TlsMode,
    pub max_recv_buffer: usize,
    pub pin_current_loop: bool,
}

impl ChannelOptions {
    pub fn new(max_recv_buffer: usize) -> Self {
        Self {
            enter: None,
            disconnect: None,
            data: None,
            tls: TlsMode::None,
            max_recv_buffer,
            pin_current_loop: false,
        }
    }

    pub fn enter(mut self, cb: EnterCallback) -> Self {
        self.enter = Some(cb);
        self
    }

    pub fn disconnect(mut self, cb: DisconnectCallback) -> Self {
        self.disconnect = Some(cb);
        self
    }

    pub fn data(mut self, cb: DataCallback) -> Self {
        self.data = Some(cb);
        self
    }

    pub fn tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    /// Admit onto the calling loop when the caller is a worker thread.
    pub fn pin_current_loop(mut self) -> Self {
        self.pin_current_loop = true;
        self
    }
}

struct WorkerSet {
    handles: Vec<LoopHandle>,
    joins: Mutex<Vec<WorkerHandle>>,
}

struct ServiceInner {
    instance: usize,
    enter: RwLock<Option<EnterCallback>>,
    disconnect: RwLock<Option<DisconnectCallback>>,
    data: RwLock<Option<DataCallback>>,
    workers: RwLock<Option<Arc<WorkerSet>>>,
    listen: Mutex<Option<ListenThread>>,
    acceptor: RwLock<Option<Arc<rustls::ServerConfig>>>,
    next_loop: AtomicUsize,
}

static INSTANCE_COUNTER: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    // Per (submitting thread, service instance) batches for cache_send.
    static SEND_CACHE: RefCell<HashMap<usize, Vec<(SessionId, Bytes, Option<SentCallback>)>>> =
        RefCell::new(HashMap::new());
}

/// Multi-reactor TCP service.
///
/// Cloning is cheap and shares the same service; all methods take `&self`
/// and may be called from any thread. No method blocks on I/O: per-session
/// requests are posted to the owning loop and return immediately.
#[derive(Clone)]
pub struct TcpService {
    inner: Arc<ServiceInner>,
}

impl Default for TcpService {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpService {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                instance: INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed),
                enter: RwLock::new(None),
                disconnect: RwLock::new(None),
                data: RwLock::new(None),
                workers: RwLock::new(None),
                listen: Mutex::new(None),
                acceptor: RwLock::new(None),
                next_loop: AtomicUsize::new(0),
            }),
        }
    }

    // --- Default callbacks -------------------------------------------------

    /// Default enter callback, fired on the owning loop when a session is
    /// admitted. Enter strictly precedes any data callback.
    pub fn set_enter_callback(&self, cb: EnterCallback) {
        *self.inner.enter.write() = Some(cb);
    }

    /// Default disconnect callback; fires exactly once per session, after
    /// every other callback for it.
    pub fn set_disconnect_callback(&self, cb: DisconnectCallback) {
        *self.inner.disconnect.write() = Some(cb);
    }

    /// Default data callback; returns the number of bytes consumed.
    pub fn set_data_callback(&self, cb: DataCallback) {
        *self.inner.data.write() = Some(cb);
    }

    pub fn enter_callback(&self) -> Option<EnterCallback> {
        self.inner.enter.read().clone()
    }

    pub fn disconnect_callback(&self) -> Option<DisconnectCallback> {
        self.inner.disconnect.read().clone()
    }

    pub fn data_callback(&self) -> Option<DataCallback> {
        self.inner.data.read().clone()
    }

    // --- Lifecycle ---------------------------------------------------------

    /// Spawn `count` loop workers. The frame callback, when given, runs
    /// once per loop iteration on each worker.
    pub fn start_workers(
        &self,
        count: usize,
        frame: Option<FrameCallback>,
    ) -> Result<(), ServiceError> {
        self.spawn_loops(count, None, frame)
    }

    /// Like [`TcpService::start_workers`], pinning worker `i` to
    /// `cpus[i % cpus.len()]`.
    pub fn start_workers_pinned(
        &self,
        count: usize,
        cpus: &[usize],
        frame: Option<FrameCallback>,
    ) -> Result<(), ServiceError> {
        self.spawn_loops(count, Some(cpus), frame)
    }

    fn spawn_loops(
        &self,
        count: usize,
        cpus: Option<&[usize]>,
        frame: Option<FrameCallback>,
    ) -> Result<(), ServiceError> {
        if count == 0 || count > (u16::MAX as usize) + 1 {
            return Err(ServiceError::InvalidWorkerCount(count));
        }
        let mut guard = self.inner.workers.write();
        if guard.is_some() {
            return Err(ServiceError::WorkersAlreadyStarted);
        }

        let mut loops = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let (event_loop, handle) = EventLoop::create(index as u16, frame.clone())?;
            loops.push(event_loop);
            handles.push(handle);
        }

        let joins = workers::spawn_workers(loops, cpus, "loop", |_, event_loop: EventLoop| {
            event_loop.run()
        })?;

        *guard = Some(Arc::new(WorkerSet {
            handles,
            joins: Mutex::new(joins),
        }));
        tracing::info!(workers = count, "loop workers started");
        Ok(())
    }

    /// Start the listen thread. With a TLS identity, accepted sessions run
    /// accept-side TLS. Returns the bound address, resolving port 0.
    pub fn start_listen(
        &self,
        addr: SocketAddr,
        max_recv_buffer: usize,
        tls: Option<TlsIdentity>,
    ) -> Result<SocketAddr, ServiceError> {
        if self.inner.workers.read().is_none() {
            return Err(ServiceError::WorkersNotStarted);
        }
        let mut guard = self.inner.listen.lock();
        if guard.is_some() {
            return Err(ServiceError::ListenerAlreadyRunning);
        }

        let use_tls = tls.is_some();
        if let Some(identity) = tls {
            *self.inner.acceptor.write() = Some(tls::load_server_config(&identity)?);
        }

        let inner = self.inner.clone();
        let accept: AcceptCallback = Arc::new(move |stream, peer| {
            let opts = ChannelOptions {
                tls: if use_tls {
                    TlsMode::Accept
                } else {
                    TlsMode::None
                },
                ..ChannelOptions::new(max_recv_buffer)
            };
            if !inner.add_channel(stream, peer, opts) {
                tracing::warn!(peer = %peer, "admission from listener failed");
            }
        });

        let listen = ListenThread::spawn(addr, accept)?;
        let local = listen.local_addr();
        *guard = Some(listen);
        tracing::info!(addr = %local, tls = use_tls, "listen started");
        Ok(local)
    }

    /// Stop the listen thread; existing sessions are untouched.
    pub fn close_listen(&self) {
        if let Some(mut listen) = self.inner.listen.lock().take() {
            listen.stop();
        }
    }

    /// Stop and join the loop workers without releasing their sessions;
    /// no disconnect callbacks fire.
    pub fn stop_workers(&self) {
        if let Some(set) = self.inner.workers.write().take() {
            for handle in &set.handles {
                handle.post(Task::Stop);
            }
            workers::join_workers(std::mem::take(&mut *set.joins.lock()));
            tracing::info!("loop workers stopped");
        }
    }

    /// Full teardown in reverse start order: close the listener, then have
    /// every loop release its sessions (firing disconnect callbacks) and
    /// exit.
    pub fn close_service(&self) {
        self.close_listen();
        if let Some(set) = self.inner.workers.write().take() {
            for handle in &set.handles {
                handle.post(Task::CloseAll);
                handle.post(Task::Stop);
            }
            workers::join_workers(std::mem::take(&mut *set.joins.lock()));
            tracing::info!("service closed");
        }
    }

    // --- Admission ---------------------------------------------------------

    /// Admit an established connection (accepted or connected elsewhere,
    /// e.g. by the [`crate::Connector`]). Returns false when the workers
    /// are not running, the socket is dead, or TLS options are unusable;
    /// those streams are dropped.
    pub fn add_channel(&self, stream: TcpStream, opts: ChannelOptions) -> bool {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(error = %e, "add_channel on a dead socket");
                return false;
            }
        };
        self.inner.add_channel(stream, peer, opts)
    }

    // --- Send paths --------------------------------------------------------

    /// Post a packet to the session's owning loop. Stale IDs drop the
    /// packet silently; false means the service is not running or the ID
    /// never belonged to it.
    pub fn send(&self, id: SessionId, data: Bytes, sent: Option<SentCallback>) -> bool {
        self.inner.post_to_owner(id, Task::Send { id, data, sent })
    }

    /// Batch a packet in this thread's local cache; nothing crosses a
    /// thread boundary until [`TcpService::flush_cache_packets`].
    pub fn cache_send(&self, id: SessionId, data: Bytes, sent: Option<SentCallback>) -> bool {
        if self.inner.workers.read().is_none() {
            return false;
        }
        SEND_CACHE.with_borrow_mut(|cache| {
            cache
                .entry(self.inner.instance)
                .or_default()
                .push((id, data, sent));
        });
        true
    }

    /// Move this thread's cached packets to their owning loops, one post
    /// per loop, preserving this thread's submission order.
    pub fn flush_cache_packets(&self) {
        let Some(batch) =
            SEND_CACHE.with_borrow_mut(|cache| cache.remove(&self.inner.instance))
        else {
            return;
        };
        let Some(set) = self.inner.workers.read().clone() else {
            return;
        };

        let mut per_loop: Vec<Vec<(SessionId, Bytes, Option<SentCallback>)>> =
            (0..set.handles.len()).map(|_| Vec::new()).collect();
        for (id, data, sent) in batch {
            if let Some(bucket) = per_loop.get_mut(id.loop_index() as usize) {
                bucket.push((id, data, sent));
            }
        }
        for (index, entries) in per_loop.into_iter().enumerate() {
            if !entries.is_empty() {
                set.handles[index].post(Task::SendBatch { entries });
            }
        }
    }

    // --- Per-session control -----------------------------------------------

    /// Graceful half-close: already-enqueued packets drain, then FIN.
    pub fn shutdown(&self, id: SessionId) -> bool {
        self.inner.post_to_owner(id, Task::Shutdown { id })
    }

    /// Hard close. The disconnect callback still fires, on the owning
    /// loop.
    pub fn disconnect(&self, id: SessionId) -> bool {
        self.inner.post_to_owner(id, Task::Disconnect { id })
    }

    /// Arm the idle watchdog: no bytes in or out for `interval` force-
    /// disconnects the session.
    pub fn set_ping_check(&self, id: SessionId, interval: Duration) -> bool {
        self.inner.post_to_owner(id, Task::SetPingCheck { id, interval })
    }

    /// Force one iteration of the session's owning loop.
    pub fn wakeup(&self, id: SessionId) -> bool {
        self.inner.post_to_owner(id, Task::Wakeup)
    }

    /// Force one iteration of every loop.
    pub fn wakeup_all(&self) {
        if let Some(set) = self.inner.workers.read().clone() {
            for handle in &set.handles {
                handle.post(Task::Wakeup);
            }
        }
    }

    // --- Introspection -----------------------------------------------------

    pub fn loop_count(&self) -> usize {
        self.inner
            .workers
            .read()
            .as_ref()
            .map_or(0, |set| set.handles.len())
    }

    /// An arbitrary loop index, for callers that want to spread work
    /// without holding a session.
    pub fn random_loop(&self) -> Option<u16> {
        let set = self.inner.workers.read().clone()?;
        let pick = RandomState::new().build_hasher().finish() as usize % set.handles.len();
        Some(set.handles[pick].index())
    }

    /// The loop owning `id`, if it can belong to this service.
    pub fn loop_of_session(&self, id: SessionId) -> Option<u16> {
        let set = self.inner.workers.read().clone()?;
        let index = id.loop_index();
        ((index as usize) < set.handles.len()).then_some(index)
    }
}

impl ServiceInner {
    fn add_channel(&self, stream: TcpStream, peer: SocketAddr, opts: ChannelOptions) -> bool {
        let Some(set) = self.workers.read().clone() else {
            return false;
        };

        let tls_init = match opts.tls {
            TlsMode::None => None,
            TlsMode::Accept => match self.acceptor.read().clone() {
                Some(config) => Some(TlsInit::Server(config)),
                None => {
                    tracing::error!("tls admission without a configured certificate context");
                    return false;
                }
            },
            TlsMode::Connect { server_name } => match ServerName::try_from(server_name) {
                Ok(name) => Some(TlsInit::Client(tls::client_config(), name)),
                Err(e) => {
                    tracing::error!(error = %e, "invalid tls server name");
                    return false;
                }
            },
        };

        let callbacks = SessionCallbacks {
            enter: opts
                .enter
                .or_else(|| self.enter.read().clone())
                .unwrap_or_else(|| Arc::new(|_, _| {})),
            disconnect: opts
                .disconnect
                .or_else(|| self.disconnect.read().clone())
                .unwrap_or_else(|| Arc::new(|_| {})),
            data: opts
                .data
                .or_else(|| self.data.read().clone())
                .unwrap_or_else(|| Arc::new(|_, bytes| bytes.len())),
        };

        let index = self.choose_loop(&set, opts.pin_current_loop);
        set.handles[index].post(Task::Register {
            stream,
            peer,
            config: ChannelConfig {
                callbacks,
                tls: tls_init,
                max_recv_buf: opts.max_recv_buffer,
            },
        })
    }

    /// Round-robin across loops; pinned admission keeps a worker-thread
    /// caller's own loop.
    fn choose_loop(&self, set: &WorkerSet, pin: bool) -> usize {
        if pin
            && let Some(current) = event_loop::current_loop_index()
            && (current as usize) < set.handles.len()
        {
            return current as usize;
        }
        self.next_loop.fetch_add(1, Ordering::Relaxed) % set.handles.len()
    }

    fn post_to_owner(&self, id: SessionId, task: Task) -> bool {
        let Some(set) = self.workers.read().clone() else {
            return false;
        };
        match set.handles.get(id.loop_index() as usize) {
            Some(handle) => handle.post(task),
            None => false,
        }
    }
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        if let Some(mut listen) = self.listen.get_mut().take() {
            listen.stop();
        }
        if let Some(set) = self.workers.get_mut().take() {
            for handle in &set.handles {
                handle.post(Task::CloseAll);
                handle.post(Task::Stop);
            }
            workers::join_workers(std::mem::take(&mut *set.joins.lock()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_before_start_are_noops() {
        let service = TcpService::new();
        let id = SessionId::from_u64(0);
        assert!(!service.send(id, Bytes::from_static(b"x"), None));
        assert!(!service.cache_send(id, Bytes::from_static(b"x"), None));
        assert!(!service.shutdown(id));
        assert!(!service.disconnect(id));
        assert!(!service.set_ping_check(id, Duration::from_secs(1)));
        assert!(!service.wakeup(id));
        assert_eq!(service.loop_count(), 0);
        assert!(service.random_loop().is_none());
        assert!(service.loop_of_session(id).is_none());
    }

    #[test]
    fn double_start_rejected() {
        let service = TcpService::new();
        service.start_workers(2, None).unwrap();
        assert!(matches!(
            service.start_workers(2, None),
            Err(ServiceError::WorkersAlreadyStarted)
        ));
        service.stop_workers();
    }

    #[test]
    fn zero_workers_rejected() {
        let service = TcpService::new();
        assert!(matches!(
            service.start_workers(0, None),
            Err(ServiceError::InvalidWorkerCount(0))
        ));
    }

    #[test]
    fn listen_requires_workers() {
        let service = TcpService::new();
        assert!(matches!(
            service.start_listen("127.0.0.1:0".parse().unwrap(), 1024, None),
            Err(ServiceError::WorkersNotStarted)
        ));
    }

    #[test]
    fn introspection_after_start() {
        let service = TcpService::new();
        service.start_workers(3, None).unwrap();
        assert_eq!(service.loop_count(), 3);
        assert!(service.random_loop().unwrap() < 3);

        // Only IDs with a loop index in range can belong to the service.
        assert_eq!(
            service.loop_of_session(SessionId::from_u64(2)),
            Some(2)
        );
        assert!(service.loop_of_session(SessionId::from_u64(3)).is_none());

        service.close_service();
    }

    #[test]
    fn stop_workers_is_idempotent() {
        let service = TcpService::new();
        service.start_workers(1, None).unwrap();
        service.stop_workers();
        service.stop_workers();
        service.close_service();
    }
}
