// ABOUTME: Session (C3) - the per-peer engine: outbound queue, dispatch table, keepalive wiring
// ABOUTME: Confines all shared mutable state to message-passing and atomics (§5, §9)

use crate::codec::Payload;
use crate::error::SessionError;
use crate::frame::{self, FrameError, FrameReader, FrameWriter};
use crate::message::MessageId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

/// A handler invoked for every enabled frame matching its message id.
///
/// Receives the decoded payload and a shared handle to the session it
/// arrived on, so the handler may call [`Session::send`] or
/// [`Session::set_handler`] reentrantly (§4.3 "Reentrancy").
pub type Handler<M> = Arc<dyn Fn(Payload, Arc<Session<M>>) + Send + Sync>;

type FailedSendHook = Arc<dyn Fn(Payload) + Send + Sync>;
type FailedReadHook = Arc<dyn Fn(SessionError) + Send + Sync>;
type PingTimeoutHook = Arc<dyn Fn() + Send + Sync>;

struct DispatchEntry<M: MessageId> {
    handler: Handler<M>,
    enabled: bool,
}

/// An outbound frame plus an optional completion channel. The keepalive
/// loop uses the ack to observe a ping's write outcome the way an ordinary
/// `send` cannot (§4.4, §7 "PingSendFailed").
struct OutboundItem {
    payload: Payload,
    ack: Option<oneshot::Sender<Result<(), FrameError>>>,
}

/// Opaque identity for a [`Session`], used as the Acceptor's registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Keepalive timing and default dispatch behavior stamped into a new Session
/// by its Acceptor or Connector (§3, §4.4).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long the keepalive initiator waits for a `ping_response` before
    /// declaring the session dead.
    pub ping_timeout: Duration,
    /// Target idle time between successive pings, less the last RTT.
    pub ping_delay: Duration,
    /// Whether this session actively pings its peer.
    pub ping_enabled: bool,
    /// Whether this session answers the peer's `ping_request`s.
    pub respond_to_pings: bool,
    /// Cap on a declared inbound body size (§4.2).
    pub max_payload_size: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(10),
            ping_delay: Duration::from_secs(30),
            ping_enabled: true,
            respond_to_pings: true,
            max_payload_size: frame::DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

#[derive(Default)]
struct Hooks {
    on_failed_send: Mutex<Option<FailedSendHook>>,
    on_failed_read: Mutex<Option<FailedReadHook>>,
    on_ping_timeout: Mutex<Option<PingTimeoutHook>>,
}

/// The per-peer session engine (§4.3).
///
/// Always lives behind an `Arc`: handlers, the Acceptor's registry, and the
/// owner all hold clones so the session outlives any single reentrant
/// callback (§5 "Resource lifetime").
pub struct Session<M: MessageId> {
    id: SessionId,
    peer_addr: SocketAddr,
    connected: AtomicBool,
    // Shared with the read/write/keepalive tasks as plain `Arc` clones (not
    // through `Arc<Session>`) so those tasks can check liveness and wake from
    // a parked wait without holding a strong reference to the Session itself.
    // That keeps the owner's last `Arc<Session>` drop able to reach a zero
    // refcount and run `Drop` (§3 "active flag toggled by destruction").
    active: Arc<AtomicBool>,
    started: AtomicBool,
    outbound_tx: Mutex<Option<mpsc::UnboundedSender<OutboundItem>>>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<OutboundItem>>>,
    reader: Mutex<Option<FrameReader>>,
    writer: Mutex<Option<FrameWriter>>,
    dispatch: Mutex<HashMap<M, DispatchEntry<M>>>,
    config: SessionConfig,
    hooks: Hooks,
    stop_notify: Arc<Notify>,
    ping_waiter: Mutex<Option<oneshot::Sender<()>>>,
}

impl<M: MessageId> Session<M> {
    /// Wrap a freshly connected or accepted socket in a new, unstarted
    /// Session, with the default `ping_request`/`ping_response` handlers
    /// installed per `config`.
    pub fn new(socket: TcpStream, config: SessionConfig) -> Arc<Self> {
        let peer_addr = socket
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (reader, writer) =
            frame::split_with_max_payload_size(socket, config.max_payload_size);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let mut dispatch = HashMap::new();
        dispatch.insert(
            M::PING_REQUEST,
            DispatchEntry {
                handler: Arc::new(|_payload, session: Arc<Session<M>>| {
                    let mut response = Payload::new();
                    response.push_id(M::PING_RESPONSE);
                    session.send(response);
                }),
                enabled: config.respond_to_pings,
            },
        );
        dispatch.insert(
            M::PING_RESPONSE,
            DispatchEntry {
                handler: Arc::new(|_payload, session: Arc<Session<M>>| {
                    session.complete_ping();
                }),
                enabled: config.ping_enabled,
            },
        );

        Arc::new(Self {
            id: SessionId::next(),
            peer_addr,
            connected: AtomicBool::new(false),
            active: Arc::new(AtomicBool::new(true)),
            started: AtomicBool::new(false),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            dispatch: Mutex::new(dispatch),
            config,
            hooks: Hooks::default(),
            stop_notify: Arc::new(Notify::new()),
            ping_waiter: Mutex::new(None),
        })
    }

    /// Opaque identity, stable for the session's lifetime.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The remote peer's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Observable liveness (§4.3). Flips to false on any terminal I/O
    /// failure, a ping timeout, or `stop()`.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Keepalive and framing configuration this session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Set the hook invoked (on a detached task) when a write fails.
    pub fn on_failed_send<F>(&self, hook: F)
    where
        F: Fn(Payload) + Send + Sync + 'static,
    {
        *self.hooks.on_failed_send.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Set the hook invoked (on a detached task) when the read loop fails.
    pub fn on_failed_read<F>(&self, hook: F)
    where
        F: Fn(SessionError) + Send + Sync + 'static,
    {
        *self.hooks.on_failed_read.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Set the hook invoked (on a detached task) on a keepalive timeout.
    pub fn on_ping_timeout<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.hooks.on_ping_timeout.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Install or replace the dispatch entry for `id` (§4.3).
    pub fn set_handler<F>(&self, id: M, handler: F, enabled: bool)
    where
        F: Fn(Payload, Arc<Session<M>>) + Send + Sync + 'static,
    {
        self.dispatch.lock().unwrap().insert(
            id,
            DispatchEntry {
                handler: Arc::new(handler),
                enabled,
            },
        );
    }

    /// Toggle whether an existing dispatch entry fires, without touching
    /// the handler itself. A no-op if no entry exists for `id`.
    pub fn set_enabled(&self, id: M, enabled: bool) {
        if let Some(entry) = self.dispatch.lock().unwrap().get_mut(&id) {
            entry.enabled = enabled;
        }
    }

    /// Schedule `payload` for transmission (§4.3 "Send pipeline").
    ///
    /// Safe to call from any thread and from within a handler. Frames are
    /// written in the order in which `send` calls are observed by the
    /// writer task; if the session has already stopped, the payload is
    /// silently dropped.
    pub fn send(&self, payload: Payload) {
        if let Some(tx) = self.outbound_tx.lock().unwrap().as_ref() {
            let _ = tx.send(OutboundItem { payload, ack: None });
        }
    }

    /// Like [`Self::send`], but returns a receiver that resolves once the
    /// writer task has attempted the write, carrying its outcome. Used by
    /// the keepalive loop, which needs to distinguish "the ping_request
    /// itself failed to send" from "it sent fine but no response came".
    pub(crate) fn send_for_ack(&self, payload: Payload) -> oneshot::Receiver<Result<(), FrameError>> {
        let (tx, rx) = oneshot::channel();
        // If the outbound queue is already gone, `tx` is simply dropped
        // here and the awaiting caller sees a closed channel.
        if let Some(outbound) = self.outbound_tx.lock().unwrap().as_ref() {
            let _ = outbound.send(OutboundItem {
                payload,
                ack: Some(tx),
            });
        }
        rx
    }

    /// Start the inbound loop, the outbound writer, and (if enabled) the
    /// keepalive loop. Idempotent: a second call is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let reader = self.reader.lock().unwrap().take();
        let writer = self.writer.lock().unwrap().take();
        let outbound_rx = self.outbound_rx.lock().unwrap().take();

        let (Some(reader), Some(writer), Some(outbound_rx)) = (reader, writer, outbound_rx)
        else {
            return;
        };

        self.connected.store(true, Ordering::SeqCst);

        // The loop tasks below hold only a `Weak` handle plus the two `Arc`s
        // they need to wait cooperatively (`active`, `stop_notify`); they
        // upgrade to a strong `Arc<Session>` only for the duration of the
        // work that follows a wakeup, never while parked. Holding a strong
        // `Arc<Self>` for the task's whole lifetime would keep the Session
        // alive past the owner's last drop, so `Drop` could never run.
        let weak = Arc::downgrade(self);
        let active = self.active.clone();
        let stop_notify = self.stop_notify.clone();

        tokio::spawn(Self::run_write_loop(
            weak.clone(),
            active.clone(),
            stop_notify.clone(),
            writer,
            outbound_rx,
        ));
        tokio::spawn(Self::run_read_loop(weak.clone(), active, stop_notify, reader));
        if self.config.ping_enabled {
            tokio::spawn(crate::keepalive::run(weak));
        }
    }

    /// Stop the session: flips `connected` to false, wakes cooperative
    /// loops, and drops the outbound sender so the writer task drains and
    /// exits. Safe to call more than once.
    pub fn stop(&self) {
        self.mark_transport_down();
    }

    /// Flip both liveness flags, drop the outbound sender, and wake
    /// cooperative loops, without touching any owner hook.
    fn mark_transport_down(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.outbound_tx.lock().unwrap().take();
        self.stop_notify.notify_waiters();
    }

    fn mark_failed_read(&self, cause: SessionError) {
        warn!(error = %cause, "session read loop failed");
        self.mark_transport_down();
        if let Some(hook) = self.hooks.on_failed_read.lock().unwrap().clone() {
            tokio::spawn(async move { hook(cause) });
        }
    }

    fn mark_ping_timeout(&self) {
        let cause = SessionError::PingExpired;
        warn!(error = %cause, "keepalive ping timed out");
        self.mark_transport_down();
        if let Some(hook) = self.hooks.on_ping_timeout.lock().unwrap().clone() {
            tokio::spawn(async move { hook() });
        }
    }

    /// §7: a failure sending the keepalive's own `ping_request` is
    /// classified the same as a read failure, either way the transport is
    /// dead and the owner's `on_failed_read` hook is the right place to
    /// hear about it.
    fn mark_ping_send_failed(&self, cause: FrameError) {
        self.mark_failed_read(SessionError::PingSendFailed(cause));
    }

    fn invoke_failed_send(&self, payload: Payload) {
        if let Some(hook) = self.hooks.on_failed_send.lock().unwrap().clone() {
            tokio::spawn(async move { hook(payload) });
        }
    }

    /// Drains the outbound queue and writes one frame at a time.
    ///
    /// Holds only `Weak<Self>` plus the `active`/`stop_notify` handles while
    /// parked in the `select!` below; it upgrades to a strong `Arc` only
    /// after something to do arrives, so the owner dropping its last
    /// `Arc<Session>` while this loop is idle still lets the Session drop.
    async fn run_write_loop(
        session: Weak<Self>,
        active: Arc<AtomicBool>,
        stop_notify: Arc<Notify>,
        mut writer: FrameWriter,
        mut rx: mpsc::UnboundedReceiver<OutboundItem>,
    ) {
        loop {
            if !active.load(Ordering::SeqCst) {
                break;
            }
            let item = tokio::select! {
                _ = stop_notify.notified() => break,
                maybe = rx.recv() => match maybe {
                    Some(item) => item,
                    None => break,
                },
            };

            match writer.write_frame(&item.payload).await {
                Ok(()) => {
                    if let Some(ack) = item.ack {
                        let _ = ack.send(Ok(()));
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed to write frame");
                    if let Some(session) = session.upgrade() {
                        session.mark_transport_down();
                    }
                    match item.ack {
                        Some(ack) => {
                            let _ = ack.send(Err(err));
                        }
                        None => {
                            if let Some(session) = session.upgrade() {
                                session.invoke_failed_send(item.payload);
                            }
                        }
                    }
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Reads frames and dispatches them by message id.
    ///
    /// Same `Weak`-while-parked discipline as [`Self::run_write_loop`]: the
    /// `active`/`stop_notify` handles let this loop notice a stop or wake
    /// from an idle `read_size` wait without a strong `Arc<Self>` keeping
    /// the Session alive for the duration of that wait.
    async fn run_read_loop(
        session: Weak<Self>,
        active: Arc<AtomicBool>,
        stop_notify: Arc<Notify>,
        mut reader: FrameReader,
    ) {
        loop {
            if !active.load(Ordering::SeqCst) {
                break;
            }

            let size = tokio::select! {
                _ = stop_notify.notified() => break,
                result = reader.read_size() => result,
            };

            let Some(session) = session.upgrade() else {
                break;
            };

            let size = match size {
                Ok(Some(size)) => size,
                Ok(None) => {
                    debug!(peer = %session.peer_addr, "peer closed connection");
                    active.store(false, Ordering::SeqCst);
                    session.connected.store(false, Ordering::SeqCst);
                    break;
                }
                Err(err) => {
                    session.mark_failed_read(err.into());
                    break;
                }
            };

            let mut payload = match reader.read_body(size).await {
                Ok(payload) => payload,
                Err(err) => {
                    session.mark_failed_read(err.into());
                    break;
                }
            };

            let id = match payload.pop_id::<M>() {
                Ok(id) => id,
                Err(err) => {
                    session.mark_failed_read(err.into());
                    break;
                }
            };

            if !active.load(Ordering::SeqCst) {
                break;
            }

            let entry = {
                let table = session.dispatch.lock().unwrap();
                table
                    .get(&id)
                    .filter(|entry| entry.enabled)
                    .map(|entry| entry.handler.clone())
            };

            if let Some(handler) = entry {
                let session_for_handler = session.clone();
                tokio::spawn(async move {
                    handler(payload, session_for_handler);
                });
            } else {
                debug!(?id, "no enabled handler for message id");
            }
        }
    }

    /// Arm a one-shot completion for the next `ping_response`, used by the
    /// keepalive loop. Any previously armed waiter is dropped (at most one
    /// outstanding ping per §4.4).
    pub(crate) fn arm_ping(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.ping_waiter.lock().unwrap() = Some(tx);
        rx
    }

    /// Disarm the current ping waiter (called by the keepalive loop on
    /// timeout, so a late response is dropped silently per §4.4).
    pub(crate) fn disarm_ping(&self) {
        self.ping_waiter.lock().unwrap().take();
    }

    fn complete_ping(&self) {
        if let Some(tx) = self.ping_waiter.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    pub(crate) fn on_ping_timeout_fired(&self) {
        self.mark_ping_timeout();
    }

    pub(crate) fn on_ping_send_failed(&self, cause: FrameError) {
        self.mark_ping_send_failed(cause);
    }
}

impl<M: MessageId> Drop for Session<M> {
    /// §3: the *active* flag is "toggled by destruction" as well as by
    /// `stop()`, a caller that drops its last handle without calling
    /// `stop()` explicitly must still see the cooperative loops wind down.
    /// The loops hold only `Weak` handles (see [`Self::run_read_loop`]), so
    /// this runs as soon as the last `Arc<Session>` goes away rather than
    /// being starved by a reference cycle.
    fn drop(&mut self) {
        self.mark_transport_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::test_ids::DemoId;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    fn config() -> SessionConfig {
        SessionConfig {
            ping_enabled: false,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn echo_handler_receives_dispatched_frame() {
        let (server_sock, client_sock) = loopback_pair().await;
        let server = Session::<DemoId>::new(server_sock, config());
        let client = Session::<DemoId>::new(client_sock, config());

        let received = Arc::new(std::sync::Mutex::new(None));
        let received_clone = received.clone();
        server.set_handler(
            DemoId::MessageRequest,
            move |mut payload: Payload, session: Arc<Session<DemoId>>| {
                let text = payload.pop_string().unwrap();
                *received_clone.lock().unwrap() = Some(text.clone());
                let mut response = Payload::new();
                response.push_str(&text);
                response.push_id(DemoId::MessageResponse);
                session.send(response);
            },
            true,
        );

        let response_received = Arc::new(AtomicUsize::new(0));
        let response_clone = response_received.clone();
        client.set_handler(
            DemoId::MessageResponse,
            move |mut payload: Payload, _session| {
                assert_eq!(payload.pop_string().unwrap(), "hello");
                response_clone.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        server.start();
        client.start();

        let mut request = Payload::new();
        request.push_str("hello");
        request.push_id(DemoId::MessageRequest);
        client.send(request);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(received.lock().unwrap().as_deref(), Some("hello"));
        assert_eq!(response_received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn set_enabled_false_suppresses_dispatch_but_keeps_entry() {
        let (server_sock, client_sock) = loopback_pair().await;
        let server = Session::<DemoId>::new(server_sock, config());
        let client = Session::<DemoId>::new(client_sock, config());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        server.set_handler(
            DemoId::MessageRequest,
            move |_payload, _session| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
        server.set_enabled(DemoId::MessageRequest, false);

        server.start();
        client.start();

        let mut request = Payload::new();
        request.push_id(DemoId::MessageRequest);
        client.send(request);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_prevents_further_dispatch() {
        let (server_sock, client_sock) = loopback_pair().await;
        let server = Session::<DemoId>::new(server_sock, config());
        let client = Session::<DemoId>::new(client_sock, config());

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        server.set_handler(
            DemoId::MessageRequest,
            move |_payload, _session| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );

        server.start();
        client.start();
        server.stop();

        assert!(!server.connected());

        let mut request = Payload::new();
        request.push_id(DemoId::MessageRequest);
        client.send(request);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
