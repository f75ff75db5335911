// ABOUTME: Acceptor (C5, server half) - binds a listening endpoint and produces started Sessions
// ABOUTME: A single accept is ever in flight; completion always re-arms the next one (§4.5)

use crate::error::AcceptError;
use crate::message::MessageId;
use crate::session::{Session, SessionConfig, SessionId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, info, warn};

type SessionHook<M> = Arc<dyn Fn(Arc<Session<M>>) + Send + Sync>;

/// Server-side factory of started [`Session`]s (§4.5).
///
/// Owns the listening socket, the *accepting* flag, and the registry of
/// live sessions. The registry is exclusively owned here; handlers are
/// only ever handed a shared [`Arc<Session<M>>`] so a session outlives any
/// reentrant callback (§3 "Ownership summary").
pub struct Acceptor<M: MessageId> {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    accepting: AtomicBool,
    config: SessionConfig,
    registry: Mutex<HashMap<SessionId, Arc<Session<M>>>>,
    on_client_connected: Mutex<Option<SessionHook<M>>>,
    on_forbidden_connection: Mutex<Option<SessionHook<M>>>,
}

impl<M: MessageId> Acceptor<M> {
    /// Bind a listening socket at `addr` with `config` stamped into every
    /// accepted Session. Does not start accepting; call [`Self::start_accept`].
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: SessionConfig) -> Result<Arc<Self>, AcceptError> {
        let listener = TcpListener::bind(addr).await.map_err(AcceptError::Bind)?;
        let local_addr = listener.local_addr().map_err(AcceptError::Bind)?;
        info!(%local_addr, "acceptor bound");
        Ok(Arc::new(Self {
            local_addr,
            listener: Mutex::new(Some(listener)),
            accepting: AtomicBool::new(false),
            config,
            registry: Mutex::new(HashMap::new()),
            on_client_connected: Mutex::new(None),
            on_forbidden_connection: Mutex::new(None),
        }))
    }

    /// The bound local address, useful when `addr` used port `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Set the hook invoked (on a detached task) for each accepted
    /// connection while accepting is enabled.
    pub fn on_client_connected<F>(&self, hook: F)
    where
        F: Fn(Arc<Session<M>>) + Send + Sync + 'static,
    {
        *self.on_client_connected.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Set the hook invoked (on a detached task) for a connection that
    /// completes after [`Self::stop_accept`] was called.
    pub fn on_forbidden_connection<F>(&self, hook: F)
    where
        F: Fn(Arc<Session<M>>) + Send + Sync + 'static,
    {
        *self.on_forbidden_connection.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Whether accepted connections are currently routed to
    /// `on_client_connected` (`true`) or `on_forbidden_connection` (`false`).
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Begin routing accepted connections to `on_client_connected`, and
    /// launch the accept loop on first call. Idempotent.
    pub fn start_accept(self: &Arc<Self>) {
        self.accepting.store(true, Ordering::SeqCst);
        if let Some(listener) = self.listener.lock().unwrap().take() {
            tokio::spawn(Self::run_accept_loop(self.clone(), listener));
        }
    }

    /// Stop routing accepted connections to `on_client_connected`; any
    /// connection that completes hereafter is handed to
    /// `on_forbidden_connection` instead and closed (§4.5). The accept loop
    /// itself keeps running, a single accept is always in flight.
    pub fn stop_accept(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Remove `id` from the registry and stop its session.
    pub fn close(&self, id: SessionId) {
        if let Some(session) = self.registry.lock().unwrap().remove(&id) {
            session.stop();
        }
    }

    /// Stop and drop every live session.
    pub fn close_all(&self) {
        let sessions: Vec<_> = self.registry.lock().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.stop();
        }
    }

    /// A snapshot of the currently registered sessions.
    pub fn sessions(&self) -> Vec<Arc<Session<M>>> {
        self.registry.lock().unwrap().values().cloned().collect()
    }

    async fn run_accept_loop(acceptor: Arc<Self>, listener: TcpListener) {
        loop {
            let (socket, peer_addr) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            debug!(%peer_addr, "accepted connection");

            let session = Session::new(socket, acceptor.config.clone());

            if acceptor.accepting.load(Ordering::SeqCst) {
                acceptor
                    .registry
                    .lock()
                    .unwrap()
                    .insert(session.id(), session.clone());
                session.start();

                if let Some(hook) = acceptor.on_client_connected.lock().unwrap().clone() {
                    let session = session.clone();
                    tokio::spawn(async move { hook(session) });
                }
            } else {
                if let Some(hook) = acceptor.on_forbidden_connection.lock().unwrap().clone() {
                    let session_for_hook = session.clone();
                    tokio::spawn(async move { hook(session_for_hook) });
                }
                session.stop();
            }
        }
    }
}

impl<M: MessageId> Drop for Acceptor<M> {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::test_ids::DemoId;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn config() -> SessionConfig {
        SessionConfig {
            ping_enabled: false,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn accepted_connection_invokes_client_connected_hook() {
        let acceptor = Acceptor::<DemoId>::bind("127.0.0.1:0", config()).await.unwrap();
        let connected = Arc::new(AtomicUsize::new(0));
        let connected_clone = connected.clone();
        acceptor.on_client_connected(move |_session| {
            connected_clone.fetch_add(1, Ordering::SeqCst);
        });
        acceptor.start_accept();

        let _client = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(connected.load(Ordering::SeqCst), 1);
        assert_eq!(acceptor.sessions().len(), 1);
    }

    #[tokio::test]
    async fn connection_after_stop_accept_is_forbidden_and_closed() {
        let acceptor = Acceptor::<DemoId>::bind("127.0.0.1:0", config()).await.unwrap();
        let forbidden = Arc::new(AtomicUsize::new(0));
        let forbidden_clone = forbidden.clone();
        acceptor.on_forbidden_connection(move |_session| {
            forbidden_clone.fetch_add(1, Ordering::SeqCst);
        });
        acceptor.start_accept();

        // S5: a first client connects and starts running while accepting is
        // still enabled.
        let _first_client = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let first_sessions = acceptor.sessions();
        assert_eq!(first_sessions.len(), 1);
        let first_session = first_sessions[0].clone();
        assert!(first_session.connected());

        acceptor.stop_accept();

        // A second client connects after stop_accept(); it must be routed to
        // on_forbidden_connection and closed, leaving the first session
        // untouched.
        let _second_client = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(forbidden.load(Ordering::SeqCst), 1);
        assert_eq!(acceptor.sessions().len(), 1);
        assert_eq!(acceptor.sessions()[0].id(), first_session.id());
        assert!(first_session.connected());
    }

    #[tokio::test]
    async fn close_all_stops_every_registered_session() {
        let acceptor = Acceptor::<DemoId>::bind("127.0.0.1:0", config()).await.unwrap();
        acceptor.start_accept();

        let _c1 = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        let _c2 = TcpStream::connect(acceptor.local_addr()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sessions = acceptor.sessions();
        assert_eq!(sessions.len(), 2);

        acceptor.close_all();
        for session in &sessions {
            assert!(!session.connected());
        }
        assert_eq!(acceptor.sessions().len(), 0);
    }
}
