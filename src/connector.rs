// ABOUTME: Connector (C5, client half) - resolves an address and produces exactly one Session
// ABOUTME: connect() returns synchronously; subsequent events are delivered through the Session

use crate::error::ConnectError;
use crate::message::MessageId;
use crate::session::{Session, SessionConfig};
use std::sync::{Arc, Mutex};
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, info};

type SessionHook<M> = Arc<dyn Fn(Arc<Session<M>>) + Send + Sync>;

/// Client-side factory of one started [`Session`] (§4.5).
pub struct Connector<M: MessageId> {
    address: String,
    config: SessionConfig,
    on_connected: Mutex<Option<SessionHook<M>>>,
}

impl<M: MessageId> Connector<M> {
    /// Build a connector targeting `address` (e.g. `"example.com:1234"`),
    /// stamping `config` into the Session it produces.
    pub fn new(address: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            address: address.into(),
            config,
            on_connected: Mutex::new(None),
        }
    }

    /// The configured destination, as passed to [`Self::new`].
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Set the hook invoked (on a detached task) once `connect` succeeds.
    pub fn on_connected<F>(&self, hook: F)
    where
        F: Fn(Arc<Session<M>>) + Send + Sync + 'static,
    {
        *self.on_connected.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Resolve the configured address, connect, wrap the socket in a
    /// started Session, and return it. The owner's `on_connected` hook (if
    /// any) fires on a detached task once the Session is already running.
    pub async fn connect(&self) -> Result<Arc<Session<M>>, ConnectError> {
        let mut addrs = lookup_host(&self.address)
            .await
            .map_err(|source| ConnectError::Resolve {
                address: self.address.clone(),
                source,
            })?;

        let addr = addrs.next().ok_or_else(|| ConnectError::NoAddresses {
            address: self.address.clone(),
        })?;

        let socket = TcpStream::connect(addr)
            .await
            .map_err(|source| ConnectError::Connect {
                address: self.address.clone(),
                source,
            })?;
        debug!(%addr, "connected");

        let session = Session::new(socket, self.config.clone());
        session.start();
        info!(peer = %session.peer_addr(), "session started");

        if let Some(hook) = self.on_connected.lock().unwrap().clone() {
            let session_for_hook = session.clone();
            tokio::spawn(async move { hook(session_for_hook) });
        }

        Ok(session)
    }
}
