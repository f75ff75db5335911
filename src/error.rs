// ABOUTME: Session-level error kinds (§7) shared by the read loop, write loop, and keepalive
// ABOUTME: Wraps the lower-level Frame/Codec errors without losing their cause

use crate::codec::CodecError;
use crate::frame::FrameError;
use thiserror::Error;

/// Unrecoverable causes that end a [`crate::session::Session`].
///
/// `IoError` and `FramingError` come from the transport; `CodecError` comes
/// from a handler popping a payload incorrectly; `PingExpired` and
/// `PingSendFailed` come from the keepalive loop (§4.4, §7).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("framing error: {0}")]
    FramingError(FrameError),

    #[error("codec error: {0}")]
    CodecError(#[from] CodecError),

    #[error("ping timed out waiting for ping_response")]
    PingExpired,

    #[error("failed to send ping_request: {0}")]
    PingSendFailed(FrameError),
}

impl From<FrameError> for SessionError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(e) => SessionError::IoError(e),
            other => SessionError::FramingError(other),
        }
    }
}

/// Failures from [`crate::acceptor::Acceptor::bind`] and its accept loop.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

/// Failures from [`crate::connector::Connector::connect`].
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to resolve address {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("address {address} resolved to no usable endpoints")]
    NoAddresses { address: String },

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },
}
