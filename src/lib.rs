//! A transport library for length-prefixed, typed message exchange over TCP.
//!
//! The session engine ([`session::Session`]) frames outbound messages,
//! parses inbound ones, dispatches them by a user-defined [`message::MessageId`]
//! to registered handlers, and maintains a keepalive protocol between two
//! peers. [`acceptor::Acceptor`] is the server-side factory of started
//! sessions; [`connector::Connector`] is the client-side equivalent.
//!
//! ```rust,no_run
//! use sessionwire::acceptor::Acceptor;
//! use sessionwire::codec::Payload;
//! use sessionwire::session::SessionConfig;
//! use num_enum::TryFromPrimitive;
//!
//! #[derive(TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq, Hash)]
//! #[repr(u32)]
//! enum AppId {
//!     PingRequest = 0,
//!     PingResponse = 1,
//!     Echo = 2,
//! }
//! impl From<AppId> for u32 {
//!     fn from(id: AppId) -> Self { id as u32 }
//! }
//! impl sessionwire::message::MessageId for AppId {
//!     const PING_REQUEST: Self = AppId::PingRequest;
//!     const PING_RESPONSE: Self = AppId::PingResponse;
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let acceptor = Acceptor::<AppId>::bind("127.0.0.1:0", SessionConfig::default()).await?;
//! acceptor.on_client_connected(|session| {
//!     session.set_handler(AppId::Echo, |mut payload: Payload, session| {
//!         let text = payload.pop_string().unwrap();
//!         let mut reply = Payload::new();
//!         reply.push_str(&text);
//!         reply.push_id(AppId::Echo);
//!         session.send(reply);
//!     }, true);
//! });
//! acceptor.start_accept();
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod codec;
pub mod connector;
pub mod error;
pub mod frame;
pub mod keepalive;
pub mod message;
pub mod session;

pub use acceptor::Acceptor;
pub use codec::{CodecError, Payload};
pub use connector::Connector;
pub use error::{AcceptError, ConnectError, SessionError};
pub use frame::FrameError;
pub use message::MessageId;
pub use session::{Session, SessionConfig, SessionId};
