// ABOUTME: Example server demonstrating the Acceptor and a registered message handler
// ABOUTME: Echoes every `message_request` back as a `message_response` with the same text

//! # Echo Server
//!
//! ```bash
//! cargo run --example echo_server -- --port 7878
//! ```

use argh::FromArgs;
use num_enum::TryFromPrimitive;
use sessionwire::acceptor::Acceptor;
use sessionwire::codec::Payload;
use sessionwire::message::MessageId;
use sessionwire::session::SessionConfig;
use std::error::Error;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Echo server accepting sessionwire connections on a local port.
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the port to listen on (default: 7878)
    #[argh(option, short = 'p')]
    port: Option<u16>,
}

#[derive(TryFromPrimitive, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
enum EchoId {
    PingRequest = 0,
    PingResponse = 1,
    MessageRequest = 2,
    MessageResponse = 3,
}

impl From<EchoId> for u32 {
    fn from(id: EchoId) -> Self {
        id as u32
    }
}

impl MessageId for EchoId {
    const PING_REQUEST: Self = EchoId::PingRequest;
    const PING_RESPONSE: Self = EchoId::PingResponse;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli_args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli_args.debugging { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let port = cli_args.port.unwrap_or(7878);
    let addr = format!("0.0.0.0:{port}");

    let acceptor = Acceptor::<EchoId>::bind(&addr, SessionConfig::default()).await?;
    info!(%addr, "echo server listening");

    acceptor.on_client_connected(|session| {
        info!(peer = %session.peer_addr(), "client connected");

        session.set_handler(
            EchoId::MessageRequest,
            |mut payload: Payload, session| {
                let text = match payload.pop_string() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "failed to decode message_request");
                        return;
                    }
                };
                info!(%text, "echoing message");
                let mut response = Payload::new();
                response.push_str(&text);
                response.push_id(EchoId::MessageResponse);
                session.send(response);
            },
            true,
        );

        session.on_failed_read(|cause| {
            warn!(error = %cause, "session read failed");
        });
    });

    acceptor.start_accept();

    // Keep the process alive; the accept loop and per-session tasks run on
    // detached tokio tasks for the lifetime of this future.
    std::future::pending::<()>().await;
    Ok(())
}
