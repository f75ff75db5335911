// ABOUTME: Example client demonstrating the Connector and a one-shot round trip
// ABOUTME: Sends a single `message_request` and waits for the matching `message_response`

//! # Echo Client
//!
//! ```bash
//! cargo run --example echo_client -- --host 127.0.0.1 --port 7878 --message hello
//! ```

use argh::FromArgs;
use num_enum::TryFromPrimitive;
use sessionwire::codec::Payload;
use sessionwire::connector::Connector;
use sessionwire::message::MessageId;
use sessionwire::session::SessionConfig;
use std::error::Error;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Echo client connecting to a sessionwire echo server.
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// the server hostname or IP address (default: 127.0.0.1)
    #[argh(option)]
    host: Option<String>,

    /// the port to connect to (default: 7878)
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// the message to send (default: hello)
    #[argh(option, short = 'm')]
    message: Option<String>,
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

    let host = cli_args.host.unwrap_or_else(|| "127.0.0.1".to_owned());
    let port = cli_args.port.unwrap_or(7878);
    let message = cli_args.message.unwrap_or_else(|| "hello".to_owned());

    let connector = Connector::<EchoId>::new(format!("{host}:{port}"), SessionConfig::default());

    info!(%host, %port, "connecting");
    let session = connector.connect().await.map_err(|err| {
        warn!(error = %err, "connect failed");
        Box::<dyn Error>::from(err.to_string())
    })?;

    let (tx, rx) = oneshot::channel();
    let tx = std::sync::Mutex::new(Some(tx));
    session.set_handler(
        EchoId::MessageResponse,
        move |mut payload: Payload, _session| {
            if let Ok(text) = payload.pop_string() {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(text);
                }
            }
        },
        true,
    );

    let mut request = Payload::new();
    request.push_str(&message);
    request.push_id(EchoId::MessageRequest);
    session.send(request);

    match tokio::time::timeout(Duration::from_secs(5), rx).await {
        Ok(Ok(reply)) => info!(%reply, "received echo"),
        Ok(Err(_)) => warn!("response channel closed before a reply arrived"),
        Err(_) => warn!("timed out waiting for echo response"),
    }

    session.stop();
    Ok(())
}
