// ABOUTME: Keepalive (C4) - the ping_request/ping_response loop that proves a session is alive
// ABOUTME: Runs as a detached task per started Session; timing is executor-aware (never a blocking sleep)

use crate::codec::Payload;
use crate::message::MessageId;
use crate::session::Session;
use std::sync::Weak;
use std::time::{Duration, Instant};
use tracing::debug;

/// Drive one session's keepalive loop until the session stops, a
/// `ping_request` fails to send, or a ping goes unanswered (§4.4).
///
/// Each iteration: arm a one-shot for the matching `ping_response`, send
/// `ping_request` and wait for the write itself to complete, then wait up
/// to `ping_timeout` for the response. A response arriving after the
/// timeout is dropped silently by [`Session::disarm_ping`]. At most one
/// ping is ever outstanding.
///
/// Holds only `Weak<Session<M>>`, upgrading to a strong `Arc` only for the
/// brief stretches of work between waits; the long waits here (the ack,
/// the timeout, the inter-ping sleep) run with no strong reference held, so
/// the owner dropping its last `Arc<Session>` between pings still lets the
/// Session drop instead of being kept alive by this task.
pub(crate) async fn run<M: MessageId>(session: Weak<Session<M>>) {
    loop {
        let Some(strong) = session.upgrade() else {
            return;
        };
        if !strong.connected() {
            return;
        }

        let pong = strong.arm_ping();

        let mut request = Payload::new();
        request.push_id(M::PING_REQUEST);
        let started = Instant::now();
        let ping_timeout = strong.config().ping_timeout;
        let ping_delay = strong.config().ping_delay;
        let ack_rx = strong.send_for_ack(request);
        drop(strong);

        match ack_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if let Some(strong) = session.upgrade() {
                    strong.on_ping_send_failed(err);
                }
                return;
            }
            Err(_) => {
                // Writer task is gone; the session is already tearing down.
                return;
            }
        }

        match tokio::time::timeout(ping_timeout, pong).await {
            Ok(Ok(())) => {
                debug!(rtt = ?started.elapsed(), "keepalive ping acknowledged");
            }
            Ok(Err(_)) => return,
            Err(_) => {
                if let Some(strong) = session.upgrade() {
                    strong.disarm_ping();
                    strong.on_ping_timeout_fired();
                }
                return;
            }
        }

        let remaining = ping_delay.saturating_sub(started.elapsed());
        if remaining > Duration::ZERO {
            tokio::time::sleep(remaining).await;
        }
    }
}

