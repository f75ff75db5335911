// ABOUTME: Defines the MessageId contract every owner-supplied enumeration must satisfy
// ABOUTME: Reserves the ping_request/ping_response ids used by the keepalive protocol

use std::fmt::Debug;
use std::hash::Hash;

/// A message identifier distinguishes payload kinds on the wire.
///
/// Implementors are typically a `#[repr(u32)]` enum decorated with
/// `num_enum::TryFromPrimitive` (see the teacher's `CommandId`), paired with
/// `TryFrom<u32>` so [`crate::codec::Payload::pop_id`] can recover it from
/// the leading four bytes of a frame body.
///
/// Two ids are reserved for the keepalive protocol (§4.4) and MUST be
/// distinct from every id the owner defines for its own traffic.
pub trait MessageId:
    Copy + Clone + Debug + Eq + Hash + Send + Sync + TryFrom<u32> + Into<u32> + 'static
{
    /// Sent by the keepalive initiator; the responder echoes [`Self::PING_RESPONSE`].
    const PING_REQUEST: Self;

    /// Sent in reply to [`Self::PING_REQUEST`].
    const PING_RESPONSE: Self;
}
