//! Core protocol types: multipart frames, reserved tokens and envelope
//! helpers.
//!
//! Payload frames are opaque bytes; the only reserved words are the three
//! tokens below, which must never collide with application payload content
//! (a known limitation inherited from the wire protocol — no escaping is
//! defined).

pub mod error;

use bytes::Bytes;

/// A multipart message: an ordered sequence of opaque frames.
pub type Frames = Vec<Bytes>;

/// Liveness probe payload sent by a broker to a discovered node.
pub const HEARTBEAT_PROBE: &[u8] = b"PING";

/// Liveness reply payload sent back by a node.
pub const HEARTBEAT_REPLY: &[u8] = b"PONG";

/// Readiness announcement sent by a worker to its server.
pub const WORKER_READY: &[u8] = b"READY";

/// Error text surfaced to a caller when the rotation is empty.
pub const ERR_NO_NODES: &str = "no nodes available";

/// Error text surfaced to a caller when the ready-queue is empty.
pub const ERR_NO_WORKERS: &str = "no workers available";

/// Returns true if `frame` is exactly the given reserved token.
pub fn is_token(frame: &Bytes, token: &[u8]) -> bool {
    frame.as_ref() == token
}

/// Splits a message into its envelope (all frames but the last) and its
/// payload (the final frame). Returns `None` for an empty message.
pub fn split_payload(frames: &[Bytes]) -> Option<(&[Bytes], &Bytes)> {
    let (last, envelope) = frames.split_last()?;
    Some((envelope, last))
}

/// Builds an error reply by reusing the received envelope: the final frame
/// is replaced with the error text, everything else is replayed verbatim.
pub fn error_reply(frames: &[Bytes], error: &str) -> Frames {
    let mut reply = frames.to_vec();
    let error = Bytes::copy_from_slice(error.as_bytes());
    match reply.last_mut() {
        Some(last) => *last = error,
        None => reply.push(error),
    }
    reply
}
