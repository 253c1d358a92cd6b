//! Meshrpc Transport Layer
//!
//! Identity-routed, multipart, asynchronous sockets over TCP.
//!
//! # Components
//!
//! - **[`codec`]**: length-prefixed multipart wire format
//! - **[`RouterSocket`]**: binds and/or dials; routes by peer identity
//! - **[`PeerSocket`]**: dealer-style connecting socket with a stable
//!   identity
//!
//! # Routing model
//!
//! Each connection carries a one-frame identity handshake sent by the
//! dialing side. A router keys accepted connections by that identity and
//! outbound connections by the dialed endpoint string. On `send` the first
//! frame selects the destination peer and is stripped; on `recv` the
//! sender's identity is prepended. This mirrors the classic router-socket
//! pattern: envelopes built from identity frames survive a round trip
//! byte-for-byte.

pub mod codec;
pub mod peer;
pub mod router;

pub use peer::PeerSocket;
pub use router::RouterSocket;

/// Strips an optional `tcp://` scheme from an endpoint string.
pub(crate) fn tcp_addr(endpoint: &str) -> &str {
    endpoint.strip_prefix("tcp://").unwrap_or(endpoint)
}
