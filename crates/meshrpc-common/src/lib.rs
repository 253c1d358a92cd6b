//! Meshrpc Common Types and Transport
//!
//! This crate provides the protocol definitions and the socket transport
//! shared by every meshrpc component.
//!
//! # Overview
//!
//! Meshrpc is a lightweight service-mesh layer: clients call named remote
//! services through a local broker which discovers live instances and
//! round-robins requests across them; on the serving side a fixed worker
//! pool is fed through a FIFO ready-queue. This crate contains the pieces
//! all of that is built on:
//!
//! - **Protocol layer**: multipart frame helpers, reserved heartbeat and
//!   readiness tokens, error types
//! - **Transport layer**: identity-routed, multipart, async sockets over TCP
//!
//! # Wire format
//!
//! Every message is a sequence of opaque frames:
//!
//! ```text
//! [4-byte body length as u32 big-endian]
//! [4-byte frame length][frame bytes] ... repeated
//! ```
//!
//! The leading frames of a routed message form the *envelope* (identity
//! frames plus an empty delimiter); routers preserve and replay it
//! byte-for-byte on the return path.

pub mod protocol;
pub mod transport;

pub use protocol::error::{MeshError, Result};
pub use protocol::Frames;
