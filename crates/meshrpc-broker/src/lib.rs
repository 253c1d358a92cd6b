//! Per-service routing brokers backed by dynamic node discovery.
//!
//! Each service name gets a broker: a caller-facing socket on this host,
//! a rotation of dialed service nodes kept fresh by a catalog watcher,
//! and a heartbeat loop that keeps dead nodes out of the rotation. The
//! [`BrokerRegistry`] owns the set of brokers running in a process.

pub mod broker;
pub mod discovery;
pub mod registry;

pub use broker::{Broker, BrokerConfig, BrokerHandle};
pub use discovery::{DiscoveryConfig, NodeMessage};
pub use registry::BrokerRegistry;
