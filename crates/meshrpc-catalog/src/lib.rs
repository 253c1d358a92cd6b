//! Meshrpc Catalog Boundary
//!
//! The catalog is the external source of truth for which nodes currently
//! serve a named service. This crate defines the two trait seams the rest
//! of the system depends on and ships a Consul-compatible HTTP client plus
//! a scriptable mock for tests.
//!
//! - [`NodeSource`] — the blocking long-poll listing query used by
//!   discovery
//! - [`ServiceRegistry`] — registration/deregistration used by serving
//!   processes
//! - [`consul::ConsulCatalog`] — implements both against a Consul agent
//! - [`mock::MockNodeSource`], [`mock::MockRegistry`] — scripted catalog
//!   behavior for tests

pub mod consul;
pub mod mock;

use async_trait::async_trait;
use meshrpc_common::Result;

/// Source of service node listings.
///
/// `list_service_nodes` is a long-poll query: implementations block until
/// the node set changes or a bounded server-side wait elapses, then return
/// the full ordered listing. Callers run it in a loop.
#[async_trait]
pub trait NodeSource: Send + Sync + 'static {
    async fn list_service_nodes(&self, service: &str) -> Result<Vec<String>>;
}

/// Registration of a serving process with the catalog.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    /// Registers an instance of `service` reachable at `address:port`.
    async fn register(&self, id: &str, service: &str, address: &str, port: u16) -> Result<()>;

    /// Removes a previously registered instance. Idempotent.
    async fn deregister(&self, id: &str) -> Result<()>;
}
