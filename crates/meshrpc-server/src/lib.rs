//! Service node runtime.
//!
//! A node publishes one service: a dispatch server with a public
//! frontend for brokers, a pool of workers running the application's
//! [`RequestHandler`], and a catalog registration announcing the
//! frontend to the rest of the mesh. The [`ServerRegistry`] owns the
//! instances published by a process.

pub mod registry;
pub mod server;
pub mod service;
pub mod worker;

pub use registry::ServerRegistry;
pub use server::{ReadyQueue, Server, ServerConfig, ServerHandle};
pub use service::{ServiceConfig, ServiceHandle};
pub use worker::{FnHandler, RequestHandler, Worker};
