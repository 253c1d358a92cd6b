//! One published service instance: a server, its worker pool and the
//! catalog registration that makes brokers find it.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use meshrpc_catalog::ServiceRegistry;
use meshrpc_common::Result;

use crate::server::{Server, ServerConfig, ServerHandle};
use crate::worker::{RequestHandler, Worker};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    /// Address other hosts use to reach this node, registered in the
    /// catalog together with the frontend port.
    pub advertised_address: String,
    /// Size of the worker pool, fixed for the lifetime of the node.
    pub workers: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            advertised_address: "127.0.0.1".to_string(),
            workers: 4,
        }
    }
}

/// Running service node, registered in the catalog until
/// [`stop`](Self::stop).
pub struct ServiceHandle {
    id: String,
    name: String,
    frontend_addr: SocketAddr,
    catalog: Arc<dyn ServiceRegistry>,
    server: ServerHandle,
    workers: Vec<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Catalog registration id, unique per instance.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frontend_addr(&self) -> SocketAddr {
        self.frontend_addr
    }

    /// Deregisters from the catalog, then stops workers and server.
    ///
    /// Deregistration comes first so brokers stop routing fresh requests
    /// here while in-flight ones drain.
    pub async fn stop(self) {
        if let Err(e) = self.catalog.deregister(&self.id).await {
            warn!("Failed to deregister {}: {}", self.id, e);
        }
        self.server.stop().await;
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("Service instance {} stopped", self.id);
    }
}

/// Starts a service node: binds the server, connects `workers` workers
/// sharing `handler`, and registers the instance in the catalog.
pub async fn start(
    name: impl Into<String>,
    handler: Arc<dyn RequestHandler>,
    catalog: Arc<dyn ServiceRegistry>,
    config: ServiceConfig,
) -> Result<ServiceHandle> {
    let name = name.into();
    let server = Server::start(name.clone(), config.server).await?;
    let backend = server.backend_addr().to_string();

    let mut workers = Vec::with_capacity(config.workers);
    for n in 0..config.workers {
        let identity = format!("worker-{}-{}", name, n);
        let task = Worker::spawn(
            &backend,
            identity,
            handler.clone(),
            server.subscribe_shutdown(),
        )
        .await?;
        workers.push(task);
    }

    let id = format!("{}-{}", name, Uuid::new_v4());
    let frontend_addr = server.frontend_addr();
    catalog
        .register(&id, &name, &config.advertised_address, frontend_addr.port())
        .await?;

    info!("Service instance {} registered at {}", id, frontend_addr);
    Ok(ServiceHandle {
        id,
        name,
        frontend_addr,
        catalog,
        server,
        workers,
    })
}
