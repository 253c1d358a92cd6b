//! Keeps at most one service instance per service name in this process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use meshrpc_catalog::ServiceRegistry;
use meshrpc_common::Result;

use crate::service::{self, ServiceConfig, ServiceHandle};
use crate::worker::RequestHandler;

/// Owner of the service instances published by this process.
///
/// An explicit object rather than process-global state, so tests and
/// embedders can run isolated meshes side by side.
pub struct ServerRegistry {
    catalog: Arc<dyn ServiceRegistry>,
    config: ServiceConfig,
    services: Mutex<HashMap<String, ServiceHandle>>,
}

impl ServerRegistry {
    pub fn new(catalog: Arc<dyn ServiceRegistry>, config: ServiceConfig) -> Self {
        Self {
            catalog,
            config,
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures an instance of `name` is running and returns its public
    /// address. A second start for the same name keeps the first handler.
    pub async fn start(
        &self,
        name: &str,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<SocketAddr> {
        let mut services = self.services.lock().await;
        if let Some(handle) = services.get(name) {
            debug!("Service {} already published", name);
            return Ok(handle.frontend_addr());
        }

        let handle =
            service::start(name, handler, self.catalog.clone(), self.config.clone()).await?;
        let addr = handle.frontend_addr();
        services.insert(name.to_string(), handle);
        Ok(addr)
    }

    /// Stops and deregisters the instance of `name`, if any. Idempotent.
    pub async fn stop(&self, name: &str) {
        let handle = self.services.lock().await.remove(name);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Stops every instance owned by this registry.
    pub async fn stop_all(&self) {
        let handles: Vec<ServiceHandle> = {
            let mut services = self.services.lock().await;
            services.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.stop().await;
        }
    }
}
