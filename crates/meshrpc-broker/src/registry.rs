//! Keeps at most one broker per service name.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use meshrpc_catalog::NodeSource;
use meshrpc_common::Result;

use crate::broker::{Broker, BrokerConfig, BrokerHandle};

/// Owner of the brokers running in this process.
///
/// Callers that share a registry share brokers: starting a service twice
/// returns the existing broker's address instead of spawning a second
/// one. The registry is an explicit object, so independent meshes can
/// coexist in one process (tests rely on this).
pub struct BrokerRegistry {
    source: Arc<dyn NodeSource>,
    config: BrokerConfig,
    brokers: Mutex<HashMap<String, BrokerHandle>>,
}

impl BrokerRegistry {
    pub fn new(source: Arc<dyn NodeSource>, config: BrokerConfig) -> Self {
        Self {
            source,
            config,
            brokers: Mutex::new(HashMap::new()),
        }
    }

    /// Ensures a broker is running for `service` and returns the address
    /// callers should connect to. Idempotent.
    pub async fn start(&self, service: &str) -> Result<SocketAddr> {
        let mut brokers = self.brokers.lock().await;
        if let Some(handle) = brokers.get(service) {
            debug!("Broker for {} already running", service);
            return Ok(handle.local_addr());
        }

        let handle = Broker::start(service, self.source.clone(), self.config.clone()).await?;
        let addr = handle.local_addr();
        brokers.insert(service.to_string(), handle);
        Ok(addr)
    }

    /// Address of the broker for `service`, if one is running.
    pub async fn local_addr(&self, service: &str) -> Option<SocketAddr> {
        self.brokers.lock().await.get(service).map(|h| h.local_addr())
    }

    /// Stops the broker for `service`, if any. Idempotent.
    pub async fn stop(&self, service: &str) {
        let handle = self.brokers.lock().await.remove(service);
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    /// Stops every broker owned by this registry.
    pub async fn stop_all(&self) {
        let handles: Vec<BrokerHandle> = {
            let mut brokers = self.brokers.lock().await;
            brokers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.stop().await;
        }
    }
}
