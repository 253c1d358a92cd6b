//! Consul-compatible catalog client.
//!
//! Listings use the catalog blocking-query protocol: each request carries
//! the index returned by the previous response (`X-Consul-Index`), and the
//! agent holds the request open until the service's node set changes or
//! the wait window elapses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::{Deserialize, Serialize};
use tracing::info;

use meshrpc_common::{MeshError, Result};

use crate::{NodeSource, ServiceRegistry};

/// Catalog client configuration.
#[derive(Debug, Clone)]
pub struct ConsulConfig {
    /// Base URL of the agent HTTP API.
    pub base_url: String,
    /// Maximum server-side hold time for a blocking listing query.
    pub wait: Duration,
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8500".to_string(),
            wait: Duration::from_secs(300),
        }
    }
}

/// One entry of a catalog service listing.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogNode {
    #[serde(rename = "ServiceID")]
    pub service_id: String,
    #[serde(rename = "Address", default)]
    pub node_address: String,
    #[serde(rename = "ServiceAddress", default)]
    pub service_address: String,
    #[serde(rename = "ServicePort", default)]
    pub service_port: u16,
}

#[derive(Debug, Serialize)]
struct Registration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: &'a [String],
}

/// Consul-compatible catalog client.
///
/// Implements [`NodeSource`] via the catalog blocking query and
/// [`ServiceRegistry`] via the agent service endpoints.
pub struct ConsulCatalog {
    config: ConsulConfig,
    client: Client<HttpConnector, Full<Bytes>>,
    last_index: AtomicU64,
}

impl ConsulCatalog {
    pub fn new(config: ConsulConfig) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            config,
            client,
            last_index: AtomicU64::new(0),
        }
    }

    async fn request(&self, method: Method, path_and_query: &str, body: Bytes) -> Result<(hyper::http::HeaderMap, Bytes)> {
        let url = format!("{}{}", self.config.base_url, path_and_query);
        let request = Request::builder()
            .method(method)
            .uri(&url)
            .header("Content-Type", "application/json")
            .body(Full::new(body))
            .map_err(|e| MeshError::Catalog(format!("failed to build request: {}", e)))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| MeshError::Catalog(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| MeshError::Catalog(format!("failed to read response: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(MeshError::Catalog(format!(
                "{} returned {}: {}",
                url,
                status,
                String::from_utf8_lossy(&body)
            )));
        }

        Ok((headers, body))
    }
}

/// Turns a catalog listing into dialable node URIs, in listing order.
///
/// The service address takes precedence; agents that register without one
/// fall back to the node address.
pub fn listing_uris(nodes: &[CatalogNode]) -> Vec<String> {
    nodes
        .iter()
        .map(|node| {
            let address = if node.service_address.is_empty() {
                &node.node_address
            } else {
                &node.service_address
            };
            format!("{}:{}", address, node.service_port)
        })
        .collect()
}

#[async_trait]
impl NodeSource for ConsulCatalog {
    async fn list_service_nodes(&self, service: &str) -> Result<Vec<String>> {
        let mut path = format!(
            "/v1/catalog/service/{}?wait={}s",
            service,
            self.config.wait.as_secs()
        );
        let index = self.last_index.load(Ordering::Acquire);
        if index > 0 {
            path.push_str(&format!("&index={}", index));
        }

        let (headers, body) = self.request(Method::GET, &path, Bytes::new()).await?;

        if let Some(new_index) = headers
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.last_index.store(new_index, Ordering::Release);
        }

        let nodes: Vec<CatalogNode> = serde_json::from_slice(&body)?;
        Ok(listing_uris(&nodes))
    }
}

#[async_trait]
impl ServiceRegistry for ConsulCatalog {
    async fn register(&self, id: &str, service: &str, address: &str, port: u16) -> Result<()> {
        info!("Registering service {} with id {}", service, id);

        let registration = Registration {
            id,
            name: service,
            address,
            port,
            tags: &[],
        };
        let body = Bytes::from(serde_json::to_vec(&registration)?);
        self.request(Method::PUT, "/v1/agent/service/register", body)
            .await?;
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        info!("Deregistering service id {}", id);

        let path = format!("/v1/agent/service/deregister/{}", id);
        self.request(Method::PUT, &path, Bytes::new()).await?;
        Ok(())
    }
}
