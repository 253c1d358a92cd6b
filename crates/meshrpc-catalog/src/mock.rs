//! Scripted node source for tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use meshrpc_common::{MeshError, Result};

use crate::{NodeSource, ServiceRegistry};

enum Step {
    Listing(Vec<String>),
    Error(String),
}

/// Mock node source: replays scripted listings, recording queried service
/// names.
///
/// Once the script is exhausted the query blocks forever, emulating an
/// idle long-poll against a catalog whose node set no longer changes.
pub struct MockNodeSource {
    script: Mutex<VecDeque<Step>>,
    queried: Mutex<Vec<String>>,
}

impl MockNodeSource {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            queried: Mutex::new(Vec::new()),
        }
    }

    /// Convenience constructor for a single static listing.
    pub fn with_listing<I, S>(uris: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let source = Self::new();
        source.push_listing(uris);
        source
    }

    /// Queues a listing to be returned by the next query.
    pub fn push_listing<I, S>(&self, uris: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(Step::Listing(uris.into_iter().map(Into::into).collect()));
    }

    /// Queues a query failure.
    pub fn push_error(&self, message: impl Into<String>) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(Step::Error(message.into()));
    }

    /// Service names queried so far.
    pub fn queried(&self) -> Vec<String> {
        self.queried.lock().expect("queried lock poisoned").clone()
    }
}

impl Default for MockNodeSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeSource for MockNodeSource {
    async fn list_service_nodes(&self, service: &str) -> Result<Vec<String>> {
        self.queried
            .lock()
            .expect("queried lock poisoned")
            .push(service.to_string());

        let step = self.script.lock().expect("script lock poisoned").pop_front();
        match step {
            Some(Step::Listing(uris)) => Ok(uris),
            Some(Step::Error(message)) => Err(MeshError::Catalog(message)),
            None => {
                // Script exhausted: hold the long-poll open forever.
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// One recorded service registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredService {
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u16,
}

/// Mock registry: records registrations and deregistrations in memory.
#[derive(Default)]
pub struct MockRegistry {
    registered: Mutex<Vec<RegisteredService>>,
    deregistered: Mutex<Vec<String>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registered(&self) -> Vec<RegisteredService> {
        self.registered
            .lock()
            .expect("registered lock poisoned")
            .clone()
    }

    pub fn deregistered(&self) -> Vec<String> {
        self.deregistered
            .lock()
            .expect("deregistered lock poisoned")
            .clone()
    }
}

#[async_trait]
impl ServiceRegistry for MockRegistry {
    async fn register(&self, id: &str, service: &str, address: &str, port: u16) -> Result<()> {
        self.registered
            .lock()
            .expect("registered lock poisoned")
            .push(RegisteredService {
                id: id.to_string(),
                service: service.to_string(),
                address: address.to_string(),
                port,
            });
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.deregistered
            .lock()
            .expect("deregistered lock poisoned")
            .push(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replays_listings_in_order() {
        let source = MockNodeSource::new();
        source.push_listing(["a", "b"]);
        source.push_listing(["a"]);

        assert_eq!(
            source.list_service_nodes("svc").await.unwrap(),
            vec!["a", "b"]
        );
        assert_eq!(source.list_service_nodes("svc").await.unwrap(), vec!["a"]);
        assert_eq!(source.queried(), vec!["svc", "svc"]);
    }

    #[tokio::test]
    async fn test_scripted_error() {
        let source = MockNodeSource::new();
        source.push_error("timed out");

        let err = source.list_service_nodes("svc").await.unwrap_err();
        assert!(matches!(err, MeshError::Catalog(_)));
    }

    #[tokio::test]
    async fn test_exhausted_script_blocks() {
        let source = MockNodeSource::with_listing(["a"]);
        source.list_service_nodes("svc").await.unwrap();

        let timeout = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            source.list_service_nodes("svc"),
        )
        .await;
        assert!(timeout.is_err());
    }
}
