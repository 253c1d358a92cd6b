//! Caller-side API.
//!
//! A [`Client`] talks to the local broker for one service: requests go
//! out with an empty delimiter frame in front of the payload, and the
//! broker routes the response back over the same connection. Calls are
//! strictly request/response; issue them one at a time per client.

use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use meshrpc_broker::BrokerRegistry;
use meshrpc_common::protocol::{ERR_NO_NODES, ERR_NO_WORKERS};
use meshrpc_common::transport::PeerSocket;
use meshrpc_common::{MeshError, Result};

/// Connection to the local broker for one service.
pub struct Client {
    service: String,
    socket: PeerSocket,
}

impl Client {
    /// Connects to the broker for `service`, starting one through the
    /// registry if none is running yet.
    pub async fn connect(registry: &BrokerRegistry, service: &str) -> Result<Self> {
        let addr = registry.start(service).await?;
        Self::connect_addr(&addr.to_string(), service).await
    }

    /// Connects to a broker already listening at `endpoint`.
    pub async fn connect_addr(endpoint: &str, service: &str) -> Result<Self> {
        let identity = format!("client-{}", Uuid::new_v4());
        let socket = PeerSocket::connect(endpoint, identity).await?;
        debug!("Client connected to {} broker at {}", service, endpoint);
        Ok(Self {
            service: service.to_string(),
            socket,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Sends `request` to some node of the service and waits for the
    /// response payload.
    ///
    /// An exhausted rotation or worker pool surfaces as
    /// [`MeshError::NoNodesAvailable`] / [`MeshError::NoWorkersAvailable`];
    /// both are safe to retry. Note the reserved error texts are carried
    /// in the payload frame, so a response that legitimately equals one
    /// of them is indistinguishable from the error.
    pub async fn call(&mut self, request: Bytes) -> Result<Bytes> {
        self.socket.send(vec![Bytes::new(), request]).await?;

        let reply = self
            .socket
            .recv()
            .await
            .ok_or(MeshError::ChannelClosed)?;

        let (delimiter, payload) = match reply.as_slice() {
            [delimiter, payload] => (delimiter, payload),
            _ => {
                return Err(MeshError::Protocol(format!(
                    "expected [delimiter, payload], got {} frames",
                    reply.len()
                )))
            }
        };
        if !delimiter.is_empty() {
            return Err(MeshError::Protocol(
                "response missing delimiter frame".to_string(),
            ));
        }

        if payload.as_ref() == ERR_NO_NODES.as_bytes() {
            return Err(MeshError::NoNodesAvailable);
        }
        if payload.as_ref() == ERR_NO_WORKERS.as_bytes() {
            return Err(MeshError::NoWorkersAvailable);
        }
        Ok(payload.clone())
    }
}
