//! Per-service routing broker.
//!
//! A broker owns two router sockets. The **local** socket is bound and
//! accepts callers on this host; the **remote** socket dials the service
//! nodes its [`Discovery`](crate::discovery::Discovery) pair reports.
//! Requests arriving locally are forwarded to the next node in the
//! rotation; everything coming back from a node is routed to the caller
//! named by its envelope. The broker also drives the heartbeat exchange
//! that feeds liveness back into discovery.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use meshrpc_catalog::NodeSource;
use meshrpc_common::protocol::{error_reply, is_token, ERR_NO_NODES, HEARTBEAT_PROBE, HEARTBEAT_REPLY};
use meshrpc_common::transport::RouterSocket;
use meshrpc_common::{Frames, MeshError, Result};

use crate::discovery::{Discovery, DiscoveryConfig, NextNodeHandle, NodeMessage};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Endpoint the caller-facing socket binds to. Port 0 picks a free
    /// port, reported via [`BrokerHandle::local_addr`].
    pub local_endpoint: String,
    pub discovery: DiscoveryConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            local_endpoint: "127.0.0.1:0".to_string(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Running broker for one service.
pub struct BrokerHandle {
    service: String,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl BrokerHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Address callers should connect to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals shutdown and waits for the broker's tasks to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Broker for {} stopped", self.service);
    }
}

pub struct Broker {
    service: String,
    local: RouterSocket,
    remote: RouterSocket,
    commands: mpsc::Receiver<NodeMessage>,
    responses: mpsc::Sender<NodeMessage>,
    next_node: NextNodeHandle,
    shutdown: watch::Receiver<bool>,
}

impl Broker {
    /// Binds the caller-facing socket, starts discovery for `service`
    /// and spawns the serve loop.
    ///
    /// Binding is the only fatal step; once this returns, all further
    /// failures are per-message.
    pub async fn start(
        service: impl Into<String>,
        source: Arc<dyn NodeSource>,
        config: BrokerConfig,
    ) -> Result<BrokerHandle> {
        let service = service.into();
        let identity = format!("broker-{}-{}", service, Uuid::new_v4());

        let mut local = RouterSocket::new(identity.clone());
        let local_addr = local.bind(&config.local_endpoint).await?;
        let remote = RouterSocket::new(identity);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, mut tasks) =
            Discovery::spawn(service.clone(), source, config.discovery, shutdown_rx.clone());

        let broker = Broker {
            service: service.clone(),
            local,
            remote,
            commands: handle.commands,
            responses: handle.responses,
            next_node: handle.next_node,
            shutdown: shutdown_rx,
        };
        tasks.push(tokio::spawn(broker.serve()));

        info!("Broker for {} listening on {}", service, local_addr);
        Ok(BrokerHandle {
            service,
            local_addr,
            shutdown: shutdown_tx,
            tasks,
        })
    }

    async fn serve(mut self) {
        loop {
            // Topology changes take priority over traffic so a freshly
            // discovered node is connected before requests route to it.
            while let Ok(command) = self.commands.try_recv() {
                self.handle_node_command(command).await;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                Some(command) = self.commands.recv() => {
                    self.handle_node_command(command).await;
                }
                Some(frames) = self.remote.recv() => {
                    if let Err(e) = self.handle_remote(frames).await {
                        warn!("Failed to handle node message: {}", e);
                    }
                }
                Some(frames) = self.local.recv() => {
                    if let Err(e) = self.handle_local(frames).await {
                        warn!("Failed to handle caller message: {}", e);
                    }
                }
                else => break,
            }
        }
        self.local.close();
        self.remote.close();
    }

    async fn handle_node_command(&mut self, command: NodeMessage) {
        match command {
            NodeMessage::Connect(uri) => {
                match self.remote.connect(&uri).await {
                    // Probe right away so liveness is established before
                    // the next probe window.
                    Ok(()) => self.send_probe(&uri).await,
                    Err(e) => warn!("Failed to connect to node {}: {}", uri, e),
                }
            }
            NodeMessage::Disconnect(uri) => {
                self.remote.disconnect(&uri);
            }
            NodeMessage::Ping(uri) => self.send_probe(&uri).await,
            NodeMessage::Pong(uri) => {
                error!("Unexpected node command: Pong({})", uri);
            }
        }
    }

    async fn send_probe(&self, uri: &str) {
        let frames = vec![
            Bytes::copy_from_slice(uri.as_bytes()),
            Bytes::from_static(HEARTBEAT_PROBE),
        ];
        if let Err(e) = self.remote.send(frames).await {
            debug!("Failed to probe node {}: {}", uri, e);
        }
    }

    /// A message from a service node. Any traffic from a node proves it
    /// is alive, so every message reports a `Pong` to discovery; if the
    /// payload is a heartbeat reply it is consumed here, otherwise it is
    /// a response routed on to the caller its envelope names.
    async fn handle_remote(&mut self, frames: Frames) -> Result<()> {
        let (uri, payload) = frames
            .split_first()
            .ok_or_else(|| MeshError::Protocol("empty message from node".to_string()))?;

        let uri = String::from_utf8_lossy(uri).into_owned();
        // Liveness signals repeat every probe window; if discovery is
        // momentarily busy, dropping one is harmless.
        let _ = self.responses.try_send(NodeMessage::Pong(uri.clone()));

        match payload.last() {
            Some(last) if is_token(last, HEARTBEAT_REPLY) => {
                debug!("Heartbeat reply from {}", uri);
                Ok(())
            }
            Some(_) => {
                // [caller_id, frames...] routes straight back through the
                // local socket.
                self.local.send(payload.to_vec()).await
            }
            None => Err(MeshError::Protocol(format!("bare identity from {}", uri))),
        }
    }

    /// A request from a local caller: pick the next node and forward the
    /// whole message, envelope intact, so the response can find its way
    /// back.
    async fn handle_local(&mut self, frames: Frames) -> Result<()> {
        let uri = match self.next_node.request().await? {
            Some(uri) => uri,
            None => {
                warn!("No nodes available for {}", self.service);
                return self.local.send(error_reply(&frames, ERR_NO_NODES)).await;
            }
        };

        let mut routed = Vec::with_capacity(frames.len() + 1);
        routed.push(Bytes::copy_from_slice(uri.as_bytes()));
        routed.extend(frames);
        self.remote.send(routed).await
    }
}
