//! Request dispatch between brokers and this node's workers.
//!
//! The server owns two router sockets. The **frontend** is the public
//! endpoint brokers dial; the **backend** is a loopback endpoint the
//! node's own workers dial. Requests are handed to idle workers in the
//! order the workers announced readiness; heartbeat probes are answered
//! directly by the dispatch loop, so liveness never depends on workers
//! being free.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use meshrpc_common::protocol::{
    error_reply, is_token, ERR_NO_WORKERS, HEARTBEAT_PROBE, HEARTBEAT_REPLY, WORKER_READY,
};
use meshrpc_common::transport::RouterSocket;
use meshrpc_common::{Frames, MeshError, Result};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Public endpoint brokers dial. Port 0 picks a free port.
    pub frontend_endpoint: String,
    /// Loopback endpoint workers dial.
    pub backend_endpoint: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            frontend_endpoint: "0.0.0.0:0".to_string(),
            backend_endpoint: "127.0.0.1:0".to_string(),
        }
    }
}

/// FIFO of idle worker identities.
///
/// Workers are dispatched in the order they announced readiness. Pushing
/// an identity that is already queued is a no-op, so a duplicate
/// readiness announcement cannot make a worker receive two requests at
/// once.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    workers: VecDeque<Bytes>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, worker: Bytes) {
        if !self.workers.contains(&worker) {
            self.workers.push_back(worker);
        }
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.workers.pop_front()
    }

    /// Forgets a worker, queued or not.
    pub fn remove(&mut self, worker: &Bytes) {
        self.workers.retain(|w| w != worker);
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Running dispatch loop for one service node.
pub struct ServerHandle {
    service: String,
    frontend_addr: SocketAddr,
    backend_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Public address brokers dial.
    pub fn frontend_addr(&self) -> SocketAddr {
        self.frontend_addr
    }

    /// Loopback address workers dial.
    pub fn backend_addr(&self) -> SocketAddr {
        self.backend_addr
    }

    /// Shutdown signal shared with this node's workers.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
        info!("Server for {} stopped", self.service);
    }
}

pub struct Server {
    service: String,
    frontend: RouterSocket,
    backend: RouterSocket,
    ready: ReadyQueue,
    shutdown: watch::Receiver<bool>,
}

impl Server {
    /// Binds both sockets and spawns the dispatch loop.
    pub async fn start(service: impl Into<String>, config: ServerConfig) -> Result<ServerHandle> {
        let service = service.into();
        let identity = format!("server-{}-{}", service, Uuid::new_v4());

        let mut frontend = RouterSocket::new(identity.clone());
        let frontend_addr = frontend.bind(&config.frontend_endpoint).await?;
        let mut backend = RouterSocket::new(identity);
        let backend_addr = backend.bind(&config.backend_endpoint).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Server {
            service: service.clone(),
            frontend,
            backend,
            ready: ReadyQueue::new(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(server.serve());

        info!(
            "Server for {} listening on {} (workers on {})",
            service, frontend_addr, backend_addr
        );
        Ok(ServerHandle {
            service,
            frontend_addr,
            backend_addr,
            shutdown: shutdown_tx,
            task,
        })
    }

    async fn serve(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => break,
                Some(frames) = self.backend.recv() => {
                    if let Err(e) = self.handle_worker(frames).await {
                        warn!("Failed to handle worker message: {}", e);
                    }
                }
                Some(frames) = self.frontend.recv() => {
                    if let Err(e) = self.handle_broker(frames).await {
                        warn!("Failed to handle broker message: {}", e);
                    }
                }
                else => break,
            }
        }
        self.frontend.close();
        self.backend.close();
    }

    /// A message from a broker: either a heartbeat probe, answered
    /// inline, or a request dispatched to the next idle worker.
    async fn handle_broker(&mut self, frames: Frames) -> Result<()> {
        let is_probe = match frames.last() {
            Some(request) => is_token(request, HEARTBEAT_PROBE),
            None => {
                return Err(MeshError::Protocol("empty message from broker".to_string()));
            }
        };

        if is_probe {
            // Answered inline, so liveness never depends on an idle
            // worker. The probe envelope is replayed with the reply
            // token in place of the payload.
            let mut reply = frames;
            reply.pop();
            reply.push(Bytes::from_static(HEARTBEAT_REPLY));
            return self.frontend.send(reply).await;
        }

        let worker = match self.ready.pop() {
            Some(worker) => worker,
            None => {
                warn!("No workers available for {}", self.service);
                return self.frontend.send(error_reply(&frames, ERR_NO_WORKERS)).await;
            }
        };

        // [worker, delimiter, broker, caller envelope..., payload]
        let mut routed = Vec::with_capacity(frames.len() + 2);
        routed.push(worker);
        routed.push(Bytes::new());
        routed.extend(frames);
        self.backend.send(routed).await
    }

    /// A message from a worker: a readiness announcement, or a response
    /// to route back through the frontend. Either way the worker is idle
    /// again.
    ///
    /// A worker message without the leading delimiter frame violates the
    /// protocol. The message is dropped and the worker is removed from
    /// the queue instead of re-queued: a worker that breaks framing is
    /// not trusted with further dispatches until it announces readiness
    /// again with a well-formed message.
    async fn handle_worker(&mut self, frames: Frames) -> Result<()> {
        let (worker, rest) = frames
            .split_first()
            .ok_or_else(|| MeshError::Protocol("empty message from worker".to_string()))?;

        match rest.split_first() {
            Some((delimiter, _)) if !delimiter.is_empty() => {
                self.ready.remove(worker);
                return Err(MeshError::Protocol(format!(
                    "worker {} sent message without delimiter",
                    String::from_utf8_lossy(worker)
                )));
            }
            None => {
                self.ready.remove(worker);
                return Err(MeshError::Protocol(format!(
                    "worker {} sent bare identity",
                    String::from_utf8_lossy(worker)
                )));
            }
            Some((_, body)) => {
                if body.last().map_or(false, |f| is_token(f, WORKER_READY)) {
                    debug!("Worker {} ready", String::from_utf8_lossy(worker));
                    self.ready.push(worker.clone());
                    return Ok(());
                }

                // A response frees the worker for the next request.
                self.ready.push(worker.clone());
                self.frontend.send(body.to_vec()).await
            }
        }
    }
}
