//! Worker runtime: pulls requests from a server's backend and runs the
//! node's request handler.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use meshrpc_common::protocol::{error_reply, split_payload, WORKER_READY};
use meshrpc_common::transport::PeerSocket;
use meshrpc_common::{Frames, Result};

/// Application logic of a service node.
///
/// One handler instance is shared by all workers of a node, so it must
/// synchronize its own state. The request payload is opaque to the mesh;
/// the returned bytes travel back to the caller unchanged.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Bytes) -> Result<Bytes>;
}

/// Adapts a plain synchronous function into a [`RequestHandler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
{
    async fn handle(&self, request: Bytes) -> Result<Bytes> {
        Ok((self.0)(request))
    }
}

/// One worker: a dedicated backend connection plus the shared handler.
pub struct Worker;

impl Worker {
    /// Connects to the server backend, announces readiness and serves
    /// requests until shutdown.
    pub async fn spawn(
        endpoint: &str,
        identity: impl Into<Bytes>,
        handler: Arc<dyn RequestHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        let mut socket = PeerSocket::connect(endpoint, identity).await?;
        socket
            .send(vec![Bytes::new(), Bytes::from_static(WORKER_READY)])
            .await?;

        Ok(tokio::spawn(run(socket, handler, shutdown)))
    }
}

async fn run(
    mut socket: PeerSocket,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frames = socket.recv() => match frames {
                Some(frames) => {
                    if let Some(reply) = process(&handler, frames).await {
                        if socket.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                None => break,
            }
        }
    }
    debug!("Worker {} exiting", String::from_utf8_lossy(socket.identity()));
}

/// Runs the handler on the final frame and rebuilds the message with the
/// response in its place, envelope untouched. A handler error becomes the
/// reply payload, so the caller always hears back.
async fn process(handler: &Arc<dyn RequestHandler>, frames: Frames) -> Option<Frames> {
    let (envelope, payload) = match split_payload(&frames) {
        Some(split) => split,
        None => {
            warn!("Dropping empty request");
            return None;
        }
    };

    match handler.handle(payload.clone()).await {
        Ok(response) => {
            let mut reply = envelope.to_vec();
            reply.push(response);
            Some(reply)
        }
        Err(e) => {
            warn!("Handler failed: {}", e);
            Some(error_reply(&frames, &e.to_string()))
        }
    }
}
