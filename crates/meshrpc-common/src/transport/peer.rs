use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::warn;

use super::codec::{read_frames, write_frames};
use super::tcp_addr;
use crate::protocol::error::{MeshError, Result};
use crate::protocol::Frames;

const CHANNEL_CAPACITY: usize = 64;

/// Dealer-style connecting socket with a stable identity.
///
/// Used by clients (towards a broker's local endpoint) and workers
/// (towards a server's internal endpoint). Frames pass through verbatim in
/// both directions; the identity is only used for the connection handshake
/// so the remote [`RouterSocket`](super::RouterSocket) can key the
/// connection.
pub struct PeerSocket {
    identity: Bytes,
    outgoing: mpsc::Sender<Frames>,
    incoming: mpsc::Receiver<Frames>,
}

impl PeerSocket {
    /// Dials `endpoint` and performs the identity handshake.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - Remote router endpoint (e.g., "127.0.0.1:5555")
    /// * `identity` - Stable identity announced to the remote router
    pub async fn connect(endpoint: &str, identity: impl Into<Bytes>) -> Result<Self> {
        let identity = identity.into();
        let stream = TcpStream::connect(tcp_addr(endpoint))
            .await
            .map_err(|e| {
                MeshError::Connection(format!("failed to connect to {}: {}", endpoint, e))
            })?;

        let (mut read_half, mut write_half) = stream.into_split();

        let (outgoing, mut outgoing_rx) = mpsc::channel::<Frames>(CHANNEL_CAPACITY);
        let (incoming_tx, incoming) = mpsc::channel(CHANNEL_CAPACITY);

        let handshake = identity.clone();
        tokio::spawn(async move {
            if let Err(e) = write_frames(&mut write_half, &[handshake]).await {
                warn!("identity handshake failed: {}", e);
                return;
            }
            while let Some(frames) = outgoing_rx.recv().await {
                if let Err(e) = write_frames(&mut write_half, &frames).await {
                    warn!("socket write error: {}", e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            loop {
                match read_frames(&mut read_half).await {
                    Ok(Some(frames)) => {
                        if incoming_tx.send(frames).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("socket read error: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            identity,
            outgoing,
            incoming,
        })
    }

    /// Sends a multipart message as-is.
    pub async fn send(&self, frames: Frames) -> Result<()> {
        self.outgoing
            .send(frames)
            .await
            .map_err(|_| MeshError::Connection("socket closed".to_string()))
    }

    /// Receives the next multipart message.
    ///
    /// Returns `None` once the connection is closed. Cancellation-safe.
    pub async fn recv(&mut self) -> Option<Frames> {
        self.incoming.recv().await
    }

    /// This socket's identity.
    pub fn identity(&self) -> &Bytes {
        &self.identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RouterSocket;

    #[tokio::test]
    async fn test_peer_to_router_round_trip() {
        let mut router = RouterSocket::new("router");
        let addr = router.bind("127.0.0.1:0").await.unwrap();

        let mut peer = PeerSocket::connect(&addr.to_string(), "peer-1").await.unwrap();
        peer.send(vec![Bytes::new(), Bytes::from_static(b"ask")])
            .await
            .unwrap();

        let msg = router.recv().await.unwrap();
        assert_eq!(msg[0].as_ref(), b"peer-1");
        assert!(msg[1].is_empty());
        assert_eq!(msg[2].as_ref(), b"ask");

        router
            .send(vec![msg[0].clone(), Bytes::new(), Bytes::from_static(b"answer")])
            .await
            .unwrap();

        let reply = peer.recv().await.unwrap();
        assert!(reply[0].is_empty());
        assert_eq!(reply[1].as_ref(), b"answer");
    }

    #[tokio::test]
    async fn test_recv_returns_none_on_close() {
        let mut router = RouterSocket::new("router");
        let addr = router.bind("127.0.0.1:0").await.unwrap();

        let mut peer = PeerSocket::connect(&addr.to_string(), "peer-1").await.unwrap();
        router.close();

        assert!(peer.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is essentially never listening on loopback.
        let result = PeerSocket::connect("127.0.0.1:1", "peer-1").await;
        assert!(result.is_err());
    }
}
