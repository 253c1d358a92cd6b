use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use super::codec::{read_frames, write_frames};
use super::tcp_addr;
use crate::protocol::error::{MeshError, Result};
use crate::protocol::Frames;

/// Per-connection and inbound queue depth.
const CHANNEL_CAPACITY: usize = 64;

type PeerMap = Arc<Mutex<HashMap<Bytes, mpsc::Sender<Frames>>>>;

/// Identity-routed multipart socket.
///
/// A `RouterSocket` can bind a listener, dial out to remote endpoints, or
/// both. Every connection is keyed by an identity: accepted connections
/// are keyed by the identity frame the dialing side sends as a handshake,
/// outbound connections are keyed by the endpoint string that was dialed.
///
/// Routing contract:
///
/// - [`send`](Self::send) consumes the first frame as the destination
///   identity and forwards the remaining frames to that peer;
/// - [`recv`](Self::recv) yields `[sender_identity, frames...]`.
///
/// A message addressed to an unknown or disconnected peer is an error for
/// that message only; the socket stays usable.
pub struct RouterSocket {
    identity: Bytes,
    peers: PeerMap,
    incoming_tx: mpsc::Sender<(Bytes, Frames)>,
    incoming_rx: mpsc::Receiver<(Bytes, Frames)>,
    local_addr: Option<SocketAddr>,
    accept_task: Option<JoinHandle<()>>,
}

impl RouterSocket {
    /// Creates an unbound router socket with the given identity.
    ///
    /// The identity is sent as the handshake frame on every outbound
    /// connection, so remote routers can address replies back to this
    /// socket.
    pub fn new(identity: impl Into<Bytes>) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            identity: identity.into(),
            peers: Arc::new(Mutex::new(HashMap::new())),
            incoming_tx,
            incoming_rx,
            local_addr: None,
            accept_task: None,
        }
    }

    /// Binds a listener and starts accepting connections.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - The address to bind to (e.g., "127.0.0.1:0"); an
    ///   optional `tcp://` prefix is accepted
    ///
    /// # Returns
    ///
    /// The actual bound address.
    pub async fn bind(&mut self, endpoint: &str) -> Result<SocketAddr> {
        if self.accept_task.is_some() {
            return Err(MeshError::Transport("socket is already bound".to_string()));
        }

        let listener = TcpListener::bind(tcp_addr(endpoint))
            .await
            .map_err(|e| MeshError::Connection(format!("failed to bind to {}: {}", endpoint, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MeshError::Connection(format!("failed to get local addr: {}", e)))?;

        let peers = self.peers.clone();
        let incoming = self.incoming_tx.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let peers = peers.clone();
                        let incoming = incoming.clone();
                        tokio::spawn(handle_inbound(stream, peers, incoming));
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                    }
                }
            }
        }));

        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Dials a remote endpoint and registers it under the endpoint string.
    ///
    /// The connection handshake introduces this socket's identity to the
    /// remote router so it can route replies back.
    pub async fn connect(&mut self, endpoint: &str) -> Result<()> {
        let stream = TcpStream::connect(tcp_addr(endpoint))
            .await
            .map_err(|e| {
                MeshError::Connection(format!("failed to connect to {}: {}", endpoint, e))
            })?;

        let key = Bytes::copy_from_slice(endpoint.as_bytes());
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tx.send(vec![self.identity.clone()])
            .await
            .map_err(|_| MeshError::ChannelClosed)?;

        let weak = tx.downgrade();
        lock_peers(&self.peers).insert(key.clone(), tx);
        tokio::spawn(write_loop(write_half, rx));

        let peers = self.peers.clone();
        let incoming = self.incoming_tx.clone();
        tokio::spawn(async move {
            read_loop(key.clone(), read_half, incoming).await;
            remove_stale(&peers, &key, &weak);
        });

        Ok(())
    }

    /// Drops the connection to `endpoint`, if any. Idempotent.
    pub fn disconnect(&self, endpoint: &str) {
        lock_peers(&self.peers).remove(endpoint.as_bytes());
    }

    /// Routes a multipart message to the peer named by its first frame.
    ///
    /// The destination frame is stripped; the remaining frames are
    /// delivered as sent.
    pub async fn send(&self, mut frames: Frames) -> Result<()> {
        if frames.is_empty() {
            return Err(MeshError::Protocol("cannot route an empty message".to_string()));
        }
        let dest = frames.remove(0);

        let tx = lock_peers(&self.peers).get(&dest).cloned();
        let tx = match tx {
            Some(tx) => tx,
            None => return Err(MeshError::UnknownPeer(lossy(&dest))),
        };

        if tx.send(frames).await.is_err() {
            remove_if_same(&self.peers, &dest, &tx);
            return Err(MeshError::Connection(format!("peer {} disconnected", lossy(&dest))));
        }
        Ok(())
    }

    /// Receives the next message as `[sender_identity, frames...]`.
    ///
    /// Cancellation-safe; suitable for use inside `tokio::select!`.
    pub async fn recv(&mut self) -> Option<Frames> {
        self.incoming_rx.recv().await.map(|(identity, mut frames)| {
            frames.insert(0, identity);
            frames
        })
    }

    /// The bound address, if [`bind`](Self::bind) was called.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// This socket's identity.
    pub fn identity(&self) -> &Bytes {
        &self.identity
    }

    /// Stops accepting and drops all connections.
    pub fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        lock_peers(&self.peers).clear();
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.close();
    }
}

async fn handle_inbound(
    stream: TcpStream,
    peers: PeerMap,
    incoming: mpsc::Sender<(Bytes, Frames)>,
) {
    let (mut read_half, write_half) = stream.into_split();

    // The dialing side introduces itself before anything else.
    let identity = match read_frames(&mut read_half).await {
        Ok(Some(frames)) if !frames.is_empty() => frames[0].clone(),
        Ok(_) => {
            warn!("peer closed before identity handshake");
            return;
        }
        Err(e) => {
            warn!("identity handshake failed: {}", e);
            return;
        }
    };

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let weak = tx.downgrade();
    lock_peers(&peers).insert(identity.clone(), tx);
    tokio::spawn(write_loop(write_half, rx));

    read_loop(identity.clone(), read_half, incoming).await;
    remove_stale(&peers, &identity, &weak);
}

async fn read_loop(
    identity: Bytes,
    mut read_half: OwnedReadHalf,
    incoming: mpsc::Sender<(Bytes, Frames)>,
) {
    loop {
        match read_frames(&mut read_half).await {
            Ok(Some(frames)) => {
                if incoming.send((identity.clone(), frames)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %lossy(&identity), "socket read error: {}", e);
                break;
            }
        }
    }
}

async fn write_loop(mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Frames>) {
    while let Some(frames) = rx.recv().await {
        if let Err(e) = write_frames(&mut write_half, &frames).await {
            warn!("socket write error: {}", e);
            break;
        }
    }
}

/// Removes a peer entry, but only if it still belongs to this connection.
/// A reconnect may have replaced the entry in the meantime.
fn remove_if_same(peers: &PeerMap, key: &Bytes, tx: &mpsc::Sender<Frames>) {
    let mut peers = lock_peers(peers);
    if peers.get(key).map(|t| t.same_channel(tx)) == Some(true) {
        peers.remove(key);
    }
}

fn remove_stale(peers: &PeerMap, key: &Bytes, weak: &mpsc::WeakSender<Frames>) {
    // Upgrade failure means the table no longer holds this connection's
    // sender; there is nothing left to clean up.
    if let Some(tx) = weak.upgrade() {
        remove_if_same(peers, key, &tx);
    }
}

fn lock_peers(peers: &PeerMap) -> MutexGuard<'_, HashMap<Bytes, mpsc::Sender<Frames>>> {
    peers.lock().expect("peer table lock poisoned")
}

fn lossy(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_assigns_local_addr() {
        let mut router = RouterSocket::new("router-a");
        let addr = router.bind("127.0.0.1:0").await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(router.local_addr(), Some(addr));
    }

    #[tokio::test]
    async fn test_double_bind_rejected() {
        let mut router = RouterSocket::new("router-a");
        router.bind("127.0.0.1:0").await.unwrap();
        assert!(router.bind("127.0.0.1:0").await.is_err());
    }

    #[tokio::test]
    async fn test_router_to_router_round_trip() {
        let mut listener = RouterSocket::new("listener");
        let addr = listener.bind("127.0.0.1:0").await.unwrap();

        let mut dialer = RouterSocket::new("dialer");
        let endpoint = addr.to_string();
        dialer.connect(&endpoint).await.unwrap();

        // Dialer addresses the listener by endpoint.
        dialer
            .send(vec![
                Bytes::copy_from_slice(endpoint.as_bytes()),
                Bytes::from_static(b"hello"),
            ])
            .await
            .unwrap();

        // Listener sees the dialer's handshake identity prepended.
        let msg = listener.recv().await.unwrap();
        assert_eq!(msg[0].as_ref(), b"dialer");
        assert_eq!(msg[1].as_ref(), b"hello");

        // Reply routed back by that identity.
        listener
            .send(vec![msg[0].clone(), Bytes::from_static(b"world")])
            .await
            .unwrap();

        let reply = dialer.recv().await.unwrap();
        assert_eq!(reply[0].as_ref(), endpoint.as_bytes());
        assert_eq!(reply[1].as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_errors() {
        let router = RouterSocket::new("router-a");
        let err = router
            .send(vec![Bytes::from_static(b"nobody"), Bytes::from_static(b"x")])
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_disconnect_forgets_peer() {
        let mut listener = RouterSocket::new("listener");
        let addr = listener.bind("127.0.0.1:0").await.unwrap();

        let mut dialer = RouterSocket::new("dialer");
        let endpoint = addr.to_string();
        dialer.connect(&endpoint).await.unwrap();
        dialer.disconnect(&endpoint);

        let err = dialer
            .send(vec![
                Bytes::copy_from_slice(endpoint.as_bytes()),
                Bytes::from_static(b"x"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_tcp_prefix_accepted() {
        let mut listener = RouterSocket::new("listener");
        let addr = listener.bind("tcp://127.0.0.1:0").await.unwrap();

        let mut dialer = RouterSocket::new("dialer");
        dialer.connect(&format!("tcp://{}", addr)).await.unwrap();
    }
}
