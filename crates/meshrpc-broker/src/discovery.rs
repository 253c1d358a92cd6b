//! Node discovery for a single remote service.
//!
//! Discovery is tightly coupled to its [`Broker`](crate::Broker) and is
//! started along with it. It runs as two tasks over single-owner state:
//!
//! - the **watcher** long-polls the node source and forwards each fresh
//!   listing;
//! - the **cycler** owns the node map and the rotation, turns listing
//!   deltas into `Connect`/`Disconnect` commands, ages liveness from
//!   heartbeat replies, and answers next-node requests.
//!
//! Pending listing and heartbeat events are always drained before a
//! next-node handoff is answered, so routing decisions reflect the
//! freshest liveness state the cycler has seen.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use meshrpc_catalog::NodeSource;
use meshrpc_common::{MeshError, Result};

/// Tagged command/event exchanged between Discovery and its Broker.
///
/// `Connect`/`Disconnect`/`Ping` flow Discovery → Broker; `Pong` flows
/// Broker → Discovery, reporting that a remote URI answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeMessage {
    Connect(String),
    Disconnect(String),
    Ping(String),
    Pong(String),
}

/// A discovered remote service instance.
///
/// `registered` means currently reported by the node source; `alive`
/// means a heartbeat reply has been observed since registration. Records
/// are never deleted: a deregistered node keeps its entry so it can
/// re-register cheaply, it just drops out of the rotation.
#[derive(Debug, Clone)]
pub struct Node {
    pub uri: String,
    pub registered: bool,
    pub alive: bool,
    missed_probes: u32,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How often registered nodes are re-probed.
    pub probe_interval: Duration,
    /// Consecutive missed probe windows before a node is considered not
    /// alive.
    pub failure_threshold: u32,
    /// Delay before retrying a failed node-source query.
    pub retry_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            failure_threshold: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Requests the next routable node from the cycler.
///
/// Each request is a rendezvous: the cycler picks the rotation head at
/// the moment it processes the request, after draining pending events.
/// An empty rotation answers `None` — never blocks.
#[derive(Clone)]
pub struct NextNodeHandle {
    tx: mpsc::Sender<oneshot::Sender<Option<String>>>,
}

impl NextNodeHandle {
    pub async fn request(&self) -> Result<Option<String>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(reply_tx)
            .await
            .map_err(|_| MeshError::ChannelClosed)?;
        reply_rx.await.map_err(|_| MeshError::ChannelClosed)
    }
}

/// The broker-facing side of a running discovery pair.
pub struct DiscoveryHandle {
    /// Topology commands for the broker to act on.
    pub commands: mpsc::Receiver<NodeMessage>,
    /// Heartbeat replies reported back by the broker.
    pub responses: mpsc::Sender<NodeMessage>,
    /// Next-node rendezvous.
    pub next_node: NextNodeHandle,
}

/// Node map and rotation state, owned exclusively by the cycler task.
pub struct Discovery {
    service: String,
    nodes: HashMap<String, Node>,
    /// First-sighting order; the rotation preserves it.
    order: Vec<String>,
    rotation: VecDeque<String>,
    /// Whether any heartbeat reply has ever been observed. Until then,
    /// registration alone qualifies a node for the rotation, so a cold
    /// start never routes into an empty rotation while nodes exist.
    any_pong: bool,
    failure_threshold: u32,
}

impl Discovery {
    fn new(service: String, failure_threshold: u32) -> Self {
        Self {
            service,
            nodes: HashMap::new(),
            order: Vec::new(),
            rotation: VecDeque::new(),
            any_pong: false,
            failure_threshold,
        }
    }

    /// Starts the watcher and cycler tasks for `service`.
    pub fn spawn(
        service: impl Into<String>,
        source: Arc<dyn NodeSource>,
        config: DiscoveryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (DiscoveryHandle, Vec<JoinHandle<()>>) {
        let service = service.into();

        // Command and next-node channels are depth-1 rendezvous points;
        // listing updates likewise hand over one listing at a time.
        let (command_tx, command_rx) = mpsc::channel(1);
        let (pong_tx, pong_rx) = mpsc::channel(16);
        let (next_tx, next_rx) = mpsc::channel(1);
        let (listing_tx, listing_rx) = mpsc::channel(1);

        let watcher = tokio::spawn(run_watcher(
            service.clone(),
            source,
            listing_tx,
            config.retry_delay,
            shutdown.clone(),
        ));

        let state = Discovery::new(service, config.failure_threshold);
        let cycler = tokio::spawn(run_cycler(
            state,
            listing_rx,
            pong_rx,
            next_rx,
            command_tx,
            config.probe_interval,
            shutdown,
        ));

        let handle = DiscoveryHandle {
            commands: command_rx,
            responses: pong_tx,
            next_node: NextNodeHandle { tx: next_tx },
        };
        (handle, vec![watcher, cycler])
    }

    /// Applies a fresh listing: registers new and returning nodes,
    /// deregisters removed ones, and rebuilds the rotation. Returns the
    /// commands the broker must act on.
    fn apply_listing(&mut self, listing: &[String]) -> Vec<NodeMessage> {
        let mut commands = Vec::new();

        for uri in listing {
            match self.nodes.get_mut(uri) {
                Some(node) if !node.registered => {
                    info!("Setting node {} as registered", uri);
                    node.registered = true;
                    node.missed_probes = 0;
                    commands.push(NodeMessage::Connect(uri.clone()));
                }
                Some(_) => {}
                None => {
                    info!("Discovered new node: {}", uri);
                    self.nodes.insert(
                        uri.clone(),
                        Node {
                            uri: uri.clone(),
                            registered: true,
                            alive: false,
                            missed_probes: 0,
                        },
                    );
                    self.order.push(uri.clone());
                    commands.push(NodeMessage::Connect(uri.clone()));
                }
            }
        }

        for uri in self.removed_nodes(listing) {
            info!("Deregistering node {}", uri);
            if let Some(node) = self.nodes.get_mut(&uri) {
                node.registered = false;
                node.alive = false;
            }
            commands.push(NodeMessage::Disconnect(uri));
        }

        self.rebuild_rotation();
        commands
    }

    /// Registered nodes absent from the latest listing, in first-sighting
    /// order.
    fn removed_nodes(&self, listing: &[String]) -> Vec<String> {
        self.order
            .iter()
            .filter(|uri| {
                self.nodes.get(*uri).map_or(false, |n| n.registered)
                    && !listing.contains(uri)
            })
            .cloned()
            .collect()
    }

    /// Marks a node alive after a heartbeat reply. A reply from a node
    /// that was never in a listing is ignored entirely; only a known
    /// node's reply may flip the eligibility predicate.
    fn mark_alive(&mut self, uri: &str) {
        let node = match self.nodes.get_mut(uri) {
            Some(node) => node,
            None => {
                debug!("Heartbeat reply from unknown node {}", uri);
                return;
            }
        };
        node.missed_probes = 0;
        if !node.alive {
            info!("Setting node {} as alive", uri);
            node.alive = true;
        }
        // The first reply also flips the eligibility predicate, so always
        // recompute.
        self.any_pong = true;
        self.rebuild_rotation();
    }

    /// One probe window: nodes that have gone `failure_threshold` windows
    /// without a reply are marked not alive; every registered node gets a
    /// fresh probe command.
    fn age_probes(&mut self) -> Vec<NodeMessage> {
        let mut commands = Vec::new();
        let mut changed = false;

        for uri in &self.order {
            if let Some(node) = self.nodes.get_mut(uri) {
                if !node.registered {
                    continue;
                }
                if node.alive && node.missed_probes >= self.failure_threshold {
                    warn!(
                        "Node {} missed {} probe windows, marking as not alive",
                        uri, node.missed_probes
                    );
                    node.alive = false;
                    changed = true;
                }
                node.missed_probes += 1;
                commands.push(NodeMessage::Ping(uri.clone()));
            }
        }

        if changed {
            self.rebuild_rotation();
        }
        commands
    }

    /// A node is routable while registered; once any heartbeat data
    /// exists for the service, it must also be alive.
    fn eligible(&self, node: &Node) -> bool {
        node.registered && (node.alive || !self.any_pong)
    }

    fn rebuild_rotation(&mut self) {
        let rotation: VecDeque<String> = self
            .order
            .iter()
            .filter(|uri| self.nodes.get(*uri).map_or(false, |n| self.eligible(n)))
            .cloned()
            .collect();
        debug!("Rotation for {} rebuilt: {:?}", self.service, rotation);
        self.rotation = rotation;
    }

    /// Pops the rotation head and cycles it to the tail.
    fn next_node(&mut self) -> Option<String> {
        let node = self.rotation.pop_front()?;
        self.rotation.push_back(node.clone());
        Some(node)
    }
}

async fn run_watcher(
    service: String,
    source: Arc<dyn NodeSource>,
    listing_tx: mpsc::Sender<Vec<String>>,
    retry_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            result = source.list_service_nodes(&service) => match result {
                Ok(listing) => {
                    debug!("Received nodes update for {}: {:?}", service, listing);
                    if listing_tx.send(listing).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Node source query for {} failed: {}", service, e);
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }
}

async fn run_cycler(
    mut state: Discovery,
    mut listing_rx: mpsc::Receiver<Vec<String>>,
    mut pong_rx: mpsc::Receiver<NodeMessage>,
    mut next_rx: mpsc::Receiver<oneshot::Sender<Option<String>>>,
    command_tx: mpsc::Sender<NodeMessage>,
    probe_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + probe_interval;
    let mut probe = tokio::time::interval_at(start, probe_interval);
    probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(listing) = listing_rx.recv() => {
                let commands = state.apply_listing(&listing);
                if !flush_commands(&mut state, &command_tx, &mut next_rx, commands).await {
                    break;
                }
            }
            Some(message) = pong_rx.recv() => match message {
                NodeMessage::Pong(uri) => state.mark_alive(&uri),
                other => error!("Unexpected node response: {:?}", other),
            },
            _ = probe.tick() => {
                let commands = state.age_probes();
                if !flush_commands(&mut state, &command_tx, &mut next_rx, commands).await {
                    break;
                }
            }
            Some(reply) = next_rx.recv() => {
                // The requester may have given up; that is not an error.
                let _ = reply.send(state.next_node());
            }
            else => break,
        }
    }
}

/// Delivers a command batch while continuing to answer next-node
/// requests. The command channel has depth 1 and the broker awaits the
/// handoff reply mid-request, so the cycler must never block on a full
/// channel without also serving `next_rx`; otherwise broker and cycler
/// wait on each other forever. Returns false once the broker side is
/// gone.
async fn flush_commands(
    state: &mut Discovery,
    command_tx: &mpsc::Sender<NodeMessage>,
    next_rx: &mut mpsc::Receiver<oneshot::Sender<Option<String>>>,
    commands: Vec<NodeMessage>,
) -> bool {
    for command in commands {
        loop {
            tokio::select! {
                sent = command_tx.send(command.clone()) => {
                    if sent.is_err() {
                        return false;
                    }
                    break;
                }
                Some(reply) = next_rx.recv() => {
                    let _ = reply.send(state.next_node());
                }
            }
        }
    }
    true
}
