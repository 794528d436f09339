//! In-memory cluster that plays the part of real nodes.
//!
//! Nodes belong to a named cluster and are bound to an address. Stopping a
//! node closes every connection opened to it but keeps it in its cluster's
//! peer table, the way a stale gossip entry lingers. Recommissioning an
//! address binds a brand new node, possibly of another cluster, to it.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::HashMap;
use anyhow::anyhow;
use async_trait::async_trait;
use itertools::Itertools;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use uuid::Uuid;

use crate::connection::{Connection, Connector, PeerRow};
use crate::host::{IdentityToken, NodeIdentity};

#[derive(Debug, Clone, Default)]
pub struct SimCluster {
    state: Arc<Mutex<SimState>>,
}

#[derive(Debug, Default)]
struct SimState {
    nodes: Vec<SimNode>,
    occupants: HashMap<SocketAddr, usize>,
    connect_attempts: HashMap<SocketAddr, usize>,
    connect_latency: Duration,
}

#[derive(Debug)]
struct SimNode {
    cluster_name: String,
    address: SocketAddr,
    token: IdentityToken,
    running: bool,
    hidden: bool,
    leaked_into: Option<String>,
    alive: watch::Sender<bool>,
}

impl SimNode {
    fn identity(&self) -> NodeIdentity {
        NodeIdentity {
            cluster_name: self.cluster_name.clone(),
            token: self.token.clone(),
        }
    }
}

impl SimState {
    fn occupant(&mut self, address: &SocketAddr) -> Option<&mut SimNode> {
        let index = *self.occupants.get(address)?;
        self.nodes.get_mut(index)
    }

    fn is_bound(&self, index: usize) -> bool {
        self.nodes
            .get(index)
            .is_some_and(|node| self.occupants.get(&node.address) == Some(&index))
    }
}

impl SimCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new node of `cluster_name` on `address`, which must be free or
    /// held by a stopped node.
    pub fn add_node(&self, cluster_name: &str, address: SocketAddr) -> IdentityToken {
        let mut state = self.state.lock();
        if let Some(node) = state.occupant(&address) {
            node.running = false;
            node.alive.send_replace(false);
        }
        let token = IdentityToken::new(Uuid::new_v4().to_string());
        let (alive, _) = watch::channel(true);
        state.nodes.push(SimNode {
            cluster_name: cluster_name.to_string(),
            address,
            token: token.clone(),
            running: true,
            hidden: false,
            leaked_into: None,
            alive,
        });
        let index = state.nodes.len() - 1;
        state.occupants.insert(address, index);
        trace!("sim node {}/{} bound to {}", cluster_name, token, address);
        token
    }

    /// The node at `address` leaves and a new node of `cluster_name` takes the
    /// address over. The old node stays in its cluster's peer table.
    pub fn recommission(&self, address: SocketAddr, cluster_name: &str) -> IdentityToken {
        self.add_node(cluster_name, address)
    }

    pub fn stop(&self, address: SocketAddr) {
        if let Some(node) = self.state.lock().occupant(&address) {
            node.running = false;
            node.alive.send_replace(false);
        }
    }

    pub fn start(&self, address: SocketAddr) {
        if let Some(node) = self.state.lock().occupant(&address) {
            if !node.running {
                node.running = true;
                let (alive, _) = watch::channel(true);
                node.alive = alive;
            }
        }
    }

    /// Hides the node at `address` from every peer table, as if gossip lost it.
    pub fn set_hidden(&self, address: SocketAddr, hidden: bool) {
        if let Some(node) = self.state.lock().occupant(&address) {
            node.hidden = hidden;
        }
    }

    /// Makes the node at `address` show up in the peer tables of
    /// `cluster_name`, as when a node gossips with the wrong cluster.
    pub fn leak_into(&self, address: SocketAddr, cluster_name: &str) {
        if let Some(node) = self.state.lock().occupant(&address) {
            node.leaked_into = Some(cluster_name.to_string());
        }
    }

    pub fn identity_at(&self, address: SocketAddr) -> Option<NodeIdentity> {
        self.state.lock().occupant(&address).map(|node| node.identity())
    }

    /// Delays every successful connect by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.state.lock().connect_latency = latency;
    }

    pub fn connect_attempts(&self, address: SocketAddr) -> usize {
        self.state
            .lock()
            .connect_attempts
            .get(&address)
            .copied()
            .unwrap_or(0)
    }

    fn peers_of(&self, cluster_name: &str) -> Vec<PeerRow> {
        let state = self.state.lock();
        // later nodes of the same cluster on the same address supersede earlier ones
        let mut latest = HashMap::<SocketAddr, usize>::default();
        for (index, node) in state.nodes.iter().enumerate() {
            if node.cluster_name == cluster_name
                || node.leaked_into.as_deref() == Some(cluster_name)
            {
                latest.insert(node.address, index);
            }
        }
        latest
            .into_values()
            .sorted_by_key(|index| state.nodes[*index].address)
            .filter_map(|index| {
                let node = &state.nodes[index];
                (!node.hidden).then(|| {
                    let reachable = node.running && state.is_bound(index);
                    PeerRow::new(node.address, node.token.clone(), reachable)
                })
            })
            .collect()
    }
}

#[async_trait]
impl Connector for SimCluster {
    async fn connect(&self, address: SocketAddr) -> anyhow::Result<Arc<dyn Connection>> {
        let (connection, latency) = {
            let mut state = self.state.lock();
            *state.connect_attempts.entry(address).or_default() += 1;
            let index = state
                .occupants
                .get(&address)
                .copied()
                .ok_or_else(|| anyhow!("connection refused: {}", address))?;
            let node = &state.nodes[index];
            if !node.running {
                return Err(anyhow!("connection refused: {}", address));
            }
            let connection = SimConnection {
                cluster: self.clone(),
                address,
                identity: node.identity(),
                alive: node.alive.subscribe(),
                closed_locally: CancellationToken::new(),
            };
            (connection, state.connect_latency)
        };
        // the handshake is already answered by whoever held the address when it started
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(Arc::new(connection))
    }
}

#[derive(Debug)]
pub struct SimConnection {
    cluster: SimCluster,
    address: SocketAddr,
    identity: NodeIdentity,
    alive: watch::Receiver<bool>,
    closed_locally: CancellationToken,
}

impl SimConnection {
    fn is_open(&self) -> bool {
        *self.alive.borrow() && !self.closed_locally.is_cancelled()
    }
}

#[async_trait]
impl Connection for SimConnection {
    fn address(&self) -> SocketAddr {
        self.address
    }

    async fn node_identity(&self) -> anyhow::Result<NodeIdentity> {
        if !self.is_open() {
            return Err(anyhow!("connection to {} closed", self.address));
        }
        Ok(self.identity.clone())
    }

    async fn topology(&self) -> anyhow::Result<Vec<PeerRow>> {
        if !self.is_open() {
            return Err(anyhow!("connection to {} closed", self.address));
        }
        Ok(self.cluster.peers_of(&self.identity.cluster_name))
    }

    async fn closed(&self) {
        let mut alive = self.alive.clone();
        let remote_closed = async move {
            loop {
                let is_alive = *alive.borrow_and_update();
                if !is_alive || alive.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            _ = remote_closed => {}
            _ = self.closed_locally.cancelled() => {}
        }
    }

    async fn close(&self) {
        self.closed_locally.cancel();
    }
}

/// Polls `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    poll_until(timeout, || std::future::ready(condition())).await
}

pub async fn poll_until<F, Fut>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
