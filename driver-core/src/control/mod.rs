use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ControlConfig;
use crate::connection::{probe, Connection, Connector};
use crate::control::state::{
    transition, ConnectionState, ControlAction, ControlEvent, ControlState,
};
use crate::error::{Result, TopologyError};
use crate::event::HostEvent;
use crate::host::{Host, HostRef, NodeIdentity};
use crate::reconciler::PeerReconciler;
use crate::reconnection::policy::ReconnectionPolicy;
use crate::registry::HostRegistry;

pub mod state;

const TRANSITION_BUFFER: usize = 64;

/// Owns the single connection used for topology queries and moves it to
/// another host when it breaks. Every state change happens on one task, fed
/// by a mailbox and by registry events.
#[derive(Debug, Clone)]
pub struct ControlConnectionManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
pub struct Inner {
    registry: HostRegistry,
    connector: Arc<dyn Connector>,
    policy: Arc<dyn ReconnectionPolicy>,
    connect_timeout: Duration,
    reconciler: Option<Arc<PeerReconciler>>,
    state: RwLock<ControlState>,
    active: Mutex<Option<ActiveConnection>>,
    mailbox: mpsc::UnboundedSender<ControlMessage>,
    mailbox_rx: Mutex<Option<mpsc::UnboundedReceiver<ControlMessage>>>,
    transitions: broadcast::Sender<ControlTransition>,
    retry: Mutex<Option<AbortHandle>>,
    next_connection_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Deref for ControlConnectionManager {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug, Clone)]
struct ActiveConnection {
    id: u64,
    target: HostRef,
    connection: Arc<dyn Connection>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ControlTransition {
    pub from: ControlState,
    pub to: ControlState,
}

#[derive(Debug)]
enum ControlMessage {
    Open {
        candidates: Vec<SocketAddr>,
        reply: oneshot::Sender<Result<HostRef>>,
    },
    Event(ControlEvent),
}

impl ControlConnectionManager {
    pub fn new(
        registry: HostRegistry,
        connector: Arc<dyn Connector>,
        policy: Arc<dyn ReconnectionPolicy>,
        config: &ControlConfig,
        reconciler: Option<Arc<PeerReconciler>>,
    ) -> Self {
        let (mailbox, mailbox_rx) = mpsc::unbounded_channel();
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        let inner = Inner {
            registry,
            connector,
            policy,
            connect_timeout: config.connect_timeout,
            reconciler,
            state: RwLock::new(ControlState::Closed),
            active: Mutex::new(None),
            mailbox,
            mailbox_rx: Mutex::new(Some(mailbox_rx)),
            transitions,
            retry: Mutex::new(None),
            next_connection_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn start(&self) -> anyhow::Result<JoinHandle<()>> {
        let mailbox = self
            .mailbox_rx
            .lock()
            .take()
            .ok_or_else(|| anyhow!("cannot start ControlConnectionManager more than once"))?;
        let host_events = self.registry.subscribe();
        let manager = self.clone();
        Ok(tokio::spawn(manager.run(mailbox, host_events)))
    }

    /// Tries `candidates` in order and keeps the first one that answers with
    /// an acceptable identity. Resolves immediately when already connected.
    pub async fn open(&self, candidates: Vec<SocketAddr>) -> Result<HostRef> {
        if self.shutdown.is_cancelled() {
            return Err(TopologyError::ClusterClosed);
        }
        let (reply, reply_rx) = oneshot::channel();
        self.mailbox
            .send(ControlMessage::Open { candidates, reply })
            .map_err(|_| TopologyError::ClusterClosed)?;
        reply_rx.await.map_err(|_| TopologyError::ClusterClosed)?
    }

    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            let _ = self.mailbox.send(ControlMessage::Event(ControlEvent::Shutdown));
        }
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.active.lock().as_ref().map(|active| active.connection.clone())
    }

    pub fn target(&self) -> Option<HostRef> {
        self.state.read().target()
    }

    pub fn state(&self) -> ControlState {
        self.state.read().clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.read().connection_state()
    }

    pub fn is_open(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ControlTransition> {
        self.transitions.subscribe()
    }

    async fn run(
        self,
        mut mailbox: mpsc::UnboundedReceiver<ControlMessage>,
        mut host_events: broadcast::Receiver<HostEvent>,
    ) {
        loop {
            let message = tokio::select! {
                message = mailbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                event = host_events.recv() => match event {
                    Ok(HostEvent::Up(host)) => {
                        ControlMessage::Event(ControlEvent::HostUp(host.host_ref()))
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("control connection lagged {} host events", skipped);
                        ControlMessage::Event(ControlEvent::RetryDue)
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            match message {
                ControlMessage::Open { candidates, reply } => {
                    let result = self.open_any(candidates).await;
                    let _ = reply.send(result);
                }
                ControlMessage::Event(ControlEvent::Shutdown) => {
                    self.handle(ControlEvent::Shutdown).await;
                    break;
                }
                ControlMessage::Event(event) => self.handle(event).await,
            }
        }
        self.release().await;
        debug!("control connection manager stopped");
    }

    async fn open_any(&self, candidates: Vec<SocketAddr>) -> Result<HostRef> {
        if let Some(target) = self.target() {
            return Ok(target);
        }
        let mut tried = Vec::with_capacity(candidates.len());
        for address in candidates {
            tried.push(address);
            let probed = probe(self.connector.as_ref(), address, self.connect_timeout).await;
            let (connection, identity) = match probed {
                Ok(probed) => probed,
                Err(error) => {
                    debug!("contact point unavailable: {}", error);
                    continue;
                }
            };
            match self.admit(address, &identity) {
                Ok(target) => {
                    let opened = self.install(target, connection).await;
                    self.handle(opened).await;
                    return Ok(target);
                }
                Err(error) => {
                    warn!("contact point rejected: {}", error);
                    connection.close().await;
                }
            }
        }
        Err(TopologyError::NoReachableHost { tried })
    }

    /// Identity gate for contact points. Known addresses must match their
    /// record, unknown ones must belong to the learned cluster.
    fn admit(&self, address: SocketAddr, identity: &NodeIdentity) -> Result<HostRef> {
        match self.registry.get(&address) {
            Some(host) => {
                let host = self.registry.verify_identity(host.host_ref(), identity)?;
                self.registry.learn_cluster_name(&identity.cluster_name);
                let host = if host.is_down() {
                    self.registry.confirm_up(host.host_ref(), identity)?
                } else {
                    host
                };
                Ok(host.host_ref())
            }
            None => {
                if !self.registry.learn_cluster_name(&identity.cluster_name) {
                    return Err(TopologyError::IdentityMismatch {
                        address,
                        expected: NodeIdentity::new(
                            self.registry.cluster_name().unwrap_or_default(),
                            identity.token.clone(),
                        ),
                        observed: identity.clone(),
                    });
                }
                let outcome = self.registry.upsert_peer(address, identity.token.clone(), true);
                Ok(outcome.current().host_ref())
            }
        }
    }

    async fn handle(&self, event: ControlEvent) {
        let mut next = Some(event);
        while let Some(event) = next.take() {
            let action = {
                let mut state = self.state.write();
                let (to, action) = transition(&state, event);
                if to != *state {
                    let from = std::mem::replace(&mut *state, to.clone());
                    debug!("control connection {} -> {}", from, to);
                    let _ = self.transitions.send(ControlTransition { from, to });
                }
                action
            };
            next = self.execute(action).await;
        }
    }

    async fn execute(&self, action: ControlAction) -> Option<ControlEvent> {
        match action {
            ControlAction::None => None,
            ControlAction::ReportDown { failed } => {
                warn!("control connection to {} closed", failed);
                self.drop_active().await;
                if self.is_current(failed) {
                    self.registry.mark_down(failed.address);
                }
                Some(self.failover(Some(failed)).await)
            }
            ControlAction::Failover => Some(self.failover(None).await),
            ControlAction::ScheduleRetry { retries } => {
                self.schedule_retry(retries);
                None
            }
            ControlAction::Refresh => {
                self.refresh().await;
                None
            }
            ControlAction::Release => {
                self.release().await;
                None
            }
        }
    }

    /// Walks the `UP` hosts, skipping `exclude` and hosts with a suspect
    /// identity.
    async fn failover(&self, exclude: Option<HostRef>) -> ControlEvent {
        let candidates = self
            .registry
            .snapshot()
            .up_hosts()
            .filter(|host| !host.identity_suspect)
            .filter(|host| exclude.map_or(true, |failed| failed.address != host.address))
            .map(Host::host_ref)
            .collect::<Vec<_>>();
        trace!("control connection failover candidates: {:?}", candidates);
        for candidate in candidates {
            if self.shutdown.is_cancelled() {
                break;
            }
            match probe(self.connector.as_ref(), candidate.address, self.connect_timeout).await {
                Ok((connection, identity)) => {
                    match self.registry.verify_identity(candidate, &identity) {
                        Ok(_) => return self.install(candidate, connection).await,
                        Err(error) => {
                            warn!("control connection refused {}: {}", candidate, error);
                            connection.close().await;
                        }
                    }
                }
                Err(error) => {
                    debug!("control connection failover to {} failed: {}", candidate, error);
                    if self.is_current(candidate) {
                        self.registry.mark_down(candidate.address);
                    }
                }
            }
        }
        ControlEvent::FailoverExhausted
    }

    async fn install(&self, target: HostRef, connection: Arc<dyn Connection>) -> ControlEvent {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let active = ActiveConnection {
            id,
            target,
            connection: connection.clone(),
        };
        let previous = self.active.lock().replace(active);
        if let Some(previous) = previous {
            previous.connection.close().await;
        }
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            connection.closed().await;
            let closed = ControlEvent::SocketClosed { connection_id: id };
            let _ = mailbox.send(ControlMessage::Event(closed));
        });
        info!("control connection established to {}", target);
        ControlEvent::Opened {
            target,
            connection_id: id,
        }
    }

    fn schedule_retry(&self, retries: u32) {
        let delay = self.policy.delay(retries);
        let mailbox = self.mailbox.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = mailbox.send(ControlMessage::Event(ControlEvent::RetryDue));
                }
            }
        });
        if let Some(previous) = self.retry.lock().replace(handle.abort_handle()) {
            previous.abort();
        }
        debug!("no host accepted the control connection, retry {} in {:?}", retries, delay);
    }

    async fn refresh(&self) {
        let (Some(reconciler), Some(connection)) = (&self.reconciler, self.connection()) else {
            return;
        };
        if let Err(error) = reconciler.reconcile(connection.as_ref()).await {
            debug!("{}", error);
        }
    }

    async fn drop_active(&self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            trace!("control connection {} to {} dropped", active.id, active.target);
            active.connection.close().await;
        }
    }

    async fn release(&self) {
        if let Some(retry) = self.retry.lock().take() {
            retry.abort();
        }
        self.drop_active().await;
    }

    fn is_current(&self, host_ref: HostRef) -> bool {
        self.registry
            .get(&host_ref.address)
            .is_some_and(|host| host.generation == host_ref.generation)
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::{ControlConfig, ReconciliationConfig};
    use crate::control::state::{ConnectionState, ControlState};
    use crate::control::ControlConnectionManager;
    use crate::error::TopologyError;
    use crate::reconciler::PeerReconciler;
    use crate::reconnection::policy::ConstantReconnectionPolicy;
    use crate::registry::HostRegistry;
    use crate::simulation::{eventually, SimCluster};

    const WAIT: Duration = Duration::from_secs(5);

    fn addr(node: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 6, node], 9042))
    }

    fn manager(
        cluster: &SimCluster,
        registry: &HostRegistry,
    ) -> anyhow::Result<ControlConnectionManager> {
        let reconciliation = ReconciliationConfig {
            interval: Duration::from_secs(1),
            absence_threshold: 3,
            query_timeout: Duration::from_millis(500),
        };
        let reconciler = Arc::new(PeerReconciler::new(registry.clone(), &reconciliation));
        let manager = ControlConnectionManager::new(
            registry.clone(),
            Arc::new(cluster.clone()),
            Arc::new(ConstantReconnectionPolicy::new(Duration::from_millis(20))),
            &ControlConfig {
                connect_timeout: Duration::from_millis(200),
            },
            Some(reconciler),
        );
        manager.start()?;
        Ok(manager)
    }

    #[tokio::test]
    async fn test_open_learns_cluster_and_reconciles() -> anyhow::Result<()> {
        let cluster = SimCluster::new();
        for node in 1..=3 {
            cluster.add_node("main", addr(node));
        }
        let registry = HostRegistry::default();
        let manager = manager(&cluster, &registry)?;
        let target = manager.open(vec![addr(9), addr(2)]).await?;
        assert_eq!(target.address, addr(2));
        assert!(manager.is_open());
        assert_eq!(registry.cluster_name().as_deref(), Some("main"));
        assert_eq!(registry.up_count(), 3);
        assert!(manager.start().is_err());
        manager.close();
        assert!(eventually(WAIT, || manager.connection_state() == ConnectionState::Closed).await);
        assert!(matches!(manager.open(vec![addr(1)]).await, Err(TopologyError::ClusterClosed)));
        Ok(())
    }

    #[tokio::test]
    async fn test_open_without_reachable_host() -> anyhow::Result<()> {
        let cluster = SimCluster::new();
        cluster.add_node("main", addr(1));
        cluster.stop(addr(1));
        let registry = HostRegistry::default();
        let manager = manager(&cluster, &registry)?;
        let error = manager.open(vec![addr(1), addr(2)]).await.err();
        assert_eq!(
            error,
            Some(TopologyError::NoReachableHost {
                tried: vec![addr(1), addr(2)]
            })
        );
        assert!(!manager.is_open());
        Ok(())
    }

    #[tokio::test]
    async fn test_open_skips_foreign_contact_point() -> anyhow::Result<()> {
        let cluster = SimCluster::new();
        cluster.add_node("other", addr(1));
        cluster.add_node("main", addr(2));
        let registry = HostRegistry::default();
        registry.learn_cluster_name("main");
        let manager = manager(&cluster, &registry)?;
        let target = manager.open(vec![addr(1), addr(2)]).await?;
        assert_eq!(target.address, addr(2));
        assert!(registry.get(&addr(1)).is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_failover_reports_defunct_before_connected() -> anyhow::Result<()> {
        let cluster = SimCluster::new();
        for node in 1..=3 {
            cluster.add_node("main", addr(node));
        }
        let registry = HostRegistry::default();
        let manager = manager(&cluster, &registry)?;
        manager.open(vec![addr(1)]).await?;
        // only the next control host's peer table can report the new node
        cluster.add_node("main", addr(4));
        assert!(registry.get(&addr(4)).is_none());
        let mut transitions = manager.subscribe_transitions();
        cluster.stop(addr(1));
        let first = tokio::time::timeout(WAIT, transitions.recv()).await??;
        assert_eq!(first.to.connection_state(), ConnectionState::Defunct);
        let second = tokio::time::timeout(WAIT, transitions.recv()).await??;
        assert_eq!(second.from, first.to);
        assert_eq!(second.to.connection_state(), ConnectionState::Connected);
        let target = manager.target().map(|target| target.address);
        assert!(target == Some(addr(2)) || target == Some(addr(3)));
        assert!(registry.get(&addr(1)).is_some_and(|host| host.is_down()));
        assert!(eventually(WAIT, || registry.get(&addr(4)).is_some_and(|host| host.is_up())).await);
        Ok(())
    }

    #[tokio::test]
    async fn test_failover_takes_down_host_answering_as_foreign() -> anyhow::Result<()> {
        let cluster = SimCluster::new();
        cluster.add_node("main", addr(1));
        cluster.add_node("main", addr(2));
        let registry = HostRegistry::default();
        let manager = manager(&cluster, &registry)?;
        manager.open(vec![addr(1)]).await?;
        assert_eq!(registry.up_count(), 2);
        cluster.recommission(addr(2), "other");
        cluster.stop(addr(1));
        assert!(
            eventually(WAIT, || manager.connection_state() == ConnectionState::Reconnecting).await
        );
        let host = registry
            .get(&addr(2))
            .ok_or_else(|| anyhow::anyhow!("no record for {}", addr(2)))?;
        assert!(host.is_down());
        assert!(host.identity_suspect);
        assert_eq!(registry.up_count(), 0);
        assert!(!manager.is_open());
        Ok(())
    }

    #[tokio::test]
    async fn test_does_not_fail_over_to_recommissioned_node() -> anyhow::Result<()> {
        let cluster = SimCluster::new();
        cluster.add_node("main", addr(1));
        cluster.add_node("main", addr(2));
        cluster.stop(addr(1));
        let registry = HostRegistry::default();
        let manager = manager(&cluster, &registry)?;
        manager.open(vec![addr(2)]).await?;
        assert!(registry.get(&addr(1)).is_some_and(|host| host.is_down()));
        cluster.recommission(addr(1), "other");
        cluster.stop(addr(2));
        assert!(
            eventually(WAIT, || manager.connection_state() == ConnectionState::Reconnecting).await
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!manager.is_open());
        assert_eq!(manager.target(), None);
        assert!(manager.connection().is_none());
        assert_eq!(registry.up_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_reconnects_when_a_host_comes_up() -> anyhow::Result<()> {
        let cluster = SimCluster::new();
        cluster.add_node("main", addr(1));
        cluster.add_node("main", addr(2));
        let registry = HostRegistry::default();
        let manager = manager(&cluster, &registry)?;
        manager.open(vec![addr(1)]).await?;
        cluster.stop(addr(2));
        registry.mark_down(addr(2));
        cluster.stop(addr(1));
        assert!(
            eventually(WAIT, || manager.connection_state() == ConnectionState::Reconnecting).await
        );
        cluster.start(addr(2));
        let identity = cluster
            .identity_at(addr(2))
            .ok_or_else(|| anyhow::anyhow!("no node at {}", addr(2)))?;
        registry.mark_up(addr(2), &identity)?;
        assert!(eventually(WAIT, || manager.is_open()).await);
        assert!(matches!(
            manager.state(),
            ControlState::Connected { target, .. } if target.address == addr(2)
        ));
        Ok(())
    }
}
