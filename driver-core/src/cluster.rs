use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use typed_builder::TypedBuilder;

use crate::config::TopologyConfig;
use crate::connection::Connector;
use crate::control::ControlConnectionManager;
use crate::event::HostEvent;
use crate::ext::dedup_contact_points;
use crate::reconciler::PeerReconciler;
use crate::reconnection::ReconnectionScheduler;
use crate::registry::{HostRegistry, TopologySnapshot};

#[derive(Debug, Clone, TypedBuilder)]
pub struct ClusterSetting {
    pub connector: Arc<dyn Connector>,
    pub contact_points: Vec<SocketAddr>,
    #[builder(default)]
    pub config: TopologyConfig,
}

/// Client side view of a cluster: the host registry plus the tasks that keep
/// it current.
#[derive(Debug, Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

#[derive(Debug)]
pub struct Inner {
    pub config: TopologyConfig,
    registry: HostRegistry,
    reconciler: Arc<PeerReconciler>,
    scheduler: ReconnectionScheduler,
    control: ControlConnectionManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    is_closed: AtomicBool,
}

impl Deref for Cluster {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Cluster {
    /// Opens the control connection through the first usable contact point
    /// and starts reconciliation and reconnection in the background.
    pub async fn connect(setting: ClusterSetting) -> anyhow::Result<Self> {
        let ClusterSetting {
            connector,
            contact_points,
            config,
        } = setting;
        config.validate()?;
        let contact_points = dedup_contact_points(contact_points);
        if contact_points.is_empty() {
            return Err(anyhow!("at least one contact point is required"));
        }
        let registry = HostRegistry::new(&config.registry);
        let policy = config.reconnection.policy();
        let reconciler = Arc::new(PeerReconciler::new(registry.clone(), &config.reconciliation));
        let control = ControlConnectionManager::new(
            registry.clone(),
            connector.clone(),
            policy.clone(),
            &config.control,
            Some(reconciler.clone()),
        );
        let scheduler = ReconnectionScheduler::new(
            registry.clone(),
            connector,
            policy,
            config.reconnection.connect_timeout,
        );
        let shutdown = CancellationToken::new();
        let tasks = vec![control.start()?, scheduler.start()];
        let inner = Inner {
            config,
            registry,
            reconciler,
            scheduler,
            control,
            tasks: Mutex::new(tasks),
            shutdown,
            is_closed: AtomicBool::new(false),
        };
        let cluster = Self {
            inner: Arc::new(inner),
        };
        let target = match cluster.control.open(contact_points).await {
            Ok(target) => target,
            Err(error) => {
                cluster.close().await;
                return Err(error).context("cannot open control connection");
            }
        };
        let periodic = cluster.reconciler.spawn_periodic(
            cluster.control.clone(),
            cluster.config.reconciliation.interval,
            cluster.shutdown.child_token(),
        );
        cluster.tasks.lock().push(periodic);
        info!(
            "connected to cluster {} through {}, {}",
            cluster.registry.cluster_name().unwrap_or_default(),
            target,
            cluster.snapshot()
        );
        Ok(cluster)
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn control(&self) -> &ControlConnectionManager {
        &self.control
    }

    pub fn scheduler(&self) -> &ReconnectionScheduler {
        &self.scheduler
    }

    pub fn reconciler(&self) -> &Arc<PeerReconciler> {
        &self.reconciler
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.registry.snapshot()
    }

    pub fn up_host_count(&self) -> usize {
        self.registry.up_count()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.registry.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub async fn close(&self) {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.scheduler.shutdown();
        self.control.close();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for result in futures::future::join_all(tasks).await {
            if let Err(error) = result {
                debug!("cluster task ended abnormally: {}", error);
            }
        }
        info!("cluster closed");
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::cluster::{Cluster, ClusterSetting};
    use crate::config::{PolicyKind, TopologyConfig};
    use crate::control::state::ConnectionState;
    use crate::error::TopologyError;
    use crate::host::HostState;
    use crate::simulation::{eventually, SimCluster};

    const WAIT: Duration = Duration::from_secs(5);

    fn addr(node: u8) -> SocketAddr {
        SocketAddr::from(([127, 0, 7, node], 9042))
    }

    fn fast_config() -> TopologyConfig {
        let mut config = TopologyConfig::default();
        config.reconnection.policy = PolicyKind::Constant;
        config.reconnection.base_delay = Duration::from_millis(20);
        config.reconnection.max_delay = Duration::from_millis(100);
        config.reconnection.connect_timeout = Duration::from_millis(200);
        config.reconciliation.interval = Duration::from_millis(50);
        config.reconciliation.query_timeout = Duration::from_millis(200);
        config.control.connect_timeout = Duration::from_millis(200);
        config
    }

    async fn connect(
        cluster: &SimCluster,
        contact_points: Vec<SocketAddr>,
    ) -> anyhow::Result<Cluster> {
        let setting = ClusterSetting::builder()
            .connector(Arc::new(cluster.clone()))
            .contact_points(contact_points)
            .config(fast_config())
            .build();
        Cluster::connect(setting).await
    }

    /// Samples the up count for `window` and returns the largest value seen.
    async fn max_up_count(cluster: &Cluster, window: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + window;
        let mut max = 0;
        while tokio::time::Instant::now() < deadline {
            max = max.max(cluster.up_host_count());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        max
    }

    #[tokio::test]
    async fn test_connect_without_reachable_contact_point() -> anyhow::Result<()> {
        let sim = SimCluster::new();
        sim.add_node("main", addr(1));
        sim.stop(addr(1));
        let error = connect(&sim, vec![addr(1), addr(1)]).await.err();
        let error = error.as_ref().and_then(|error| error.downcast_ref::<TopologyError>());
        assert_eq!(error, Some(&TopologyError::NoReachableHost { tried: vec![addr(1)] }));
        Ok(())
    }

    #[tokio::test]
    async fn test_foreign_node_on_reused_address_is_not_counted() -> anyhow::Result<()> {
        let sim = SimCluster::new();
        for node in 1..=3 {
            sim.add_node("main", addr(node));
        }
        let cluster = connect(&sim, vec![addr(2)]).await?;
        assert_eq!(cluster.up_host_count(), 3);
        let old = cluster
            .registry()
            .get(&addr(1))
            .ok_or_else(|| anyhow::anyhow!("host 1 unknown"))?;
        sim.stop(addr(1));
        assert!(eventually(WAIT, || cluster.scheduler().has_attempt(&addr(1))).await);
        assert_eq!(cluster.up_host_count(), 2);
        let foreign = sim.recommission(addr(1), "other");
        sim.leak_into(addr(1), "main");
        assert!(
            eventually(WAIT, || cluster
                .registry()
                .get(&addr(1))
                .is_some_and(|host| host.identity_token == foreign && host.identity_suspect))
            .await
        );
        assert_eq!(max_up_count(&cluster, Duration::from_millis(300)).await, 2);
        let retired = cluster.registry().retired();
        assert!(retired
            .iter()
            .any(|host| host.generation == old.generation && host.state == HostState::Removed));
        let current = cluster
            .registry()
            .get(&addr(1))
            .ok_or_else(|| anyhow::anyhow!("host 1 unknown"))?;
        assert!(current.is_down());
        assert_ne!(current.generation, old.generation);
        assert!(cluster.scheduler().has_attempt(&addr(1)));
        cluster.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_control_connection_never_moves_to_foreign_node() -> anyhow::Result<()> {
        let sim = SimCluster::new();
        sim.add_node("main", addr(1));
        sim.add_node("main", addr(2));
        sim.stop(addr(1));
        let cluster = connect(&sim, vec![addr(1), addr(2)]).await?;
        assert_eq!(cluster.control().target().map(|target| target.address), Some(addr(2)));
        assert!(cluster.registry().get(&addr(1)).is_some_and(|host| host.is_down()));
        sim.recommission(addr(1), "other");
        sim.leak_into(addr(1), "main");
        assert!(
            eventually(WAIT, || cluster
                .registry()
                .get(&addr(1))
                .is_some_and(|host| host.identity_suspect))
            .await
        );
        let mut transitions = cluster.control().subscribe_transitions();
        sim.stop(addr(2));
        let first = tokio::time::timeout(WAIT, transitions.recv()).await??;
        assert_eq!(first.to.connection_state(), ConnectionState::Defunct);
        assert!(
            eventually(WAIT, || {
                cluster.control().connection_state() == ConnectionState::Reconnecting
            })
            .await
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!cluster.control().is_open());
        assert_eq!(cluster.control().target(), None);
        assert_eq!(cluster.up_host_count(), 0);
        cluster.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_foreign_answer_hands_host_to_reconnection() -> anyhow::Result<()> {
        let sim = SimCluster::new();
        sim.add_node("main", addr(1));
        sim.add_node("main", addr(2));
        let cluster = connect(&sim, vec![addr(1)]).await?;
        assert_eq!(cluster.up_host_count(), 2);
        sim.recommission(addr(2), "other");
        sim.stop(addr(1));
        assert!(
            eventually(WAIT, || {
                cluster.control().connection_state() == ConnectionState::Reconnecting
            })
            .await
        );
        assert!(eventually(WAIT, || cluster.scheduler().has_attempt(&addr(2))).await);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let host = cluster
            .registry()
            .get(&addr(2))
            .ok_or_else(|| anyhow::anyhow!("host 2 unknown"))?;
        assert!(!host.is_up());
        assert!(host.identity_suspect);
        assert_eq!(cluster.up_host_count(), 0);
        assert!(!cluster.control().is_open());
        cluster.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_close_stops_background_work() -> anyhow::Result<()> {
        let sim = SimCluster::new();
        sim.add_node("main", addr(1));
        sim.add_node("main", addr(2));
        sim.stop(addr(2));
        let cluster = connect(&sim, vec![addr(1)]).await?;
        assert!(eventually(WAIT, || cluster.scheduler().has_attempt(&addr(2))).await);
        cluster.close().await;
        assert!(cluster.is_closed());
        assert_eq!(cluster.scheduler().active_attempts(), 0);
        assert_eq!(cluster.control().connection_state(), ConnectionState::Closed);
        assert!(cluster.control().connection().is_none());
        cluster.close().await;
        Ok(())
    }
}
