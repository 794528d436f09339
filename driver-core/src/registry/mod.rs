use std::collections::VecDeque;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use ahash::{HashMap, HashSet};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::{Result, TopologyError};
use crate::event::HostEvent;
use crate::host::{Generation, Host, HostRef, HostState, IdentityToken, NodeIdentity};
pub use crate::registry::snapshot::TopologySnapshot;

mod snapshot;

/// Result of merging one peer row.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum UpsertOutcome {
    Added(Host),
    Refreshed(Host),
    Replaced { retired: Host, current: Host },
}

impl UpsertOutcome {
    pub fn current(&self) -> &Host {
        match self {
            UpsertOutcome::Added(host) | UpsertOutcome::Refreshed(host) => host,
            UpsertOutcome::Replaced { current, .. } => current,
        }
    }
}

/// Owner of every host record. All mutations go through one lock, readers get
/// immutable snapshots without taking it.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    inner: Arc<Inner>,
}

#[derive(Debug)]
pub struct Inner {
    state: Mutex<RegistryState>,
    snapshot: ArcSwap<TopologySnapshot>,
    events: broadcast::Sender<HostEvent>,
    retired_history: usize,
}

#[derive(Debug, Default)]
struct RegistryState {
    hosts: HashMap<SocketAddr, Host>,
    retired: VecDeque<Host>,
    next_generation: u64,
    cluster_name: Option<String>,
}

impl RegistryState {
    fn next_generation(&mut self) -> Generation {
        self.next_generation += 1;
        Generation(self.next_generation)
    }
}

impl Deref for HostRegistry {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl HostRegistry {
    pub fn new(config: &RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        let inner = Inner {
            state: Mutex::new(RegistryState::default()),
            snapshot: ArcSwap::from_pointee(TopologySnapshot::default()),
            events,
            retired_history: config.retired_history,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot.load_full()
    }

    pub fn get(&self, address: &SocketAddr) -> Option<Host> {
        self.snapshot.load().get(address).cloned()
    }

    pub fn up_count(&self) -> usize {
        self.snapshot.load().up_count()
    }

    /// Retired records, oldest first.
    pub fn retired(&self) -> Vec<Host> {
        self.state.lock().retired.iter().cloned().collect()
    }

    pub fn cluster_name(&self) -> Option<String> {
        self.state.lock().cluster_name.clone()
    }

    /// Adopts `name` as the cluster this client belongs to. Returns `false` when
    /// another name was learned before.
    pub fn learn_cluster_name(&self, name: &str) -> bool {
        let mut state = self.state.lock();
        match &state.cluster_name {
            None => {
                info!("cluster name learned: {}", name);
                state.cluster_name = Some(name.to_string());
                true
            }
            Some(current) => current == name,
        }
    }

    pub fn upsert_peer(
        &self,
        address: SocketAddr,
        identity_token: IdentityToken,
        reachable: bool,
    ) -> UpsertOutcome {
        let mut state = self.state.lock();
        if let Some(host) = state.hosts.get_mut(&address) {
            if host.last_seen_identity_token == identity_token {
                host.missed_refreshes = 0;
                let went_down = !reachable && host.is_up() && host.transition_to(HostState::Down);
                let host = host.clone();
                self.publish_snapshot(&state);
                if went_down {
                    info!("{} reported unreachable by peers", host);
                    self.publish(HostEvent::Down(host.clone()));
                }
                return UpsertOutcome::Refreshed(host);
            }
        }
        let retired = Self::retire_locked(&mut state, &address, self.retired_history);
        let generation = state.next_generation();
        // a new identity at a known address stays unconfirmed until a connection vouches for it
        let host_state = if reachable && retired.is_none() {
            HostState::Up
        } else {
            HostState::Down
        };
        let current = Host::new(address, identity_token, generation, host_state);
        state.hosts.insert(address, current.clone());
        self.publish_snapshot(&state);
        match retired {
            None => {
                debug!("new peer {}", current);
                self.publish(HostEvent::Added(current.clone()));
                UpsertOutcome::Added(current)
            }
            Some(retired) => {
                warn!(
                    "identity at {} changed from {} to {}, retired {}",
                    address, retired.identity_token, current.identity_token, retired
                );
                self.publish(HostEvent::Removed(retired.clone()));
                self.publish(HostEvent::Added(current.clone()));
                UpsertOutcome::Replaced { retired, current }
            }
        }
    }

    /// Socket level failure. Returns the record when it actually went down.
    pub fn mark_down(&self, address: SocketAddr) -> Option<Host> {
        let mut state = self.state.lock();
        let host = state.hosts.get_mut(&address)?;
        if !host.is_up() || !host.transition_to(HostState::Down) {
            return None;
        }
        let host = host.clone();
        info!("{} marked down", host);
        self.publish_snapshot(&state);
        self.publish(HostEvent::Down(host.clone()));
        Some(host)
    }

    /// Resolves the current record for `address` and confirms it with the
    /// identity observed on a live connection.
    pub fn mark_up(&self, address: SocketAddr, observed: &NodeIdentity) -> Result<Host> {
        let host_ref = self
            .get(&address)
            .map(|host| host.host_ref())
            .ok_or(TopologyError::StaleHost {
                address,
                generation: Generation(0),
            })?;
        self.confirm_up(host_ref, observed)
    }

    /// Moves the referenced record to `Up`, provided it is still the current
    /// record at its address and `observed` matches the confirmed identity.
    /// A mismatch flags the record as suspect and leaves its state alone.
    pub fn confirm_up(&self, host_ref: HostRef, observed: &NodeIdentity) -> Result<Host> {
        let mut state = self.state.lock();
        let cluster_name = state.cluster_name.clone();
        let host = Self::resolve_mut(&mut state, host_ref)?;
        if let Err(error) = Self::check_identity(host, cluster_name.as_deref(), observed) {
            let went_down = Self::flag_suspect(host);
            let host = host.clone();
            self.publish_foreign(&state, host, went_down);
            return Err(error);
        }
        host.identity_suspect = false;
        if !host.transition_to(HostState::Up) {
            return Ok(host.clone());
        }
        host.last_seen_identity_token = observed.token.clone();
        let host = host.clone();
        info!("{} confirmed up", host);
        self.publish_snapshot(&state);
        self.publish(HostEvent::Up(host.clone()));
        Ok(host)
    }

    /// Same identity checks as [`HostRegistry::confirm_up`]. A match leaves the
    /// liveness state alone, a mismatch takes an `Up` record down.
    pub fn verify_identity(&self, host_ref: HostRef, observed: &NodeIdentity) -> Result<Host> {
        let mut state = self.state.lock();
        let cluster_name = state.cluster_name.clone();
        let host = Self::resolve_mut(&mut state, host_ref)?;
        match Self::check_identity(host, cluster_name.as_deref(), observed) {
            Ok(()) => Ok(host.clone()),
            Err(error) => {
                let went_down = Self::flag_suspect(host);
                let host = host.clone();
                self.publish_foreign(&state, host, went_down);
                Err(error)
            }
        }
    }

    /// Counts one more miss for every current record absent from `seen` and
    /// retires those reaching `threshold`.
    pub fn record_absences(&self, seen: &HashSet<SocketAddr>, threshold: u32) -> Vec<Host> {
        let mut state = self.state.lock();
        let mut expired = vec![];
        for host in state.hosts.values_mut() {
            if seen.contains(&host.address) {
                continue;
            }
            host.missed_refreshes += 1;
            debug!("{} missing from peers ({}/{})", host, host.missed_refreshes, threshold);
            if host.missed_refreshes >= threshold {
                expired.push(host.address);
            }
        }
        let retired = expired
            .iter()
            .filter_map(|address| Self::retire_locked(&mut state, address, self.retired_history))
            .collect::<Vec<_>>();
        self.publish_snapshot(&state);
        for host in &retired {
            warn!("{} absent from {} consecutive refreshes, retired", host, threshold);
            self.publish(HostEvent::Removed(host.clone()));
        }
        retired
    }

    pub fn retire(&self, address: SocketAddr) -> Option<Host> {
        let mut state = self.state.lock();
        let retired = Self::retire_locked(&mut state, &address, self.retired_history)?;
        info!("{} retired", retired);
        self.publish_snapshot(&state);
        self.publish(HostEvent::Removed(retired.clone()));
        Some(retired)
    }

    fn resolve_mut(state: &mut RegistryState, host_ref: HostRef) -> Result<&mut Host> {
        state
            .hosts
            .get_mut(&host_ref.address)
            .filter(|host| host.generation == host_ref.generation)
            .ok_or(TopologyError::StaleHost {
                address: host_ref.address,
                generation: host_ref.generation,
            })
    }

    fn check_identity(
        host: &Host,
        cluster_name: Option<&str>,
        observed: &NodeIdentity,
    ) -> Result<()> {
        let same_cluster = cluster_name.map_or(true, |name| name == observed.cluster_name);
        if same_cluster && observed.token == host.last_seen_identity_token {
            Ok(())
        } else {
            let expected = NodeIdentity {
                cluster_name: cluster_name.unwrap_or(&observed.cluster_name).to_string(),
                token: host.last_seen_identity_token.clone(),
            };
            Err(TopologyError::IdentityMismatch {
                address: host.address,
                expected,
                observed: observed.clone(),
            })
        }
    }

    /// Marks `host` suspect and takes it down if it was up. Another node
    /// answers on its address, so its liveness is no longer known.
    fn flag_suspect(host: &mut Host) -> bool {
        host.identity_suspect = true;
        host.is_up() && host.transition_to(HostState::Down)
    }

    fn publish_foreign(&self, state: &RegistryState, host: Host, went_down: bool) {
        self.publish_snapshot(state);
        if went_down {
            warn!("{} answered with a foreign identity, marked down", host);
            self.publish(HostEvent::Down(host));
        }
    }

    fn retire_locked(
        state: &mut RegistryState,
        address: &SocketAddr,
        history: usize,
    ) -> Option<Host> {
        let mut host = state.hosts.remove(address)?;
        host.transition_to(HostState::Removed);
        if history > 0 {
            if state.retired.len() >= history {
                state.retired.pop_front();
            }
            state.retired.push_back(host.clone());
        }
        Some(host)
    }

    fn publish_snapshot(&self, state: &RegistryState) {
        let mut hosts = state.hosts.values().cloned().collect::<Vec<_>>();
        hosts.sort_by_key(|host| host.address);
        self.snapshot.store(Arc::new(TopologySnapshot::new(hosts)));
    }

    fn publish(&self, event: HostEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new(&RegistryConfig {
            retired_history: 32,
            event_buffer: 1024,
        })
    }
}

pub(crate) fn seen_addresses<'a>(
    addresses: impl IntoIterator<Item = &'a SocketAddr>,
) -> HashSet<SocketAddr> {
    let mut seen = HashSet::default();
    seen.extend(addresses.into_iter().copied());
    seen
}
