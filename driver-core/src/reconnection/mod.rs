use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{probe, Connector};
use crate::error::TopologyError;
use crate::event::HostEvent;
use crate::host::{Generation, HostRef, NodeIdentity};
use crate::reconnection::policy::ReconnectionPolicy;
use crate::registry::HostRegistry;

pub mod policy;

/// Keeps exactly one background reconnection attempt per `DOWN` host record.
#[derive(Debug, Clone)]
pub struct ReconnectionScheduler {
    inner: Arc<Inner>,
}

#[derive(Debug)]
pub struct Inner {
    registry: HostRegistry,
    connector: Arc<dyn Connector>,
    policy: Arc<dyn ReconnectionPolicy>,
    connect_timeout: Duration,
    attempts: DashMap<Generation, Attempt>,
    next_attempt_id: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Debug)]
struct Attempt {
    id: u64,
    host: HostRef,
    cancel: CancellationToken,
}

impl Deref for ReconnectionScheduler {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl ReconnectionScheduler {
    pub fn new(
        registry: HostRegistry,
        connector: Arc<dyn Connector>,
        policy: Arc<dyn ReconnectionPolicy>,
        connect_timeout: Duration,
    ) -> Self {
        let inner = Inner {
            registry,
            connector,
            policy,
            connect_timeout,
            attempts: DashMap::new(),
            next_attempt_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Follows registry events until [`ReconnectionScheduler::shutdown`].
    pub fn start(&self) -> JoinHandle<()> {
        let mut events = self.registry.subscribe();
        self.resync();
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = scheduler.shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => scheduler.on_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("reconnection scheduler lagged {} host events, resync", skipped);
                        scheduler.resync();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            scheduler.attempts.clear();
            debug!("reconnection scheduler stopped");
        })
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.attempts.clear();
    }

    pub fn active_attempts(&self) -> usize {
        self.attempts.len()
    }

    pub fn has_attempt(&self, address: &SocketAddr) -> bool {
        self.attempts.iter().any(|attempt| attempt.host.address == *address)
    }

    fn on_event(&self, event: HostEvent) {
        trace!("reconnection scheduler received {}", event);
        match event {
            HostEvent::Added(host) | HostEvent::Down(host) => {
                if host.is_down() {
                    self.schedule(host.host_ref());
                }
            }
            HostEvent::Up(host) | HostEvent::Removed(host) => {
                self.cancel(host.generation);
            }
        }
    }

    /// Aligns the attempt arena with the current snapshot.
    fn resync(&self) {
        let snapshot = self.registry.snapshot();
        self.attempts.retain(|_, attempt| {
            let keep = snapshot
                .get(&attempt.host.address)
                .is_some_and(|host| host.generation == attempt.host.generation && host.is_down());
            if !keep {
                attempt.cancel.cancel();
            }
            keep
        });
        for host in snapshot.down_hosts() {
            self.schedule(host.host_ref());
        }
    }

    fn schedule(&self, host: HostRef) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let current = self
            .registry
            .get(&host.address)
            .is_some_and(|record| record.generation == host.generation && record.is_down());
        if !current {
            trace!("skip reconnection for {}, record changed", host);
            return;
        }
        if let Entry::Vacant(vacant) = self.attempts.entry(host.generation) {
            let id = self.next_attempt_id.fetch_add(1, Ordering::Relaxed);
            let cancel = self.shutdown.child_token();
            vacant.insert(Attempt {
                id,
                host,
                cancel: cancel.clone(),
            });
            debug!("reconnection scheduled for {}", host);
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run(host, cancel).await;
                scheduler.attempts.remove_if(&host.generation, |_, attempt| attempt.id == id);
            });
        }
    }

    fn cancel(&self, generation: Generation) {
        if let Some((_, attempt)) = self.attempts.remove(&generation) {
            attempt.cancel.cancel();
            debug!("reconnection for {} cancelled", attempt.host);
        }
    }

    async fn run(&self, host: HostRef, cancel: CancellationToken) {
        let mut failed_attempts = 0u32;
        let mut foreign: Option<NodeIdentity> = None;
        loop {
            let delay = match foreign {
                Some(_) => self.policy.max_delay(),
                None => self.policy.delay(failed_attempts),
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let probed = tokio::select! {
                _ = cancel.cancelled() => return,
                probed = probe(self.connector.as_ref(), host.address, self.connect_timeout) => {
                    probed
                }
            };
            let (connection, identity) = match probed {
                Ok(probed) => probed,
                Err(error) => {
                    failed_attempts = failed_attempts.saturating_add(1);
                    foreign = None;
                    debug!(
                        "reconnection to {} failed after {} attempts: {}",
                        host, failed_attempts, error
                    );
                    continue;
                }
            };
            // a completion racing with cancellation must not touch the registry
            let confirmed = if cancel.is_cancelled() {
                None
            } else {
                Some(self.registry.confirm_up(host, &identity))
            };
            connection.close().await;
            match confirmed {
                None => {
                    debug!("discard reconnection result for {}, attempt cancelled", host);
                    return;
                }
                Some(Ok(_)) => {
                    info!("reconnected to {} after {} failed attempts", host, failed_attempts);
                    return;
                }
                Some(Err(error @ TopologyError::IdentityMismatch { .. })) => {
                    if foreign.as_ref() != Some(&identity) {
                        warn!("{}, socket discarded", error);
                    } else {
                        debug!("{} still answered by {}", host, identity);
                    }
                    failed_attempts = failed_attempts.saturating_add(1);
                    foreign = Some(identity);
                }
                Some(Err(error)) => {
                    debug!("stop reconnection for {}: {}", host, error);
                    return;
                }
            }
        }
    }
}
