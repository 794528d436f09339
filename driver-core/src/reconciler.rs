use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ReconciliationConfig;
use crate::connection::Connection;
use crate::control::ControlConnectionManager;
use crate::error::{Result, TopologyError};
use crate::host::Host;
use crate::registry::{seen_addresses, HostRegistry, UpsertOutcome};

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ReconcileReport {
    pub added: Vec<Host>,
    /// `(retired, current)` pairs for addresses whose identity changed.
    pub replaced: Vec<(Host, Host)>,
    pub retired: Vec<Host>,
    pub refreshed: usize,
}

impl ReconcileReport {
    pub fn is_quiet(&self) -> bool {
        self.added.is_empty() && self.replaced.is_empty() && self.retired.is_empty()
    }
}

/// Pulls peer tables over the control connection and merges them into the
/// registry.
#[derive(Debug)]
pub struct PeerReconciler {
    registry: HostRegistry,
    absence_threshold: u32,
    query_timeout: Duration,
    refreshing: tokio::sync::Mutex<()>,
}

impl PeerReconciler {
    pub fn new(registry: HostRegistry, config: &ReconciliationConfig) -> Self {
        Self {
            registry,
            absence_threshold: config.absence_threshold.max(1),
            query_timeout: config.query_timeout,
            refreshing: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn refresh(&self, control: &ControlConnectionManager) -> Result<ReconcileReport> {
        let connection = control
            .connection()
            .ok_or_else(|| TopologyError::skipped("no control connection"))?;
        self.reconcile(connection.as_ref()).await
    }

    pub async fn reconcile(&self, connection: &dyn Connection) -> Result<ReconcileReport> {
        let _refreshing = self.refreshing.lock().await;
        let address = connection.address();
        let rows = match tokio::time::timeout(self.query_timeout, connection.topology()).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(error)) => {
                let reason = format!("peer query on {} failed: {:#}", address, error);
                return Err(TopologyError::skipped(reason));
            }
            Err(_) => {
                return Err(TopologyError::skipped(format!("peer query on {} timed out", address)));
            }
        };
        let mut report = ReconcileReport::default();
        for row in &rows {
            let token = row.identity_token.clone();
            match self.registry.upsert_peer(row.address, token, row.reachable) {
                UpsertOutcome::Added(host) => report.added.push(host),
                UpsertOutcome::Refreshed(_) => report.refreshed += 1,
                UpsertOutcome::Replaced { retired, current } => {
                    report.replaced.push((retired, current))
                }
            }
        }
        if rows.is_empty() {
            // every reporter lists itself, an empty table says nothing about absences
            warn!("peer query on {} returned no rows", address);
        } else {
            let seen = seen_addresses(rows.iter().map(|row| &row.address));
            report.retired = self.registry.record_absences(&seen, self.absence_threshold);
        }
        if report.is_quiet() {
            trace!("reconciled {} peers from {}", rows.len(), address);
        } else {
            debug!(
                "reconciled {} peers from {}: {} added, {} replaced, {} retired",
                rows.len(),
                address,
                report.added.len(),
                report.replaced.len(),
                report.retired.len()
            );
        }
        Ok(report)
    }

    pub fn spawn_periodic(
        self: &Arc<Self>,
        control: ControlConnectionManager,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(error) = reconciler.refresh(&control).await {
                    debug!("{}", error);
                }
            }
            trace!("periodic reconciliation stopped");
        })
    }
}
