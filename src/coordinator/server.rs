//! Coordinator facade
//!
//! Wires the engine components together, owns the topology snapshot and the
//! background tasks (one probe loop per branch plus a certificate expiry
//! check), and applies configuration reloads.

use crate::collab::notify::{Notification, Notifier};
use crate::collab::pac::PacClient;
use crate::collab::probe::Prober;
use crate::collab::store::BranchStore;
use crate::common::{Config, CoordinatorMetrics, Result};
use crate::coordinator::balancer::LoadBalancer;
use crate::coordinator::branch::{BranchStatus, CertificateStatus};
use crate::coordinator::certificates::CertificateStore;
use crate::coordinator::failover::{CancelSignal, FailoverCoordinator, StampResult};
use crate::coordinator::folio::FolioSequencer;
use crate::coordinator::health::{HealthMonitor, HealthRecord};
use crate::coordinator::selection::{SelectionEngine, StampRequest, Topology};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// External systems the engine talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn BranchStore>,
    pub prober: Arc<dyn Prober>,
    pub pac: Arc<dyn PacClient>,
    pub notifier: Arc<dyn Notifier>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateReport {
    pub serial: String,
    pub not_after: DateTime<Utc>,
    pub status: CertificateStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesReport {
    pub series: String,
    pub limit: u64,
    pub remaining: i64,
}

/// Operational view of one branch
#[derive(Debug, Clone, Serialize)]
pub struct BranchReport {
    pub code: String,
    pub name: String,
    pub group: String,
    pub is_primary: bool,
    pub status: BranchStatus,
    pub available: bool,
    pub certificates: Vec<CertificateReport>,
    pub series: Vec<SeriesReport>,
}

struct Background {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct Coordinator {
    config: RwLock<Config>,
    store: Arc<dyn BranchStore>,
    notifier: Arc<dyn Notifier>,
    topology: RwLock<Arc<Topology>>,
    certificates: Arc<CertificateStore>,
    health: Arc<HealthMonitor>,
    folios: Arc<FolioSequencer>,
    balancer: Arc<LoadBalancer>,
    failover: FailoverCoordinator,
    metrics: Arc<CoordinatorMetrics>,
    background: Mutex<Option<Background>>,
}

impl Coordinator {
    /// Validate `config`, resolve the topology and load certificates.
    /// Nothing is spawned until [`Coordinator::start`].
    pub fn new(config: Config, collab: Collaborators) -> Result<Self> {
        config.validate()?;
        let topology = Topology::build(&config, collab.store.as_ref())?;
        let metrics = Arc::new(CoordinatorMetrics::new());

        let certificates = Arc::new(CertificateStore::new(config.certificates.warning_window()));
        certificates.load(collab.store.as_ref(), &topology.branches())?;

        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            collab.prober.clone(),
            collab.notifier.clone(),
            metrics.clone(),
        ));
        let folios = Arc::new(FolioSequencer::new(
            collab.store.clone(),
            config.folio,
            collab.notifier.clone(),
            metrics.clone(),
        ));
        let balancer = Arc::new(LoadBalancer::new());
        let selection = Arc::new(SelectionEngine::new(
            certificates.clone(),
            health.clone(),
            balancer.clone(),
        ));
        let failover = FailoverCoordinator::new(
            config.failover.clone(),
            selection,
            folios.clone(),
            health.clone(),
            collab.pac.clone(),
            metrics.clone(),
        );

        tracing::info!(
            branches = topology.branch_codes().len(),
            groups = topology.group_ids().len(),
            "coordinator initialized"
        );

        Ok(Self {
            config: RwLock::new(config),
            store: collab.store,
            notifier: collab.notifier,
            topology: RwLock::new(Arc::new(topology)),
            certificates,
            health,
            folios,
            balancer,
            failover,
            metrics,
            background: Mutex::new(None),
        })
    }

    /// Spawn probe loops and the certificate expiry check on the current runtime.
    /// Calling it again replaces the running tasks.
    pub fn start(&self) {
        let (tx, rx) = watch::channel(false);
        let topology = self.topology();
        let interval = self.config().health.interval;

        let mut handles = self.health.spawn(topology.branches(), rx.clone());
        handles.push(self.spawn_expiry_check(interval, rx));

        let previous = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(Background {
                shutdown: tx,
                handles,
            });
        if let Some(prev) = previous {
            // old loops exit on their own once signalled
            let _ = prev.shutdown.send(true);
        }
        tracing::info!(branches = topology.branch_codes().len(), "background tasks started");
    }

    fn spawn_expiry_check(
        &self,
        interval: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let certificates = self.certificates.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for cert in certificates.take_newly_expiring(Utc::now()) {
                            tracing::warn!(
                                branch = %cert.branch,
                                serial = %cert.serial,
                                not_after = %cert.not_after,
                                "certificate expiring soon"
                            );
                            notifier.notify(Notification::CertificateExpiring {
                                branch: cert.branch,
                                serial: cert.serial,
                                not_after: cert.not_after,
                            });
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Stop background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        let background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(bg) = background {
            let _ = bg.shutdown.send(true);
            futures_util::future::join_all(bg.handles).await;
            tracing::info!("coordinator stopped");
        }
    }

    /// Probe every branch once, concurrently
    pub async fn probe_all(&self) -> Vec<HealthRecord> {
        let topology = self.topology();
        let branches = topology.branches();
        futures_util::future::join_all(branches.iter().map(|b| self.health.probe(b))).await
    }

    pub async fn stamp(&self, request: &StampRequest) -> Result<StampResult> {
        self.stamp_with_cancel(request, &CancelSignal::new()).await
    }

    pub async fn stamp_with_cancel(
        &self,
        request: &StampRequest,
        cancel: &CancelSignal,
    ) -> Result<StampResult> {
        let topology = self.topology();
        self.failover.execute(&topology, request, cancel).await
    }

    /// Apply a new configuration. On error the running state is untouched.
    pub fn reload(&self, config: Config) -> Result<()> {
        config.validate()?;
        let topology = Topology::build(&config, self.store.as_ref())?;

        // load swaps only after every branch was read
        self.certificates
            .load(self.store.as_ref(), &topology.branches())?;
        self.certificates
            .set_warning_window(config.certificates.warning_window());

        let codes = topology.branch_codes();
        self.health.set_config(config.health.clone());
        self.health.retain(&codes);
        self.folios.set_defaults(config.folio);
        self.failover.set_config(config.failover.clone());
        self.balancer.retain_groups(&topology.group_ids());

        *self.topology.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(topology);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;

        let running = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if running {
            self.start();
        }
        tracing::info!(branches = codes.len(), "configuration reloaded");
        Ok(())
    }

    /// Drop settled reservations and committed request ids past the dedup TTL
    pub fn purge_expired(&self) -> usize {
        let ttl = self.config().failover.dedup_ttl;
        let reservations = self.folios.purge_settled(ttl);
        let requests = self.failover.dedup().purge();
        tracing::debug!(reservations, requests, "purged expired entries");
        reservations + requests
    }

    pub fn health_snapshot(&self) -> Vec<HealthRecord> {
        self.health.snapshot()
    }

    pub fn branch_report(&self) -> Result<Vec<BranchReport>> {
        let now = Utc::now();
        let topology = self.topology();
        topology
            .branches()
            .into_iter()
            .map(|branch| -> Result<BranchReport> {
                let certificates = self
                    .certificates
                    .statuses(&branch.code, now)
                    .into_iter()
                    .map(|(c, status)| CertificateReport {
                        serial: c.serial,
                        not_after: c.not_after,
                        status,
                    })
                    .collect();
                let series = branch
                    .series
                    .iter()
                    .map(|s| -> Result<SeriesReport> {
                        let remaining = self.folios.remaining(&branch, &s.series)?.unwrap_or(0);
                        Ok(SeriesReport {
                            series: s.series.clone(),
                            limit: s.limit,
                            remaining,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(BranchReport {
                    available: self.health.is_available(&branch.code),
                    code: branch.code.clone(),
                    name: branch.name.clone(),
                    group: branch.coordination_group.clone(),
                    is_primary: branch.is_primary,
                    status: branch.status,
                    certificates,
                    series,
                })
            })
            .collect()
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.topology
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn config(&self) -> Config {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn metrics(&self) -> &Arc<CoordinatorMetrics> {
        &self.metrics
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn certificates(&self) -> &Arc<CertificateStore> {
        &self.certificates
    }

    pub fn folios(&self) -> &Arc<FolioSequencer> {
        &self.folios
    }
}
