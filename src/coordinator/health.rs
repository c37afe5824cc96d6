//! Branch health monitor
//!
//! Keeps one `HealthRecord` per branch, rebuilt from probes after every
//! restart. Availability changes only after `failure_threshold` consecutive
//! failures or `recovery_threshold` consecutive successes. A branch without
//! a record is unknown, which consumers treat as unavailable.

use crate::collab::notify::{Notification, Notifier};
use crate::collab::probe::Prober;
use crate::common::{CoordinatorMetrics, HealthConfig};
use crate::coordinator::branch::Branch;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRecord {
    pub branch: String,
    pub last_probe: DateTime<Utc>,
    pub latency: Option<Duration>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub available: bool,
}

/// Result of one connectivity check (or a failure reported by a stamping attempt)
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub branch: String,
    /// When the probe was started; orders racing completions
    pub started_at: DateTime<Utc>,
    pub latency: Option<Duration>,
    pub success: bool,
}

impl ProbeOutcome {
    pub fn success(branch: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            branch: branch.into(),
            started_at,
            latency: None,
            success: true,
        }
    }

    pub fn failure(branch: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            branch: branch.into(),
            started_at,
            latency: None,
            success: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    None,
    BecameUnavailable(u32),
    Recovered,
}

pub struct HealthMonitor {
    config: RwLock<HealthConfig>,
    records: RwLock<HashMap<String, HealthRecord>>,
    prober: Arc<dyn Prober>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<CoordinatorMetrics>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        prober: Arc<dyn Prober>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            records: RwLock::new(HashMap::new()),
            prober,
            notifier,
            metrics,
        }
    }

    pub fn config(&self) -> HealthConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_config(&self, config: HealthConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Probe one branch with the configured timeout and fold the result in.
    /// Timeouts and prober errors count as failures; this never fails.
    pub async fn probe(&self, branch: &Branch) -> HealthRecord {
        let timeout = self.config().probe_timeout;
        let started_at = Utc::now();
        let start = Instant::now();

        let success = match tokio::time::timeout(timeout, self.prober.probe(branch)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(branch = %branch.code, "probe failed: {}", e);
                false
            }
            Err(_) => {
                tracing::debug!(branch = %branch.code, "probe timed out after {:?}", timeout);
                false
            }
        };

        if success {
            self.metrics.probe_successes.inc();
        } else {
            self.metrics.probe_failures.inc();
        }

        self.record(ProbeOutcome {
            branch: branch.code.clone(),
            started_at,
            latency: Some(start.elapsed()),
            success,
        })
    }

    /// Apply an outcome with hysteresis and return the branch's current record.
    /// Outcomes started before the last applied one are discarded.
    pub fn record(&self, outcome: ProbeOutcome) -> HealthRecord {
        let (failure_threshold, recovery_threshold) = {
            let cfg = self.config.read().unwrap_or_else(PoisonError::into_inner);
            (cfg.failure_threshold, cfg.recovery_threshold)
        };

        let (record, transition, available_count) = {
            let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
            let mut transition = Transition::None;

            match records.get_mut(&outcome.branch) {
                None => {
                    // first observation decides the initial state
                    let record = HealthRecord {
                        branch: outcome.branch.clone(),
                        last_probe: outcome.started_at,
                        latency: outcome.latency,
                        consecutive_failures: u32::from(!outcome.success),
                        consecutive_successes: u32::from(outcome.success),
                        available: outcome.success,
                    };
                    // never available, so nothing was lost: no notification
                    if !outcome.success {
                        tracing::info!(branch = %outcome.branch, "branch unreachable on first probe");
                    }
                    records.insert(outcome.branch.clone(), record);
                }
                Some(rec) if outcome.started_at < rec.last_probe => {
                    tracing::trace!(branch = %outcome.branch, "discarding stale probe result");
                }
                Some(rec) => {
                    rec.last_probe = outcome.started_at;
                    if outcome.latency.is_some() {
                        rec.latency = outcome.latency;
                    }
                    if outcome.success {
                        rec.consecutive_failures = 0;
                        rec.consecutive_successes = rec.consecutive_successes.saturating_add(1);
                        if !rec.available && rec.consecutive_successes >= recovery_threshold {
                            rec.available = true;
                            transition = Transition::Recovered;
                        }
                    } else {
                        rec.consecutive_successes = 0;
                        rec.consecutive_failures = rec.consecutive_failures.saturating_add(1);
                        if rec.available && rec.consecutive_failures >= failure_threshold {
                            rec.available = false;
                            transition = Transition::BecameUnavailable(rec.consecutive_failures);
                        }
                    }
                }
            }

            let available_count = records.values().filter(|r| r.available).count() as u64;
            // the branch key was inserted above if it was missing
            let record = records.get(&outcome.branch).cloned();
            (record, transition, available_count)
        };

        self.metrics.available_branches.set(available_count);

        match transition {
            Transition::BecameUnavailable(failures) => {
                tracing::warn!(branch = %outcome.branch, failures, "branch marked unavailable");
                self.notifier.notify(Notification::BranchUnavailable {
                    branch: outcome.branch.clone(),
                    consecutive_failures: failures,
                });
            }
            Transition::Recovered => {
                tracing::info!(branch = %outcome.branch, "branch available again");
                self.notifier.notify(Notification::BranchRecovered {
                    branch: outcome.branch.clone(),
                });
            }
            Transition::None => {}
        }

        record.unwrap_or(HealthRecord {
            branch: outcome.branch,
            last_probe: outcome.started_at,
            latency: outcome.latency,
            consecutive_failures: 0,
            consecutive_successes: 0,
            available: false,
        })
    }

    /// Count a failed stamping attempt against the branch
    pub fn mark_degraded(&self, branch: &str) -> HealthRecord {
        self.metrics.probe_failures.inc();
        self.record(ProbeOutcome::failure(branch, Utc::now()))
    }

    /// Last computed availability; unknown branches are unavailable
    pub fn is_available(&self, branch: &str) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(branch)
            .map(|r| r.available)
            .unwrap_or(false)
    }

    pub fn record_for(&self, branch: &str) -> Option<HealthRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(branch)
            .cloned()
    }

    pub fn snapshot(&self) -> Vec<HealthRecord> {
        let mut out: Vec<HealthRecord> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        out.sort_by(|a, b| a.branch.cmp(&b.branch));
        out
    }

    /// Drop records for branches no longer configured
    pub fn retain(&self, branches: &[String]) {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        records.retain(|code, _| branches.contains(code));
        let available = records.values().filter(|r| r.available).count() as u64;
        drop(records);
        self.metrics.available_branches.set(available);
    }

    /// Spawn one probe loop per branch. Loops stop once `shutdown` flips to true.
    pub fn spawn(
        self: &Arc<Self>,
        branches: Vec<Branch>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let cfg = self.config();
        let jitter_ms = cfg.startup_jitter.as_millis() as u64;
        let mut rng = rand::thread_rng();

        branches
            .into_iter()
            .map(|branch| {
                let monitor = Arc::clone(self);
                let mut shutdown = shutdown.clone();
                let initial_delay = if jitter_ms == 0 {
                    Duration::ZERO
                } else {
                    Duration::from_millis(rng.gen_range(0..=jitter_ms))
                };
                let interval = cfg.interval;

                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(initial_delay) => {}
                        _ = shutdown.changed() => return,
                    }
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {
                                let record = monitor.probe(&branch).await;
                                tracing::trace!(
                                    branch = %branch.code,
                                    available = record.available,
                                    "probe cycle"
                                );
                            }
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    tracing::debug!(branch = %branch.code, "probe loop stopped");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::notify::ChannelNotifier;
    use crate::common::{Error, Result};
    use crate::coordinator::branch::BranchStatus;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct SwitchProber {
        up: AtomicBool,
        hang: AtomicBool,
    }

    #[async_trait]
    impl Prober for SwitchProber {
        async fn probe(&self, branch: &Branch) -> Result<()> {
            if self.hang.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::BranchUnavailable(branch.code.clone()))
            }
        }
    }

    fn monitor() -> (
        HealthMonitor,
        tokio::sync::mpsc::UnboundedReceiver<Notification>,
    ) {
        let (notifier, rx) = ChannelNotifier::new();
        let prober = Arc::new(SwitchProber {
            up: AtomicBool::new(true),
            hang: AtomicBool::new(false),
        });
        let mon = HealthMonitor::new(
            HealthConfig::default(),
            prober,
            Arc::new(notifier),
            Arc::new(CoordinatorMetrics::new()),
        );
        (mon, rx)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_unknown_branch_is_unavailable() {
        let (mon, _rx) = monitor();
        assert!(!mon.is_available("MTY"));
        assert!(mon.record_for("MTY").is_none());
    }

    #[test]
    fn test_hysteresis() {
        let (mon, mut rx) = monitor();
        mon.record(ProbeOutcome::success("MTY", at(0)));
        assert!(mon.is_available("MTY"));

        // two failures are not enough
        mon.record(ProbeOutcome::failure("MTY", at(30)));
        mon.record(ProbeOutcome::failure("MTY", at(60)));
        assert!(mon.is_available("MTY"));

        // a single success resets the failure streak
        mon.record(ProbeOutcome::success("MTY", at(90)));
        mon.record(ProbeOutcome::failure("MTY", at(120)));
        mon.record(ProbeOutcome::failure("MTY", at(150)));
        assert!(mon.is_available("MTY"));

        let rec = mon.record(ProbeOutcome::failure("MTY", at(180)));
        assert!(!rec.available);
        assert_eq!(rec.consecutive_failures, 3);

        // one success does not restore it
        mon.record(ProbeOutcome::success("MTY", at(210)));
        assert!(!mon.is_available("MTY"));
        mon.record(ProbeOutcome::failure("MTY", at(240)));
        mon.record(ProbeOutcome::success("MTY", at(270)));
        assert!(!mon.is_available("MTY"));
        mon.record(ProbeOutcome::success("MTY", at(300)));
        assert!(mon.is_available("MTY"));

        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::BranchUnavailable {
                branch: "MTY".into(),
                consecutive_failures: 3
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::BranchRecovered {
                branch: "MTY".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_first_failed_probe_is_not_notified() {
        let (mon, mut rx) = monitor();
        mon.record(ProbeOutcome::failure("MTY", at(0)));
        mon.record(ProbeOutcome::failure("MTY", at(30)));
        mon.record(ProbeOutcome::failure("MTY", at(60)));
        assert!(!mon.is_available("MTY"));
        assert!(rx.try_recv().is_err());

        mon.record(ProbeOutcome::success("MTY", at(90)));
        mon.record(ProbeOutcome::success("MTY", at(120)));
        assert_eq!(
            rx.try_recv().unwrap(),
            Notification::BranchRecovered {
                branch: "MTY".into()
            }
        );
    }

    #[test]
    fn test_stale_outcome_discarded() {
        let (mon, _rx) = monitor();
        mon.record(ProbeOutcome::success("GDL", at(100)));
        let rec = mon.record(ProbeOutcome::failure("GDL", at(50)));
        assert_eq!(rec.last_probe, at(100));
        assert_eq!(rec.consecutive_failures, 0);
        assert_eq!(rec.consecutive_successes, 1);
    }

    #[test]
    fn test_mark_degraded_feeds_failure_count() {
        let (mon, _rx) = monitor();
        mon.record(ProbeOutcome::success("GDL", at(0)));
        for _ in 0..3 {
            mon.mark_degraded("GDL");
        }
        assert!(!mon.is_available("GDL"));
    }

    #[tokio::test]
    async fn test_probe_timeout_counts_as_failure() {
        let (notifier, _rx) = ChannelNotifier::new();
        let prober = Arc::new(SwitchProber {
            up: AtomicBool::new(true),
            hang: AtomicBool::new(true),
        });
        let mon = HealthMonitor::new(
            HealthConfig {
                probe_timeout: Duration::from_millis(50),
                ..HealthConfig::default()
            },
            prober,
            Arc::new(notifier),
            Arc::new(CoordinatorMetrics::new()),
        );
        let branch = Branch {
            code: "TIJ".into(),
            name: "Tijuana".into(),
            company: "EKU9003173C9".into(),
            is_primary: false,
            status: BranchStatus::Active,
            coordination_group: "g".into(),
            endpoint: "http://pac.local/tij".into(),
            regions: vec![],
            certificates: vec![],
            series: vec![],
            thresholds: None,
        };
        let rec = mon.probe(&branch).await;
        assert!(!rec.available);
        assert_eq!(rec.consecutive_failures, 1);
    }
}
