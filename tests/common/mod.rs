//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use cfdi_coord::collab::{
    BranchStore, ChannelNotifier, MemoryStore, Notification, PacClient, PacStamp, Prober,
    StoreState,
};
use cfdi_coord::common::{Balancing, BranchWeight, Config, GroupConfig};
use cfdi_coord::coordinator::{Branch, BranchStatus, Certificate, SeriesRange};
use cfdi_coord::{Collaborators, Coordinator, Error, Result};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// PAC double: records every call, fails or stalls per branch on demand
#[derive(Default)]
pub struct ScriptedPac {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    issued: AtomicU64,
}

impl ScriptedPac {
    pub fn fail(&self, branch: &str) {
        self.failing.lock().unwrap().insert(branch.to_string());
    }

    pub fn recover(&self, branch: &str) {
        self.failing.lock().unwrap().remove(branch);
    }

    pub fn delay(&self, branch: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(branch.to_string(), delay);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PacClient for ScriptedPac {
    async fn stamp(
        &self,
        branch: &Branch,
        _certificate: &Certificate,
        payload: &[u8],
        _timeout: Duration,
    ) -> Result<PacStamp> {
        self.calls.lock().unwrap().push(branch.code.clone());
        let delay = self.delays.lock().unwrap().get(&branch.code).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(&branch.code) {
            return Err(Error::Pac("CFDI40102 service rejected the document".into()));
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PacStamp {
            uuid: format!("5FB2822E-{}-{:06}", branch.code, n),
            signed_document: Bytes::copy_from_slice(payload),
        })
    }
}

/// Prober whose answer per branch is set by the test
#[derive(Default)]
pub struct SetProber {
    down: Mutex<HashSet<String>>,
}

impl SetProber {
    pub fn set_down(&self, branch: &str) {
        self.down.lock().unwrap().insert(branch.to_string());
    }

    pub fn set_up(&self, branch: &str) {
        self.down.lock().unwrap().remove(branch);
    }
}

#[async_trait]
impl Prober for SetProber {
    async fn probe(&self, branch: &Branch) -> Result<()> {
        if self.down.lock().unwrap().contains(&branch.code) {
            Err(Error::BranchUnavailable(branch.code.clone()))
        } else {
            Ok(())
        }
    }
}

pub fn branch(code: &str) -> Branch {
    Branch {
        code: code.into(),
        name: format!("Sucursal {}", code),
        company: "EKU9003173C9".into(),
        is_primary: false,
        status: BranchStatus::Active,
        coordination_group: String::new(),
        endpoint: format!("https://pac.example/{}", code.to_lowercase()),
        regions: vec![],
        certificates: vec![],
        series: vec![SeriesRange {
            series: "A".into(),
            limit: 100_000,
        }],
        thresholds: None,
    }
}

pub fn cert(serial: &str, branch: &str, days_left: i64) -> Certificate {
    Certificate {
        serial: serial.into(),
        branch: branch.into(),
        not_before: Utc::now() - ChronoDuration::days(200),
        not_after: Utc::now() + ChronoDuration::days(days_left),
        revoked: false,
    }
}

/// Store with each branch holding one certificate valid for a year
pub fn state_with(codes: &[&str]) -> StoreState {
    codes.iter().fold(StoreState::default(), |state, code| {
        state
            .with_branch(branch(code))
            .with_certificate(cert(&format!("0000100000050{}", code), code, 365))
    })
}

pub fn ordered_group(id: &str, primary: &str, backups: &[&str]) -> GroupConfig {
    let mut members = vec![primary.to_string()];
    members.extend(backups.iter().map(|b| b.to_string()));
    GroupConfig {
        id: id.into(),
        members,
        primary: Some(primary.into()),
        backups: backups.iter().map(|b| b.to_string()).collect(),
        balancing: Balancing::Ordered,
        weights: vec![],
    }
}

pub fn weighted_group(id: &str, weights: &[(&str, u32)]) -> GroupConfig {
    GroupConfig {
        id: id.into(),
        members: weights.iter().map(|(b, _)| b.to_string()).collect(),
        primary: None,
        backups: vec![],
        balancing: Balancing::Weighted,
        weights: weights
            .iter()
            .map(|(b, w)| BranchWeight {
                branch: b.to_string(),
                weight: *w,
            })
            .collect(),
    }
}

pub fn config_with(groups: Vec<GroupConfig>) -> Config {
    let mut config = Config::default();
    config.groups = groups;
    config
}

pub struct Harness {
    pub coord: Coordinator,
    pub store: Arc<MemoryStore>,
    pub pac: Arc<ScriptedPac>,
    pub prober: Arc<SetProber>,
    pub events: UnboundedReceiver<Notification>,
}

impl Harness {
    pub fn new(config: Config, state: StoreState) -> Self {
        let store = Arc::new(MemoryStore::new(state));
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: Arc<MemoryStore>) -> Self {
        let pac = Arc::new(ScriptedPac::default());
        let prober = Arc::new(SetProber::default());
        let (notifier, events) = ChannelNotifier::new();
        let coord = Coordinator::new(
            config,
            Collaborators {
                store: store.clone(),
                prober: prober.clone(),
                pac: pac.clone(),
                notifier: Arc::new(notifier),
            },
        )
        .expect("coordinator");
        Self {
            coord,
            store,
            pac,
            prober,
            events,
        }
    }

    /// Probe every branch once; down branches start unavailable
    pub async fn probe(&self) {
        self.coord.probe_all().await;
    }

    pub fn counter(&self, branch: &str, series: &str) -> u64 {
        self.store.load_folio_counter(branch, series).unwrap()
    }

    pub fn drain_events(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
