//! Failover coordinator
//!
//! Drives one stamping request through
//! `Selecting -> Reserving -> Stamping -> {Committed | Retrying | Failed}`.
//! Every transition goes through [`StampAttempt::advance`], which rejects
//! anything outside the transition table.
//!
//! A failed PAC call releases the folio (the number stays burned), counts
//! against the branch's health and moves on to the next candidate, up to
//! `max_attempts` PAC dispatches. Requests are deduplicated by id: a
//! committed request is answered from the cache without touching the
//! sequencer or the PAC again.

use crate::collab::pac::PacClient;
use crate::common::{
    payload_fingerprint, CoordinatorMetrics, Error, FailoverConfig, RejectReason, Rejection, Result,
};
use crate::coordinator::folio::FolioSequencer;
use crate::coordinator::health::HealthMonitor;
use crate::coordinator::selection::{SelectionEngine, StampRequest, Topology};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StampPhase {
    Selecting,
    Reserving,
    Stamping,
    Retrying,
    Committed,
    Failed,
}

impl StampPhase {
    pub fn can_transition_to(self, next: StampPhase) -> bool {
        use StampPhase::*;
        matches!(
            (self, next),
            (Selecting, Reserving)
                | (Selecting, Failed)
                | (Reserving, Stamping)
                | (Reserving, Retrying)
                | (Reserving, Failed)
                | (Stamping, Committed)
                | (Stamping, Retrying)
                | (Stamping, Failed)
                | (Retrying, Reserving)
                | (Retrying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, StampPhase::Committed | StampPhase::Failed)
    }
}

impl std::fmt::Display for StampPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StampPhase::Selecting => "selecting",
            StampPhase::Reserving => "reserving",
            StampPhase::Stamping => "stamping",
            StampPhase::Retrying => "retrying",
            StampPhase::Committed => "committed",
            StampPhase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// State machine of a single request
#[derive(Debug, Clone)]
pub struct StampAttempt {
    request_id: String,
    phase: StampPhase,
    history: Vec<StampPhase>,
}

impl StampAttempt {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            phase: StampPhase::Selecting,
            history: vec![StampPhase::Selecting],
        }
    }

    pub fn phase(&self) -> StampPhase {
        self.phase
    }

    pub fn history(&self) -> &[StampPhase] {
        &self.history
    }

    pub fn advance(&mut self, next: StampPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::Internal(format!(
                "request {}: illegal transition {} -> {}",
                self.request_id, self.phase, next
            )));
        }
        tracing::debug!(request_id = %self.request_id, from = %self.phase, to = %next, "transition");
        self.phase = next;
        self.history.push(next);
        Ok(())
    }
}

/// Cooperative cancellation flag shared with the caller
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A committed stamping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StampResult {
    pub request_id: String,
    pub branch: String,
    pub certificate_serial: String,
    pub series: String,
    pub folio: u64,
    /// Fiscal UUID assigned by the PAC
    pub uuid: String,
    pub signed_document: Bytes,
    /// Branches that failed before the committing one
    pub attempts: Vec<Rejection>,
    pub stamped_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum DedupState {
    InFlight,
    Committed {
        result: Box<StampResult>,
        /// `None` when the TTL reaches past what `Instant` can represent
        expires_at: Option<Instant>,
    },
}

fn is_live(expires_at: Option<Instant>, now: Instant) -> bool {
    expires_at.map_or(true, |at| at > now)
}

#[derive(Debug, Clone)]
struct DedupEntry {
    fingerprint: String,
    state: DedupState,
}

type DedupMap = Arc<Mutex<HashMap<String, DedupEntry>>>;

/// Request-id ledger; committed results live for the configured TTL
#[derive(Debug, Clone, Default)]
pub struct DedupCache {
    entries: DedupMap,
}

pub enum DedupStart {
    /// Not seen before; the guard clears the in-flight mark unless completed
    Fresh(InFlightGuard),
    Replay(Box<StampResult>),
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, request_id: &str, fingerprint: &str) -> Result<DedupStart> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some(entry) = entries.get(request_id) {
            match &entry.state {
                DedupState::InFlight => {
                    return Err(Error::RequestInFlight(request_id.to_string()));
                }
                DedupState::Committed { result, expires_at } if is_live(*expires_at, now) => {
                    if entry.fingerprint != fingerprint {
                        return Err(Error::RequestConflict(request_id.to_string()));
                    }
                    return Ok(DedupStart::Replay(result.clone()));
                }
                DedupState::Committed { .. } => {}
            }
        }
        entries.insert(
            request_id.to_string(),
            DedupEntry {
                fingerprint: fingerprint.to_string(),
                state: DedupState::InFlight,
            },
        );
        Ok(DedupStart::Fresh(InFlightGuard {
            entries: Arc::clone(&self.entries),
            request_id: request_id.to_string(),
            done: false,
        }))
    }

    /// Drop committed entries past their TTL
    pub fn purge(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| match e.state {
            DedupState::InFlight => true,
            DedupState::Committed { expires_at, .. } => is_live(expires_at, now),
        });
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct InFlightGuard {
    entries: DedupMap,
    request_id: String,
    done: bool,
}

impl InFlightGuard {
    pub fn complete(mut self, result: &StampResult, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&self.request_id) {
            entry.state = DedupState::Committed {
                result: Box::new(result.clone()),
                expires_at: Instant::now().checked_add(ttl),
            };
        }
        drop(entries);
        self.done = true;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // failed or cancelled: forget the id so the caller may retry
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(
            entries.get(&self.request_id).map(|e| &e.state),
            Some(DedupState::InFlight)
        ) {
            entries.remove(&self.request_id);
        }
    }
}

pub struct FailoverCoordinator {
    config: RwLock<FailoverConfig>,
    selection: Arc<SelectionEngine>,
    folios: Arc<FolioSequencer>,
    health: Arc<HealthMonitor>,
    pac: Arc<dyn PacClient>,
    dedup: DedupCache,
    metrics: Arc<CoordinatorMetrics>,
}

impl FailoverCoordinator {
    pub fn new(
        config: FailoverConfig,
        selection: Arc<SelectionEngine>,
        folios: Arc<FolioSequencer>,
        health: Arc<HealthMonitor>,
        pac: Arc<dyn PacClient>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            selection,
            folios,
            health,
            pac,
            dedup: DedupCache::new(),
            metrics,
        }
    }

    pub fn set_config(&self, config: FailoverConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    pub fn dedup(&self) -> &DedupCache {
        &self.dedup
    }

    fn cancelled(&self, request: &StampRequest, attempts: Vec<Rejection>) -> Error {
        self.metrics.requests_failed.inc();
        tracing::info!(request_id = %request.request_id, "request cancelled");
        Error::Cancelled {
            request_id: request.request_id.clone(),
            attempts,
        }
    }

    /// Run `request` to a terminal state.
    ///
    /// Cancellation is honoured up to the PAC dispatch; a call already in
    /// flight is allowed to finish and a successful stamp is still committed.
    pub async fn execute(
        &self,
        topology: &Topology,
        request: &StampRequest,
        cancel: &CancelSignal,
    ) -> Result<StampResult> {
        let cfg = self
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let fingerprint = payload_fingerprint(&request.payload);
        let guard = match self.dedup.begin(&request.request_id, &fingerprint)? {
            DedupStart::Replay(result) => {
                self.metrics.requests_deduplicated.inc();
                tracing::info!(
                    request_id = %request.request_id,
                    folio = result.folio,
                    "returning committed result for duplicate request"
                );
                return Ok(*result);
            }
            DedupStart::Fresh(guard) => guard,
        };

        let mut attempt = StampAttempt::new(&request.request_id);
        let mut chain: Vec<Rejection> = Vec::new();

        if cancel.is_cancelled() {
            attempt.advance(StampPhase::Failed)?;
            return Err(self.cancelled(request, chain));
        }

        let selection = match self.selection.select(topology, request, Utc::now()) {
            Ok(s) => s,
            Err(e) => {
                attempt.advance(StampPhase::Failed)?;
                self.metrics.requests_failed.inc();
                return Err(e);
            }
        };
        chain.extend(selection.rejections);

        let mut dispatched = 0usize;
        for candidate in selection.candidates {
            if dispatched >= cfg.max_attempts {
                tracing::warn!(
                    request_id = %request.request_id,
                    max_attempts = cfg.max_attempts,
                    "attempt limit reached"
                );
                break;
            }
            attempt.advance(StampPhase::Reserving)?;
            let code = candidate.branch.code.clone();

            if cancel.is_cancelled() {
                attempt.advance(StampPhase::Failed)?;
                return Err(self.cancelled(request, chain));
            }

            // health may have changed since selection
            if !self.health.is_available(&code) {
                chain.push(Rejection::new(&code, RejectReason::Unavailable));
                attempt.advance(StampPhase::Retrying)?;
                continue;
            }

            let mut reservation = match self.folios.reserve(&candidate.branch, &request.series) {
                Ok(r) => r,
                Err(e) if e.is_branch_local() => {
                    tracing::warn!(request_id = %request.request_id, branch = %code, "reservation refused: {}", e);
                    chain.push(Rejection::new(&code, e.reject_reason()));
                    attempt.advance(StampPhase::Retrying)?;
                    continue;
                }
                Err(e) => {
                    attempt.advance(StampPhase::Failed)?;
                    self.metrics.requests_failed.inc();
                    return Err(e);
                }
            };

            if cancel.is_cancelled() {
                if let Err(e) = self.folios.release(&mut reservation) {
                    tracing::error!(branch = %code, folio = reservation.number, "release failed: {}", e);
                }
                attempt.advance(StampPhase::Failed)?;
                return Err(self.cancelled(request, chain));
            }

            attempt.advance(StampPhase::Stamping)?;
            dispatched += 1;
            let started = Instant::now();
            let outcome = tokio::time::timeout(
                cfg.stamp_timeout,
                self.pac.stamp(
                    &candidate.branch,
                    &candidate.certificate,
                    &request.payload,
                    cfg.stamp_timeout,
                ),
            )
            .await;
            let elapsed = started.elapsed();

            let reason = match outcome {
                Ok(Ok(stamp)) => {
                    if let Err(e) = self.folios.commit(&mut reservation) {
                        // the document is stamped; report it rather than lose it
                        tracing::error!(branch = %code, folio = reservation.number, "commit failed: {}", e);
                    }
                    attempt.advance(StampPhase::Committed)?;
                    self.metrics.record_stamp(&code, elapsed, true);
                    self.metrics.requests_committed.inc();

                    let result = StampResult {
                        request_id: request.request_id.clone(),
                        branch: code.clone(),
                        certificate_serial: candidate.certificate.serial.clone(),
                        series: request.series.clone(),
                        folio: reservation.number,
                        uuid: stamp.uuid,
                        signed_document: stamp.signed_document,
                        attempts: chain,
                        stamped_at: Utc::now(),
                    };
                    guard.complete(&result, cfg.dedup_ttl);
                    tracing::info!(
                        request_id = %request.request_id,
                        branch = %code,
                        series = %request.series,
                        folio = result.folio,
                        uuid = %result.uuid,
                        "stamp committed"
                    );
                    return Ok(result);
                }
                Ok(Err(e)) => e.reject_reason(),
                Err(_) => RejectReason::Timeout,
            };

            if let Err(e) = self.folios.release(&mut reservation) {
                tracing::error!(branch = %code, folio = reservation.number, "release failed: {}", e);
            }
            self.health.mark_degraded(&code);
            self.metrics.record_stamp(&code, elapsed, false);
            tracing::warn!(
                request_id = %request.request_id,
                branch = %code,
                folio = reservation.number,
                %reason,
                "stamping attempt failed"
            );
            chain.push(Rejection::new(&code, reason));

            if cancel.is_cancelled() {
                attempt.advance(StampPhase::Failed)?;
                return Err(self.cancelled(request, chain));
            }
            attempt.advance(StampPhase::Retrying)?;
            self.metrics.failovers.inc();
        }

        attempt.advance(StampPhase::Failed)?;
        self.metrics.requests_failed.inc();
        tracing::warn!(
            request_id = %request.request_id,
            attempts = dispatched,
            "request failed"
        );
        if dispatched == 0 {
            Err(Error::NoEligibleBranch {
                request_id: request.request_id.clone(),
                rejections: chain,
            })
        } else {
            Err(Error::StampingFailed {
                request_id: request.request_id.clone(),
                attempts: chain,
            })
        }
    }
}
