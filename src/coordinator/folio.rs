//! Folio sequencer
//!
//! The only writer of branch folio counters. Each (branch, series) pair has
//! its own mutex; inside it the counter is read from the store, incremented
//! and persisted before the number is handed out, so a number is burned the
//! moment it is reserved. Released numbers are never issued again.

use crate::collab::notify::{Notification, Notifier, ThresholdLevel};
use crate::collab::store::BranchStore;
use crate::common::{CoordinatorMetrics, Error, FolioConfig, Result};
use crate::coordinator::branch::{Branch, FolioThresholds};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Reserved,
    Committed,
    Released,
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationState::Reserved => write!(f, "reserved"),
            ReservationState::Committed => write!(f, "committed"),
            ReservationState::Released => write!(f, "released"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolioReservation {
    pub branch: String,
    pub series: String,
    pub number: u64,
    pub state: ReservationState,
    pub reserved_at: DateTime<Utc>,
}

type SeriesKey = (String, String);
type ReservationKey = (String, String, u64);

/// Per-series critical section
#[derive(Debug, Default)]
struct SeriesSlot {
    /// Highest number handed out by this process, to detect a store that went backwards
    last_issued: Option<u64>,
    /// Exhaustion already reported; cleared once the series issues again
    exhausted_notified: bool,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    state: ReservationState,
    settled_at: Option<DateTime<Utc>>,
}

pub struct FolioSequencer {
    store: Arc<dyn BranchStore>,
    slots: Mutex<HashMap<SeriesKey, Arc<Mutex<SeriesSlot>>>>,
    ledger: Mutex<HashMap<ReservationKey, LedgerEntry>>,
    defaults: RwLock<FolioConfig>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<CoordinatorMetrics>,
}

impl FolioSequencer {
    pub fn new(
        store: Arc<dyn BranchStore>,
        defaults: FolioConfig,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
            ledger: Mutex::new(HashMap::new()),
            defaults: RwLock::new(defaults),
            notifier,
            metrics,
        }
    }

    pub fn set_defaults(&self, defaults: FolioConfig) {
        *self.defaults.write().unwrap_or_else(PoisonError::into_inner) = defaults;
    }

    fn thresholds_for(&self, branch: &Branch) -> FolioThresholds {
        branch.thresholds.unwrap_or_else(|| {
            let d = self.defaults.read().unwrap_or_else(PoisonError::into_inner);
            FolioThresholds {
                warning: d.warning_remaining,
                critical: d.critical_remaining,
            }
        })
    }

    fn slot(&self, branch: &str, series: &str) -> Arc<Mutex<SeriesSlot>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .entry((branch.to_string(), series.to_string()))
            .or_default()
            .clone()
    }

    /// Issue the next number for (branch, series).
    ///
    /// Fails with `ThresholdExceeded` when the series has no capacity left;
    /// callers treat that as "branch ineligible", not as retryable.
    pub fn reserve(&self, branch: &Branch, series: &str) -> Result<FolioReservation> {
        let slot = self.slot(&branch.code, series);
        let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.store.load_folio_counter(&branch.code, series)?;
        if let Some(last) = slot.last_issued {
            if current < last {
                return Err(Error::Store(format!(
                    "{}/{} counter regressed from {} to {}",
                    branch.code, series, last, current
                )));
            }
        }

        let limit = branch.series_limit(series);
        let remaining_before = limit.map(|l| l as i64 - current as i64);
        let next = current.checked_add(1);

        if remaining_before.is_some_and(|r| r <= 0) || next.is_none() {
            let remaining = remaining_before.unwrap_or(0);
            let first_refusal = !std::mem::replace(&mut slot.exhausted_notified, true);
            drop(slot);
            self.metrics.threshold_rejections.inc();
            if first_refusal {
                tracing::warn!(branch = %branch.code, series, remaining, "folio capacity exhausted");
                self.notifier.notify(Notification::FolioThreshold {
                    branch: branch.code.clone(),
                    series: series.to_string(),
                    remaining,
                    level: ThresholdLevel::Exhausted,
                });
            } else {
                tracing::debug!(branch = %branch.code, series, "folio series still exhausted");
            }
            return Err(Error::ThresholdExceeded {
                branch: branch.code.clone(),
                series: series.to_string(),
                remaining,
            });
        }
        let number = next.unwrap_or(current);

        self.store
            .persist_folio_counter(&branch.code, series, number)?;
        slot.last_issued = Some(number);
        slot.exhausted_notified = false;
        drop(slot);

        let reservation = FolioReservation {
            branch: branch.code.clone(),
            series: series.to_string(),
            number,
            state: ReservationState::Reserved,
            reserved_at: Utc::now(),
        };
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (branch.code.clone(), series.to_string(), number),
                LedgerEntry {
                    state: ReservationState::Reserved,
                    settled_at: None,
                },
            );
        self.metrics.folios_reserved.inc();
        tracing::debug!(branch = %branch.code, series, folio = number, "folio reserved");

        if let (Some(before), Some(limit)) = (remaining_before, limit) {
            let after = limit as i64 - number as i64;
            self.check_thresholds(branch, series, before, after);
        }

        Ok(reservation)
    }

    fn check_thresholds(&self, branch: &Branch, series: &str, before: i64, after: i64) {
        let marks = self.thresholds_for(branch);
        let crossed = |mark: u64| before > mark as i64 && after <= mark as i64;

        let level = if crossed(marks.critical) {
            Some(ThresholdLevel::Critical)
        } else if crossed(marks.warning) {
            Some(ThresholdLevel::Warning)
        } else {
            None
        };

        if let Some(level) = level {
            tracing::warn!(branch = %branch.code, series, remaining = after, ?level, "folio threshold crossed");
            self.notifier.notify(Notification::FolioThreshold {
                branch: branch.code.clone(),
                series: series.to_string(),
                remaining: after,
                level,
            });
        }
    }

    /// Mark a reservation committed. Committing twice is a no-op.
    pub fn commit(&self, reservation: &mut FolioReservation) -> Result<()> {
        self.settle(reservation, ReservationState::Committed)?;
        tracing::debug!(
            branch = %reservation.branch,
            series = %reservation.series,
            folio = reservation.number,
            "folio committed"
        );
        Ok(())
    }

    /// Burn a reservation; its number is never reissued. Releasing twice is a no-op.
    pub fn release(&self, reservation: &mut FolioReservation) -> Result<()> {
        let was = reservation.state;
        self.settle(reservation, ReservationState::Released)?;
        if was != ReservationState::Released {
            self.metrics.folios_released.inc();
            tracing::debug!(
                branch = %reservation.branch,
                series = %reservation.series,
                folio = reservation.number,
                "folio released (burned)"
            );
        }
        Ok(())
    }

    fn settle(&self, reservation: &mut FolioReservation, to: ReservationState) -> Result<()> {
        let key = (
            reservation.branch.clone(),
            reservation.series.clone(),
            reservation.number,
        );
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = ledger.get_mut(&key).ok_or_else(|| Error::UnknownReservation {
            branch: reservation.branch.clone(),
            series: reservation.series.clone(),
            number: reservation.number,
        })?;

        match (entry.state, to) {
            (from, to) if from == to => {}
            (ReservationState::Reserved, _) => {
                entry.state = to;
                entry.settled_at = Some(Utc::now());
            }
            (from, to) => {
                return Err(Error::InvalidTransition {
                    branch: reservation.branch.clone(),
                    series: reservation.series.clone(),
                    number: reservation.number,
                    from: from.to_string(),
                    to: to.to_string(),
                })
            }
        }
        reservation.state = entry.state;
        Ok(())
    }

    pub fn state_of(&self, branch: &str, series: &str, number: u64) -> Option<ReservationState> {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(branch.to_string(), series.to_string(), number))
            .map(|e| e.state)
    }

    /// Remaining capacity for a series, `None` when it has no bound
    pub fn remaining(&self, branch: &Branch, series: &str) -> Result<Option<i64>> {
        let current = self.store.load_folio_counter(&branch.code, series)?;
        Ok(branch
            .series_limit(series)
            .map(|limit| limit as i64 - current as i64))
    }

    /// Forget settled reservations older than `retention`; returns how many were dropped
    pub fn purge_settled(&self, retention: Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| Utc::now().checked_sub_signed(r))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        let before = ledger.len();
        ledger.retain(|_, e| e.settled_at.map_or(true, |at| at > cutoff));
        before - ledger.len()
    }
}
