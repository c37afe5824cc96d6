//! Certificate store
//!
//! Holds each branch's signing certificates as loaded from the persistence
//! collaborator. Certificates are keyed by their owning branch and dropped
//! together with it on reload.

use crate::collab::store::BranchStore;
use crate::common::{Error, Result};
use crate::coordinator::branch::{Branch, Certificate, CertificateStatus};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError, RwLock};

pub struct CertificateStore {
    by_branch: RwLock<HashMap<String, Vec<Certificate>>>,
    warning_window: RwLock<chrono::Duration>,
    /// Serials already reported as expiring
    reported: Mutex<HashSet<String>>,
}

impl CertificateStore {
    pub fn new(warning_window: chrono::Duration) -> Self {
        Self {
            by_branch: RwLock::new(HashMap::new()),
            warning_window: RwLock::new(warning_window),
            reported: Mutex::new(HashSet::new()),
        }
    }

    pub fn set_warning_window(&self, window: chrono::Duration) {
        *self
            .warning_window
            .write()
            .unwrap_or_else(PoisonError::into_inner) = window;
    }

    fn window(&self) -> chrono::Duration {
        *self
            .warning_window
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload every branch's certificates, replacing the previous contents.
    /// Branches absent from `branches` lose their certificates.
    pub fn load(&self, store: &dyn BranchStore, branches: &[Branch]) -> Result<()> {
        let mut fresh = HashMap::with_capacity(branches.len());
        for branch in branches {
            let certs = Self::owned_certificates(branch, store.load_certificates(&branch.code)?);
            tracing::debug!(branch = %branch.code, count = certs.len(), "loaded certificates");
            fresh.insert(branch.code.clone(), certs);
        }
        *self.by_branch.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        Ok(())
    }

    /// Keep only certificates owned by `branch`, ordered by its reference list
    fn owned_certificates(branch: &Branch, loaded: Vec<Certificate>) -> Vec<Certificate> {
        let mut owned: Vec<Certificate> = loaded
            .into_iter()
            .filter(|c| {
                if c.branch != branch.code {
                    tracing::warn!(
                        branch = %branch.code,
                        serial = %c.serial,
                        owner = %c.branch,
                        "ignoring certificate owned by another branch"
                    );
                    return false;
                }
                branch.certificates.is_empty() || branch.certificates.contains(&c.serial)
            })
            .collect();
        if !branch.certificates.is_empty() {
            owned.sort_by_key(|c| {
                branch
                    .certificates
                    .iter()
                    .position(|s| *s == c.serial)
                    .unwrap_or(usize::MAX)
            });
        }
        owned
    }

    /// Replace the certificates of one branch
    pub fn replace(&self, branch: &str, certs: Vec<Certificate>) {
        let certs = certs.into_iter().filter(|c| c.branch == branch).collect();
        self.by_branch
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(branch.to_string(), certs);
    }

    pub fn certificates(&self, branch: &str) -> Vec<Certificate> {
        self.by_branch
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(branch)
            .cloned()
            .unwrap_or_default()
    }

    /// The valid certificate with the furthest not-after
    pub fn best_for(&self, branch: &str, now: DateTime<Utc>) -> Result<Certificate> {
        let window = self.window();
        let by_branch = self.by_branch.read().unwrap_or_else(PoisonError::into_inner);
        let certs = by_branch.get(branch).map(Vec::as_slice).unwrap_or(&[]);

        let best = certs
            .iter()
            .filter(|c| c.status_at(now, window) == CertificateStatus::Valid)
            .max_by_key(|c| c.not_after);

        match best {
            Some(cert) => Ok(cert.clone()),
            None => {
                let reason = if certs.is_empty() {
                    "no certificates on file".to_string()
                } else {
                    certs
                        .iter()
                        .map(|c| format!("{} {}", c.serial, c.status_at(now, window)))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                Err(Error::CertificateInvalid {
                    branch: branch.to_string(),
                    reason,
                })
            }
        }
    }

    pub fn statuses(&self, branch: &str, now: DateTime<Utc>) -> Vec<(Certificate, CertificateStatus)> {
        let window = self.window();
        self.certificates(branch)
            .into_iter()
            .map(|c| {
                let status = c.status_at(now, window);
                (c, status)
            })
            .collect()
    }

    /// Certificates inside the expiry warning window
    pub fn expiring(&self, now: DateTime<Utc>) -> Vec<Certificate> {
        let window = self.window();
        let by_branch = self.by_branch.read().unwrap_or_else(PoisonError::into_inner);
        by_branch
            .values()
            .flatten()
            .filter(|c| c.status_at(now, window) == CertificateStatus::ExpiringSoon)
            .cloned()
            .collect()
    }

    /// Expiring certificates not returned by an earlier call
    pub fn take_newly_expiring(&self, now: DateTime<Utc>) -> Vec<Certificate> {
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);
        self.expiring(now)
            .into_iter()
            .filter(|c| reported.insert(c.serial.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::store::{MemoryStore, StoreState};
    use crate::coordinator::branch::BranchStatus;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap()
    }

    fn cert(serial: &str, branch: &str, days_left: i64) -> Certificate {
        Certificate {
            serial: serial.into(),
            branch: branch.into(),
            not_before: now() - Duration::days(365),
            not_after: now() + Duration::days(days_left),
            revoked: false,
        }
    }

    fn branch(code: &str, certs: &[&str]) -> Branch {
        Branch {
            code: code.into(),
            name: code.into(),
            company: "EKU9003173C9".into(),
            is_primary: false,
            status: BranchStatus::Active,
            coordination_group: "g".into(),
            endpoint: format!("http://pac.local/{}", code),
            regions: vec![],
            certificates: certs.iter().map(|s| s.to_string()).collect(),
            series: vec![],
            thresholds: None,
        }
    }

    #[test]
    fn test_best_picks_furthest_expiry() {
        let store = CertificateStore::new(Duration::days(7));
        store.replace(
            "MTY",
            vec![
                cert("c-short", "MTY", 40),
                cert("c-long", "MTY", 700),
                cert("c-mid", "MTY", 300),
            ],
        );
        assert_eq!(store.best_for("MTY", now()).unwrap().serial, "c-long");
    }

    #[test]
    fn test_only_valid_certificates_selected() {
        let store = CertificateStore::new(Duration::days(7));
        let mut revoked = cert("c-revoked", "MTY", 900);
        revoked.revoked = true;
        store.replace(
            "MTY",
            vec![revoked, cert("c-expired", "MTY", -1), cert("c-soon", "MTY", 3)],
        );
        match store.best_for("MTY", now()) {
            Err(Error::CertificateInvalid { branch, reason }) => {
                assert_eq!(branch, "MTY");
                assert!(reason.contains("c-expired expired"));
                assert!(reason.contains("c-revoked revoked"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(store.best_for("NOPE", now()).is_err());
    }

    #[test]
    fn test_load_respects_ownership_and_references() {
        let state = StoreState::default()
            .with_certificate(cert("c1", "MTY", 100))
            .with_certificate(cert("c2", "MTY", 200))
            .with_certificate(cert("stray", "GDL", 500));
        let mut state = state;
        // misfiled certificate must not be attributed to MTY
        state
            .certificates
            .get_mut("MTY")
            .unwrap()
            .push(cert("foreign", "GDL", 900));
        let mem = MemoryStore::new(state);

        let store = CertificateStore::new(Duration::days(7));
        store.load(&mem, &[branch("MTY", &["c2"])]).unwrap();

        let certs = store.certificates("MTY");
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].serial, "c2");
        assert!(store.certificates("GDL").is_empty());
    }

    #[test]
    fn test_expiring_reported_once() {
        let store = CertificateStore::new(Duration::days(7));
        store.replace("MTY", vec![cert("c-soon", "MTY", 2), cert("c-ok", "MTY", 200)]);

        let first = store.take_newly_expiring(now());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].serial, "c-soon");
        assert!(store.take_newly_expiring(now()).is_empty());
        assert_eq!(store.expiring(now()).len(), 1);
    }
}
