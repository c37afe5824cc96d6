//! Branch, certificate and coordination-group records

use crate::common::{Balancing, GroupConfig, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Active,
    Suspended,
    Disabled,
}

impl std::fmt::Display for BranchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BranchStatus::Active => write!(f, "active"),
            BranchStatus::Suspended => write!(f, "suspended"),
            BranchStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// Remaining-folio marks at which the notifier is told
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolioThresholds {
    pub warning: u64,
    pub critical: u64,
}

/// Authorized capacity of one series; the counter may never pass `limit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRange {
    pub series: String,
    pub limit: u64,
}

/// An issuing point with its own numbering and certificates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub code: String,
    pub name: String,
    /// Owning legal entity (RFC)
    pub company: String,
    #[serde(default)]
    pub is_primary: bool,
    pub status: BranchStatus,
    #[serde(default)]
    pub coordination_group: String,
    /// Stamping endpoint probed by the health monitor
    pub endpoint: String,
    /// Regions this branch serves for geographic routing
    #[serde(default)]
    pub regions: Vec<String>,
    /// Certificate serials owned by this branch, in preference order
    #[serde(default)]
    pub certificates: Vec<String>,
    /// Active series; a series not listed here has no capacity bound
    #[serde(default)]
    pub series: Vec<SeriesRange>,
    #[serde(default)]
    pub thresholds: Option<FolioThresholds>,
}

impl Branch {
    pub fn serves_region(&self, region: &str) -> bool {
        self.regions.iter().any(|r| r.eq_ignore_ascii_case(region))
    }

    pub fn series_limit(&self, series: &str) -> Option<u64> {
        self.series
            .iter()
            .find(|s| s.series == series)
            .map(|s| s.limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CertificateStatus {
    Valid,
    ExpiringSoon,
    Expired,
    Revoked,
    NotYetValid,
}

impl std::fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CertificateStatus::Valid => write!(f, "valid"),
            CertificateStatus::ExpiringSoon => write!(f, "expiring-soon"),
            CertificateStatus::Expired => write!(f, "expired"),
            CertificateStatus::Revoked => write!(f, "revoked"),
            CertificateStatus::NotYetValid => write!(f, "not-yet-valid"),
        }
    }
}

/// Signing certificate (CSD) owned by exactly one branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub serial: String,
    pub branch: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

impl Certificate {
    /// Status at `now`; anything inside `warning_window` of not-after is expiring soon
    pub fn status_at(&self, now: DateTime<Utc>, warning_window: chrono::Duration) -> CertificateStatus {
        if self.revoked {
            CertificateStatus::Revoked
        } else if now < self.not_before {
            CertificateStatus::NotYetValid
        } else if now >= self.not_after {
            CertificateStatus::Expired
        } else if self.not_after - now <= warning_window {
            CertificateStatus::ExpiringSoon
        } else {
            CertificateStatus::Valid
        }
    }
}

/// Branches that back each other up
#[derive(Debug, Clone)]
pub struct CoordinationGroup {
    pub id: String,
    pub members: Vec<String>,
    pub primary: Option<String>,
    pub backups: Vec<String>,
    pub balancing: Balancing,
    weights: HashMap<String, u32>,
}

impl CoordinationGroup {
    pub fn from_config(cfg: &GroupConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            id: cfg.id.clone(),
            members: cfg.members.clone(),
            primary: cfg.primary.clone(),
            backups: cfg.backups.clone(),
            balancing: cfg.balancing,
            weights: cfg
                .weights
                .iter()
                .map(|w| (w.branch.clone(), w.weight))
                .collect(),
        })
    }

    pub fn contains(&self, code: &str) -> bool {
        self.members.iter().any(|m| m == code)
    }

    pub fn weight_of(&self, code: &str) -> u32 {
        self.weights.get(code).copied().unwrap_or(1)
    }

    /// Members in failover order: primary, backups, then any unlisted members
    pub fn ranked_members(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::with_capacity(self.members.len());
        if let Some(p) = &self.primary {
            out.push(p);
        }
        for b in &self.backups {
            out.push(b);
        }
        for m in &self.members {
            if !out.contains(&m.as_str()) {
                out.push(m);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::BranchWeight;
    use chrono::{Duration, TimeZone};

    fn cert(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Certificate {
        Certificate {
            serial: "30001000000400002434".into(),
            branch: "MTY".into(),
            not_before,
            not_after,
            revoked: false,
        }
    }

    #[test]
    fn test_certificate_status() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let window = Duration::days(7);

        let c = cert(now - Duration::days(300), now + Duration::days(400));
        assert_eq!(c.status_at(now, window), CertificateStatus::Valid);

        let c = cert(now - Duration::days(300), now + Duration::days(3));
        assert_eq!(c.status_at(now, window), CertificateStatus::ExpiringSoon);

        let c = cert(now - Duration::days(300), now);
        assert_eq!(c.status_at(now, window), CertificateStatus::Expired);

        let c = cert(now + Duration::days(1), now + Duration::days(400));
        assert_eq!(c.status_at(now, window), CertificateStatus::NotYetValid);

        let mut c = cert(now - Duration::days(300), now + Duration::days(400));
        c.revoked = true;
        assert_eq!(c.status_at(now, window), CertificateStatus::Revoked);
    }

    #[test]
    fn test_group_ranking() {
        let cfg = GroupConfig {
            id: "norte".into(),
            members: vec!["CHI".into(), "MTY".into(), "SAL".into(), "TOR".into()],
            primary: Some("MTY".into()),
            backups: vec!["SAL".into(), "CHI".into()],
            balancing: Balancing::Ordered,
            weights: vec![BranchWeight {
                branch: "SAL".into(),
                weight: 3,
            }],
        };
        let group = CoordinationGroup::from_config(&cfg).unwrap();
        assert_eq!(group.ranked_members(), vec!["MTY", "SAL", "CHI", "TOR"]);
        assert_eq!(group.weight_of("SAL"), 3);
        assert_eq!(group.weight_of("CHI"), 1);
        assert!(group.contains("TOR"));
    }

    #[test]
    fn test_series_limit_and_region() {
        let branch = Branch {
            code: "MTY".into(),
            name: "Monterrey".into(),
            company: "EKU9003173C9".into(),
            is_primary: true,
            status: BranchStatus::Active,
            coordination_group: "norte".into(),
            endpoint: "http://pac.local/mty".into(),
            regions: vec!["NL".into()],
            certificates: vec![],
            series: vec![SeriesRange {
                series: "A".into(),
                limit: 1000,
            }],
            thresholds: None,
        };
        assert_eq!(branch.series_limit("A"), Some(1000));
        assert_eq!(branch.series_limit("B"), None);
        assert!(branch.serves_region("nl"));
        assert!(!branch.serves_region("JAL"));
    }
}
