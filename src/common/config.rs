//! Configuration for the coordination engine
//!
//! Loaded once at startup (and again on an explicit reload) from a TOML file
//! layered with `CFDI_COORD__*` environment overrides, then validated.
//! Nothing here is watched live.

use crate::common::utils::{duration_str, format_duration};
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest interval, timeout or retention any setting may carry (ten years)
pub const MAX_DURATION: Duration = Duration::from_secs(10 * 365 * 86_400);

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub failover: FailoverConfig,

    #[serde(default)]
    pub folio: FolioConfig,

    #[serde(default)]
    pub certificates: CertificateConfig,

    /// Coordination groups (failover / balancing domains)
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// Per-customer routing preferences
    #[serde(default)]
    pub customers: Vec<CustomerConfig>,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Probe interval per branch
    #[serde(with = "duration_str", default = "default_probe_interval")]
    pub interval: Duration,

    /// Upper bound for a single probe
    #[serde(with = "duration_str", default = "default_probe_timeout")]
    pub probe_timeout: Duration,

    /// Consecutive failures before a branch is marked unavailable
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before a branch is marked available again
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: u32,

    /// Maximum random delay before a branch's first probe
    #[serde(with = "duration_str", default = "default_startup_jitter")]
    pub startup_jitter: Duration,
}

fn default_probe_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_recovery_threshold() -> u32 {
    2
}
fn default_startup_jitter() -> Duration {
    Duration::from_secs(2)
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: default_probe_interval(),
            probe_timeout: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            recovery_threshold: default_recovery_threshold(),
            startup_jitter: default_startup_jitter(),
        }
    }
}

/// Failover coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Distinct branch attempts per request
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Upper bound for a single PAC call
    #[serde(with = "duration_str", default = "default_stamp_timeout")]
    pub stamp_timeout: Duration,

    /// How long committed request ids are remembered
    #[serde(with = "duration_str", default = "default_dedup_ttl")]
    pub dedup_ttl: Duration,
}

fn default_max_attempts() -> usize {
    3
}
fn default_stamp_timeout() -> Duration {
    Duration::from_secs(10)
}
fn default_dedup_ttl() -> Duration {
    Duration::from_secs(24 * 3600)
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            stamp_timeout: default_stamp_timeout(),
            dedup_ttl: default_dedup_ttl(),
        }
    }
}

/// Default remaining-folio thresholds (branches may override)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FolioConfig {
    #[serde(default = "default_warning_remaining")]
    pub warning_remaining: u64,

    #[serde(default = "default_critical_remaining")]
    pub critical_remaining: u64,
}

fn default_warning_remaining() -> u64 {
    500
}
fn default_critical_remaining() -> u64 {
    50
}

impl Default for FolioConfig {
    fn default() -> Self {
        Self {
            warning_remaining: default_warning_remaining(),
            critical_remaining: default_critical_remaining(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CertificateConfig {
    /// Days before not-after at which a certificate counts as expiring soon
    #[serde(default = "default_expiry_warning_days")]
    pub expiry_warning_days: u32,
}

fn default_expiry_warning_days() -> u32 {
    7
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            expiry_warning_days: default_expiry_warning_days(),
        }
    }
}

impl CertificateConfig {
    pub fn warning_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.expiry_warning_days))
    }
}

/// How a group ranks its primary and backups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Balancing {
    /// Primary first, then backups in configured order
    #[default]
    Ordered,
    /// All members share traffic according to `weights`
    Weighted,
}

/// A coordination group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: String,

    pub members: Vec<String>,

    #[serde(default)]
    pub primary: Option<String>,

    /// Backup branches, highest priority first
    #[serde(default)]
    pub backups: Vec<String>,

    #[serde(default)]
    pub balancing: Balancing,

    /// Integer weights for weighted distribution (missing members weigh 1)
    #[serde(default)]
    pub weights: Vec<BranchWeight>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchWeight {
    pub branch: String,
    pub weight: u32,
}

/// Customer routing preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerConfig {
    /// Customer identifier (RFC)
    pub id: String,

    #[serde(default)]
    pub preferred_branch: Option<String>,

    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON state file used by the file-backed store
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./cfdi-coord-state.json")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            health: HealthConfig::default(),
            failover: FailoverConfig::default(),
            folio: FolioConfig::default(),
            certificates: CertificateConfig::default(),
            groups: Vec::new(),
            customers: Vec::new(),
            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Load from a TOML file plus `CFDI_COORD__` environment overrides, then validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).format(config::FileFormat::Toml))
            .add_source(config::Environment::with_prefix("CFDI_COORD").separator("__"))
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse and validate an in-memory TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?;
        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check every structural rule; the first violation is returned
    pub fn validate(&self) -> Result<()> {
        let h = &self.health;
        if h.failure_threshold == 0 || h.recovery_threshold == 0 {
            return Err(Error::InvalidConfig(
                "health thresholds must be at least 1".into(),
            ));
        }
        if h.interval.is_zero() || h.probe_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "health interval and probe_timeout must be non-zero".into(),
            ));
        }
        if self.failover.max_attempts == 0 {
            return Err(Error::InvalidConfig("failover.max_attempts must be at least 1".into()));
        }
        if self.failover.stamp_timeout.is_zero() {
            return Err(Error::InvalidConfig("failover.stamp_timeout must be non-zero".into()));
        }
        for (name, value) in [
            ("health.interval", h.interval),
            ("health.probe_timeout", h.probe_timeout),
            ("health.startup_jitter", h.startup_jitter),
            ("failover.stamp_timeout", self.failover.stamp_timeout),
            ("failover.dedup_ttl", self.failover.dedup_ttl),
        ] {
            if value > MAX_DURATION {
                return Err(Error::InvalidConfig(format!(
                    "{} exceeds the maximum of {}",
                    name,
                    format_duration(MAX_DURATION)
                )));
            }
        }
        if self.folio.critical_remaining > self.folio.warning_remaining {
            return Err(Error::InvalidConfig(
                "folio.critical_remaining must not exceed folio.warning_remaining".into(),
            ));
        }

        let mut group_ids = HashSet::new();
        let mut owner: HashMap<&str, &str> = HashMap::new();
        for group in &self.groups {
            group.validate()?;
            if !group_ids.insert(group.id.as_str()) {
                return Err(Error::InvalidConfig(format!("duplicate group id {}", group.id)));
            }
            for member in &group.members {
                if let Some(other) = owner.insert(member.as_str(), group.id.as_str()) {
                    return Err(Error::InvalidConfig(format!(
                        "branch {} belongs to both {} and {}",
                        member, other, group.id
                    )));
                }
            }
        }

        let mut customers = HashSet::new();
        for customer in &self.customers {
            if !customers.insert(customer.id.as_str()) {
                return Err(Error::InvalidConfig(format!("duplicate customer {}", customer.id)));
            }
            if let Some(branch) = &customer.preferred_branch {
                if !owner.contains_key(branch.as_str()) {
                    return Err(Error::InvalidConfig(format!(
                        "customer {} prefers {} which is in no group",
                        customer.id, branch
                    )));
                }
            }
        }

        Ok(())
    }

    pub fn group(&self, id: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn customer(&self, id: &str) -> Option<&CustomerConfig> {
        self.customers.iter().find(|c| c.id == id)
    }

    /// Every branch code named by any group
    pub fn branch_codes(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.members.iter().cloned())
            .collect()
    }
}

impl GroupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidConfig("group id cannot be empty".into()));
        }
        if self.members.is_empty() {
            return Err(Error::InvalidConfig(format!("group {} has no members", self.id)));
        }
        let members: HashSet<&str> = self.members.iter().map(String::as_str).collect();
        if members.len() != self.members.len() {
            return Err(Error::InvalidConfig(format!(
                "group {} lists a member twice",
                self.id
            )));
        }
        if let Some(primary) = &self.primary {
            if !members.contains(primary.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "group {}: primary {} is not a member",
                    self.id, primary
                )));
            }
        }
        let mut seen = HashSet::new();
        for backup in &self.backups {
            if !members.contains(backup.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "group {}: backup {} is not a member",
                    self.id, backup
                )));
            }
            if self.primary.as_deref() == Some(backup.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "group {}: primary {} is also listed as a backup",
                    self.id, backup
                )));
            }
            if !seen.insert(backup.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "group {}: backup {} listed twice",
                    self.id, backup
                )));
            }
        }
        let mut weighted = HashSet::new();
        for entry in &self.weights {
            if !members.contains(entry.branch.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "group {}: weight for non-member {}",
                    self.id, entry.branch
                )));
            }
            if !weighted.insert(entry.branch.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "group {}: weight for {} given twice",
                    self.id, entry.branch
                )));
            }
        }
        if self.balancing == Balancing::Weighted
            && self.members.iter().all(|m| self.weight_of(m) == 0)
        {
            return Err(Error::InvalidConfig(format!(
                "group {}: weighted balancing needs a non-zero weight",
                self.id
            )));
        }
        Ok(())
    }

    /// Weight used by the load balancer; members without an entry weigh 1
    pub fn weight_of(&self, branch: &str) -> u32 {
        self.weights
            .iter()
            .find(|w| w.branch == branch)
            .map(|w| w.weight)
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log_level = "debug"

[health]
interval = "15s"
failure_threshold = 4

[failover]
max_attempts = 2
stamp_timeout = "8s"

[[groups]]
id = "norte"
members = ["MTY", "SAL", "CHI"]
primary = "MTY"
backups = ["SAL", "CHI"]

[[groups]]
id = "occidente"
members = ["GDL", "ZAP"]
balancing = "weighted"
weights = [{ branch = "GDL", weight = 2 }, { branch = "ZAP", weight = 1 }]

[[customers]]
id = "XAXX010101000"
preferred_branch = "SAL"
region = "NL"
"#;

    #[test]
    fn test_parse_sample() {
        let cfg = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.health.interval, Duration::from_secs(15));
        assert_eq!(cfg.health.failure_threshold, 4);
        assert_eq!(cfg.health.recovery_threshold, 2);
        assert_eq!(cfg.failover.max_attempts, 2);
        assert_eq!(cfg.failover.dedup_ttl, Duration::from_secs(86400));
        assert_eq!(cfg.groups.len(), 2);
        let occ = cfg.group("occidente").unwrap();
        assert_eq!(occ.balancing, Balancing::Weighted);
        assert_eq!(occ.weight_of("GDL"), 2);
        assert_eq!(cfg.customer("XAXX010101000").unwrap().region.as_deref(), Some("NL"));
        assert_eq!(cfg.branch_codes().len(), 5);
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.health.failure_threshold, 3);
        assert_eq!(cfg.health.recovery_threshold, 2);
        assert_eq!(cfg.health.interval, Duration::from_secs(30));
        assert_eq!(cfg.failover.max_attempts, 3);
        assert_eq!(cfg.failover.stamp_timeout, Duration::from_secs(10));
        assert!(cfg.validate().is_ok());
    }

    fn group(id: &str, members: &[&str], primary: Option<&str>, backups: &[&str]) -> GroupConfig {
        GroupConfig {
            id: id.to_string(),
            members: members.iter().map(|s| s.to_string()).collect(),
            primary: primary.map(str::to_string),
            backups: backups.iter().map(|s| s.to_string()).collect(),
            balancing: Balancing::Ordered,
            weights: Vec::new(),
        }
    }

    #[test]
    fn test_primary_must_be_member() {
        let g = group("g", &["A", "B"], Some("Z"), &["B"]);
        assert!(matches!(g.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_backups_exclude_primary_and_duplicates() {
        assert!(group("g", &["A", "B"], Some("A"), &["A", "B"]).validate().is_err());
        assert!(group("g", &["A", "B", "C"], Some("A"), &["B", "B"]).validate().is_err());
        assert!(group("g", &["A", "B", "C"], Some("A"), &["C", "B"]).validate().is_ok());
    }

    #[test]
    fn test_branch_in_two_groups_rejected() {
        let cfg = Config {
            groups: vec![
                group("g1", &["A", "B"], Some("A"), &["B"]),
                group("g2", &["B", "C"], Some("C"), &[]),
            ],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut cfg = Config::default();
        cfg.health.failure_threshold = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.folio.critical_remaining = 900;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_unknown_preferred_branch_rejected() {
        let cfg = Config {
            groups: vec![group("g1", &["A"], Some("A"), &[])],
            customers: vec![CustomerConfig {
                id: "C1".into(),
                preferred_branch: Some("Q".into()),
                region: None,
            }],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_duration_is_config_error() {
        let raw = "[health]\ninterval = \"soon\"\n";
        assert!(matches!(
            Config::from_toml_str(raw),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let raw = "[failover]\ndedup_ttl = \"200000000000000d\"\n";
        assert!(matches!(
            Config::from_toml_str(raw),
            Err(Error::InvalidConfig(_))
        ));

        let mut cfg = Config::default();
        cfg.failover.dedup_ttl = Duration::from_secs(u64::MAX);
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));

        let mut cfg = Config::default();
        cfg.health.interval = MAX_DURATION + Duration::from_secs(1);
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.failover.dedup_ttl = MAX_DURATION;
        assert!(cfg.validate().is_ok());
    }
}
