//! Selection engine
//!
//! Turns a stamping request into an ordered list of (branch, certificate)
//! candidates. Tiers are tried in precedence order: manual override,
//! customer preference, geography, group primary, backups. A branch is
//! judged once, at the highest tier that names it. Ineligible branches are
//! recorded with the reason they were passed over so a terminal failure can
//! explain itself.

use crate::collab::store::BranchStore;
use crate::common::{
    generate_request_id, Balancing, Config, CustomerConfig, Error, RejectReason, Rejection, Result,
};
use crate::coordinator::balancer::LoadBalancer;
use crate::coordinator::branch::{Branch, BranchStatus, Certificate, CoordinationGroup};
use crate::coordinator::certificates::CertificateStore;
use crate::coordinator::health::HealthMonitor;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Immutable view of branches, groups and customers, rebuilt on reload
#[derive(Debug, Clone, Default)]
pub struct Topology {
    branches: HashMap<String, Branch>,
    groups: HashMap<String, CoordinationGroup>,
    customers: HashMap<String, CustomerConfig>,
}

impl Topology {
    /// Resolve every configured group member through the store.
    ///
    /// Group membership and primaries come from the configuration; the
    /// store's `coordination_group` and `is_primary` fields are overwritten.
    pub fn build(config: &Config, store: &dyn BranchStore) -> Result<Self> {
        let mut branches = HashMap::new();
        let mut groups = HashMap::new();

        for group_cfg in &config.groups {
            let group = CoordinationGroup::from_config(group_cfg)?;
            for code in &group.members {
                let mut branch = store.load_branch(code)?.ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "group {} lists branch {} which is not in the store",
                        group.id, code
                    ))
                })?;
                branch.coordination_group = group.id.clone();
                branch.is_primary = group.primary.as_deref() == Some(code.as_str());
                branches.insert(code.clone(), branch);
            }
            groups.insert(group.id.clone(), group);
        }

        let customers = config
            .customers
            .iter()
            .map(|c| (c.id.clone(), c.clone()))
            .collect();

        tracing::debug!(
            branches = branches.len(),
            groups = groups.len(),
            "topology built"
        );
        Ok(Self {
            branches,
            groups,
            customers,
        })
    }

    pub fn branch(&self, code: &str) -> Option<&Branch> {
        self.branches.get(code)
    }

    pub fn group(&self, id: &str) -> Result<&CoordinationGroup> {
        self.groups
            .get(id)
            .ok_or_else(|| Error::UnknownGroup(id.to_string()))
    }

    pub fn customer(&self, id: &str) -> Option<&CustomerConfig> {
        self.customers.get(id)
    }

    /// All branches, sorted by code
    pub fn branches(&self) -> Vec<Branch> {
        let mut out: Vec<Branch> = self.branches.values().cloned().collect();
        out.sort_by(|a, b| a.code.cmp(&b.code));
        out
    }

    pub fn branch_codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.branches.keys().cloned().collect();
        codes.sort();
        codes
    }

    pub fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.groups.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// An invoice waiting to be stamped
#[derive(Debug, Clone)]
pub struct StampRequest {
    /// Caller-supplied idempotency key
    pub request_id: String,
    /// Coordination group that serves the issuing company
    pub group: String,
    pub customer: Option<String>,
    /// Overrides the region configured for the customer
    pub customer_region: Option<String>,
    pub amount_cents: u64,
    pub series: String,
    pub payload: Bytes,
    /// Manual override naming the branch to use
    pub branch_override: Option<String>,
}

impl StampRequest {
    pub fn new(
        request_id: impl Into<String>,
        group: impl Into<String>,
        series: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            group: group.into(),
            customer: None,
            customer_region: None,
            amount_cents: 0,
            series: series.into(),
            payload: payload.into(),
            branch_override: None,
        }
    }

    /// Request under a fresh random id, for callers without an idempotency key
    pub fn generated(
        group: impl Into<String>,
        series: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self::new(generate_request_id(), group, series, payload)
    }

    pub fn with_customer(mut self, customer: impl Into<String>) -> Self {
        self.customer = Some(customer.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.customer_region = Some(region.into());
        self
    }

    pub fn with_override(mut self, branch: impl Into<String>) -> Self {
        self.branch_override = Some(branch.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionTier {
    Override,
    CustomerPreferred,
    Geographic,
    Primary,
    Backup,
    /// Weighted pool of a group with `balancing = "weighted"`
    Balanced,
}

impl std::fmt::Display for SelectionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionTier::Override => write!(f, "override"),
            SelectionTier::CustomerPreferred => write!(f, "customer-preferred"),
            SelectionTier::Geographic => write!(f, "geographic"),
            SelectionTier::Primary => write!(f, "primary"),
            SelectionTier::Backup => write!(f, "backup"),
            SelectionTier::Balanced => write!(f, "balanced"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub branch: Branch,
    pub certificate: Certificate,
    pub tier: SelectionTier,
}

/// Ordered candidates plus the branches passed over on the way
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub candidates: Vec<Candidate>,
    pub rejections: Vec<Rejection>,
}

pub struct SelectionEngine {
    certificates: Arc<CertificateStore>,
    health: Arc<HealthMonitor>,
    balancer: Arc<LoadBalancer>,
}

impl SelectionEngine {
    pub fn new(
        certificates: Arc<CertificateStore>,
        health: Arc<HealthMonitor>,
        balancer: Arc<LoadBalancer>,
    ) -> Self {
        Self {
            certificates,
            health,
            balancer,
        }
    }

    /// Is `code` usable right now, and with which certificate?
    pub fn check_branch(
        &self,
        topology: &Topology,
        code: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<(Branch, Certificate), RejectReason> {
        let branch = topology.branch(code).ok_or(RejectReason::UnknownBranch)?;
        match branch.status {
            BranchStatus::Active => {}
            BranchStatus::Suspended => return Err(RejectReason::Suspended),
            BranchStatus::Disabled => return Err(RejectReason::Disabled),
        }
        if !self.health.is_available(code) {
            return Err(RejectReason::Unavailable);
        }
        let certificate = self
            .certificates
            .best_for(code, now)
            .map_err(|_| RejectReason::NoValidCertificate)?;
        Ok((branch.clone(), certificate))
    }

    /// Build the ordered candidate list for `request`.
    ///
    /// Fails with `NoEligibleBranch` when nothing survives; the error carries
    /// every rejection so the caller can see why.
    pub fn select(
        &self,
        topology: &Topology,
        request: &StampRequest,
        now: DateTime<Utc>,
    ) -> Result<Selection> {
        let group = topology.group(&request.group)?;
        let customer = request
            .customer
            .as_deref()
            .and_then(|id| topology.customer(id));

        let mut selection = Selection::default();
        let mut seen: HashSet<String> = HashSet::new();

        if let Some(code) = &request.branch_override {
            self.consider(topology, code, SelectionTier::Override, now, &mut seen, &mut selection);
        }

        if let Some(code) = customer.and_then(|c| c.preferred_branch.as_ref()) {
            self.consider(
                topology,
                code,
                SelectionTier::CustomerPreferred,
                now,
                &mut seen,
                &mut selection,
            );
        }

        let region = request
            .customer_region
            .as_deref()
            .or_else(|| customer.and_then(|c| c.region.as_deref()));
        if let Some(region) = region {
            for code in group.ranked_members() {
                let serves = topology
                    .branch(code)
                    .map(|b| b.serves_region(region))
                    .unwrap_or(false);
                if serves {
                    self.consider(
                        topology,
                        code,
                        SelectionTier::Geographic,
                        now,
                        &mut seen,
                        &mut selection,
                    );
                }
            }
        }

        match group.balancing {
            Balancing::Ordered => {
                if let Some(code) = &group.primary {
                    self.consider(topology, code, SelectionTier::Primary, now, &mut seen, &mut selection);
                }
                for code in &group.backups {
                    self.consider(topology, code, SelectionTier::Backup, now, &mut seen, &mut selection);
                }
            }
            Balancing::Weighted => {
                self.consider_weighted(topology, group, now, &mut seen, &mut selection);
            }
        }

        if selection.candidates.is_empty() {
            tracing::warn!(
                request_id = %request.request_id,
                group = %group.id,
                rejected = selection.rejections.len(),
                "no eligible branch"
            );
            return Err(Error::NoEligibleBranch {
                request_id: request.request_id.clone(),
                rejections: selection.rejections,
            });
        }

        tracing::debug!(
            request_id = %request.request_id,
            amount_cents = request.amount_cents,
            candidates = ?selection.candidates.iter().map(|c| c.branch.code.as_str()).collect::<Vec<_>>(),
            "selection complete"
        );
        Ok(selection)
    }

    fn consider(
        &self,
        topology: &Topology,
        code: &str,
        tier: SelectionTier,
        now: DateTime<Utc>,
        seen: &mut HashSet<String>,
        selection: &mut Selection,
    ) {
        if !seen.insert(code.to_string()) {
            return;
        }
        match self.check_branch(topology, code, now) {
            Ok((branch, certificate)) => selection.candidates.push(Candidate {
                branch,
                certificate,
                tier,
            }),
            Err(reason) => {
                tracing::debug!(branch = %code, %tier, %reason, "branch passed over");
                selection.rejections.push(Rejection::new(code, reason));
            }
        }
    }

    /// Eligible pool members, with the balancer's pick first
    fn consider_weighted(
        &self,
        topology: &Topology,
        group: &CoordinationGroup,
        now: DateTime<Utc>,
        seen: &mut HashSet<String>,
        selection: &mut Selection,
    ) {
        let mut eligible: Vec<Candidate> = Vec::new();
        for code in group.ranked_members() {
            if !seen.insert(code.to_string()) {
                continue;
            }
            match self.check_branch(topology, code, now) {
                Ok((branch, certificate)) => eligible.push(Candidate {
                    branch,
                    certificate,
                    tier: SelectionTier::Balanced,
                }),
                Err(reason) => selection.rejections.push(Rejection::new(code, reason)),
            }
        }

        let weights: Vec<(String, u32)> = eligible
            .iter()
            .map(|c| (c.branch.code.clone(), group.weight_of(&c.branch.code)))
            .collect();
        let order = self.balancer.order(&group.id, &weights);

        let mut by_code: HashMap<String, Candidate> = eligible
            .into_iter()
            .map(|c| (c.branch.code.clone(), c))
            .collect();
        selection
            .candidates
            .extend(order.iter().filter_map(|code| by_code.remove(code)));
    }
}
