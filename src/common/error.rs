//! Error types for cfdi-coord

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why a single branch was passed over for a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    UnknownBranch,
    Unavailable,
    Suspended,
    Disabled,
    NoValidCertificate,
    ThresholdExceeded,
    PacRejected(String),
    Timeout,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::UnknownBranch => write!(f, "unknown branch"),
            RejectReason::Unavailable => write!(f, "unavailable"),
            RejectReason::Suspended => write!(f, "suspended"),
            RejectReason::Disabled => write!(f, "disabled"),
            RejectReason::NoValidCertificate => write!(f, "no valid certificate"),
            RejectReason::ThresholdExceeded => write!(f, "folio capacity exhausted"),
            RejectReason::PacRejected(msg) => write!(f, "PAC error: {}", msg),
            RejectReason::Timeout => write!(f, "PAC timeout"),
        }
    }
}

/// One entry in the diagnostic chain attached to a failed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub branch: String,
    pub reason: RejectReason,
}

impl Rejection {
    pub fn new(branch: impl Into<String>, reason: RejectReason) -> Self {
        Self {
            branch: branch.into(),
            reason,
        }
    }
}

fn render_chain(chain: &[Rejection]) -> String {
    if chain.is_empty() {
        return "no candidates".to_string();
    }
    chain
        .iter()
        .map(|r| format!("{}: {}", r.branch, r.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Branch-local Errors ===
    #[error("Branch unavailable: {0}")]
    BranchUnavailable(String),

    #[error("No valid certificate for branch {branch}: {reason}")]
    CertificateInvalid { branch: String, reason: String },

    #[error("Folio capacity exhausted for {branch}/{series} (remaining {remaining})")]
    ThresholdExceeded {
        branch: String,
        series: String,
        remaining: i64,
    },

    #[error("Unknown coordination group: {0}")]
    UnknownGroup(String),

    // === Request-fatal Errors ===
    #[error("No eligible branch for request {request_id}: {}", render_chain(.rejections))]
    NoEligibleBranch {
        request_id: String,
        rejections: Vec<Rejection>,
    },

    #[error("Stamping failed for request {request_id}: {}", render_chain(.attempts))]
    StampingFailed {
        request_id: String,
        attempts: Vec<Rejection>,
    },

    #[error("Request {request_id} cancelled: {}", render_chain(.attempts))]
    Cancelled {
        request_id: String,
        attempts: Vec<Rejection>,
    },

    #[error("Request {0} is already in flight")]
    RequestInFlight(String),

    #[error("Request {0} was already committed with a different payload")]
    RequestConflict(String),

    // === Folio Errors ===
    #[error("Invalid reservation transition for {branch}/{series} #{number}: {from} -> {to}")]
    InvalidTransition {
        branch: String,
        series: String,
        number: u64,
        from: String,
        to: String,
    },

    #[error("Unknown reservation {branch}/{series} #{number}")]
    UnknownReservation {
        branch: String,
        series: String,
        number: u64,
    },

    // === Collaborator Errors ===
    #[error("Store error: {0}")]
    Store(String),

    #[error("PAC error: {0}")]
    Pac(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Does this error only exclude one branch (the request may continue elsewhere)?
    pub fn is_branch_local(&self) -> bool {
        matches!(
            self,
            Error::BranchUnavailable(_)
                | Error::CertificateInvalid { .. }
                | Error::ThresholdExceeded { .. }
                | Error::Pac(_)
                | Error::Timeout(_)
                | Error::Http(_)
        )
    }

    /// Per-branch diagnostics carried by a terminal request failure
    pub fn rejections(&self) -> &[Rejection] {
        match self {
            Error::NoEligibleBranch { rejections, .. } => rejections,
            Error::StampingFailed { attempts, .. } | Error::Cancelled { attempts, .. } => attempts,
            _ => &[],
        }
    }

    /// Map a branch-local error to the reason recorded in a diagnostic chain
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            Error::BranchUnavailable(_) => RejectReason::Unavailable,
            Error::CertificateInvalid { .. } => RejectReason::NoValidCertificate,
            Error::ThresholdExceeded { .. } => RejectReason::ThresholdExceeded,
            Error::Timeout(_) => RejectReason::Timeout,
            Error::Pac(msg) => RejectReason::PacRejected(msg.clone()),
            other => RejectReason::PacRejected(other.to_string()),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Store(e.to_string())
    }
}
