//! Common utilities and types shared across cfdi-coord

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use config::{
    Balancing, BranchWeight, CertificateConfig, Config, CustomerConfig, FailoverConfig,
    FolioConfig, GroupConfig, HealthConfig, StoreConfig,
};
pub use error::{Error, RejectReason, Rejection, Result};
pub use metrics::CoordinatorMetrics;
pub use utils::{generate_request_id, parse_duration, payload_fingerprint};
