//! Multi-branch stamping coordination
//!
//! The coordinator is responsible for:
//! - Certificate bookkeeping per branch
//! - Health monitoring with hysteresis
//! - Folio reservation (per branch and series, never reused)
//! - Candidate selection and weighted tie-breaking
//! - Failover across branches with bounded retries

pub mod balancer;
pub mod branch;
pub mod certificates;
pub mod failover;
pub mod folio;
pub mod health;
pub mod selection;
pub mod server;

pub use balancer::LoadBalancer;
pub use branch::{
    Branch, BranchStatus, Certificate, CertificateStatus, CoordinationGroup, FolioThresholds,
    SeriesRange,
};
pub use certificates::CertificateStore;
pub use failover::{CancelSignal, FailoverCoordinator, StampAttempt, StampPhase, StampResult};
pub use folio::{FolioReservation, FolioSequencer, ReservationState};
pub use health::{HealthMonitor, HealthRecord, ProbeOutcome};
pub use selection::{Candidate, Selection, SelectionEngine, SelectionTier, StampRequest, Topology};
pub use server::{BranchReport, Collaborators, Coordinator};
