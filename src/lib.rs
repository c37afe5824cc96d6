//! # cfdi-coord
//!
//! Coordination core for multi-branch electronic invoice (CFDI) stamping:
//! - Per-branch health monitoring with hysteresis
//! - Gap-free, never-reused folio numbering per branch and series
//! - Branch and certificate selection (override, customer, geography, primary, backups)
//! - Weighted load balancing inside coordination groups
//! - Automatic failover with bounded retries and request deduplication
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!        StampRequest
//!             │
//! ┌───────────▼─────────────┐      ┌─────────────────┐
//! │  Failover Coordinator   │─────▶│   PAC client    │
//! │ (state machine, dedup)  │      │ (collaborator)  │
//! └──┬──────────┬───────────┘      └─────────────────┘
//!    │          │
//! ┌──▼───────┐ ┌▼───────────────┐   ┌────────────────┐
//! │Selection │ │ Folio Sequencer│──▶│  Branch store  │
//! │ Engine   │ │ (per-series    │   │ (collaborator) │
//! └┬───┬───┬─┘ │  mutex)        │   └────────────────┘
//!  │   │   │   └────────────────┘
//!  │   │ ┌─▼────────────┐ ┌────────────────┐
//!  │   │ │Load Balancer │ │ Health Monitor │◀── probe loop per branch
//!  │   │ └──────────────┘ └────────────────┘
//!  │ ┌─▼──────────────────┐
//!  │ │ Certificate Store  │
//!  │ └────────────────────┘
//!  └──▶ Health Monitor
//! ```
//!
//! ## Usage
//!
//! ### Check a configuration file
//! ```bash
//! cfdi-coord validate --config coord.toml
//! ```
//!
//! ### Inspect branches, certificates and remaining folios
//! ```bash
//! cfdi-coord status --config coord.toml --store state.json
//! ```
//!
//! ### Run the health monitor (SIGHUP reloads the config)
//! ```bash
//! RUST_LOG=cfdi_coord=debug cfdi-coord monitor --config coord.toml --store state.json
//! ```

pub mod collab;
pub mod common;
pub mod coordinator;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::{CancelSignal, Collaborators, Coordinator, StampRequest, StampResult};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
