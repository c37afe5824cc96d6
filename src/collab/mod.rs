//! Collaborator seams
//!
//! Everything outside the coordination core (durable storage, the PAC,
//! connectivity checks, notification delivery) is reached through the
//! traits in this module.

pub mod notify;
pub mod pac;
pub mod probe;
pub mod store;

pub use notify::{ChannelNotifier, LogNotifier, Notification, Notifier, ThresholdLevel};
pub use pac::{PacClient, PacStamp};
pub use probe::{HttpProber, Prober};
pub use store::{BranchStore, FileStore, MemoryStore, StoreState};
