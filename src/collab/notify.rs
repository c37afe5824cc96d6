//! Notification collaborator
//!
//! Fire-and-forget events for branch availability transitions, folio
//! threshold breaches and expiring certificates. `Notifier::notify` must
//! return promptly; the engine never waits on delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdLevel {
    Warning,
    Critical,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    BranchUnavailable {
        branch: String,
        consecutive_failures: u32,
    },
    BranchRecovered {
        branch: String,
    },
    FolioThreshold {
        branch: String,
        series: String,
        remaining: i64,
        level: ThresholdLevel,
    },
    CertificateExpiring {
        branch: String,
        serial: String,
        not_after: DateTime<Utc>,
    },
}

impl Notification {
    pub fn branch(&self) -> &str {
        match self {
            Notification::BranchUnavailable { branch, .. }
            | Notification::BranchRecovered { branch }
            | Notification::FolioThreshold { branch, .. }
            | Notification::CertificateExpiring { branch, .. } => branch,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, event: Notification);
}

/// One line of the JSONL event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEntry {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Notification,
}

/// Logs every event through `tracing` and optionally appends it to a JSONL file
pub struct LogNotifier {
    file: Option<Mutex<File>>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self { file: None }
    }

    /// Also append events to `path`; an unopenable file only disables the file sink
    pub fn with_file(path: impl AsRef<Path>) -> Self {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .map_err(|e| {
                tracing::warn!(
                    "Notification log {} unavailable: {}",
                    path.as_ref().display(),
                    e
                )
            })
            .ok()
            .map(Mutex::new);
        Self { file }
    }
}

impl Default for LogNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, event: Notification) {
        match &event {
            Notification::BranchRecovered { branch } => {
                tracing::info!(branch = %branch, "branch recovered")
            }
            other => tracing::warn!(branch = %other.branch(), event = ?other, "coordination event"),
        }
        if let Some(file) = &self.file {
            let entry = NotificationEntry {
                timestamp: Utc::now(),
                event,
            };
            let line = serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string());
            let mut f = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = writeln!(f, "{}", line);
        }
    }
}

/// Forwards events to an unbounded channel; delivery never blocks the sender
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: Notification) {
        if self.tx.send(event).is_err() {
            tracing::debug!("notification receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_notifier_writes_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let notifier = LogNotifier::with_file(&path);

        notifier.notify(Notification::BranchUnavailable {
            branch: "MTY".into(),
            consecutive_failures: 3,
        });
        notifier.notify(Notification::FolioThreshold {
            branch: "MTY".into(),
            series: "A".into(),
            remaining: 50,
            level: ThresholdLevel::Critical,
        });

        let raw = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: NotificationEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(
            first.event,
            Notification::BranchUnavailable {
                branch: "MTY".into(),
                consecutive_failures: 3
            }
        );
        assert!(lines[1].contains("\"level\":\"critical\""));
    }

    #[test]
    fn test_channel_notifier_survives_dropped_receiver() {
        let (notifier, rx) = ChannelNotifier::new();
        drop(rx);
        notifier.notify(Notification::BranchRecovered {
            branch: "GDL".into(),
        });
    }
}
