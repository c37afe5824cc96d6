//! Persistence collaborator
//!
//! The durable source of truth for branch records, certificates and folio
//! counters. Calls are synchronous: the folio sequencer invokes them from
//! inside its per-series critical section, which must not suspend.

use crate::common::{Error, Result};
use crate::coordinator::branch::{Branch, Certificate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

pub trait BranchStore: Send + Sync {
    fn load_branch(&self, code: &str) -> Result<Option<Branch>>;

    fn load_certificates(&self, branch: &str) -> Result<Vec<Certificate>>;

    /// Last issued folio for (branch, series); 0 when nothing was issued yet
    fn load_folio_counter(&self, branch: &str, series: &str) -> Result<u64>;

    /// Durably record the last issued folio. Values lower than the stored
    /// counter are refused.
    fn persist_folio_counter(&self, branch: &str, series: &str, value: u64) -> Result<()>;
}

/// Serializable store contents (also the on-disk format of `FileStore`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub branches: BTreeMap<String, Branch>,
    #[serde(default)]
    pub certificates: BTreeMap<String, Vec<Certificate>>,
    /// branch -> series -> last issued folio
    #[serde(default)]
    pub counters: BTreeMap<String, BTreeMap<String, u64>>,
}

impl StoreState {
    pub fn with_branch(mut self, branch: Branch) -> Self {
        self.branches.insert(branch.code.clone(), branch);
        self
    }

    pub fn with_certificate(mut self, cert: Certificate) -> Self {
        self.certificates
            .entry(cert.branch.clone())
            .or_default()
            .push(cert);
        self
    }

    pub fn with_counter(mut self, branch: &str, series: &str, value: u64) -> Self {
        self.counters
            .entry(branch.to_string())
            .or_default()
            .insert(series.to_string(), value);
        self
    }

    fn counter(&self, branch: &str, series: &str) -> u64 {
        self.counters
            .get(branch)
            .and_then(|s| s.get(series))
            .copied()
            .unwrap_or(0)
    }

    fn advance_counter(&mut self, branch: &str, series: &str, value: u64) -> Result<()> {
        let current = self.counter(branch, series);
        if value < current {
            return Err(Error::Store(format!(
                "refusing to move {}/{} counter back from {} to {}",
                branch, series, current, value
            )));
        }
        self.counters
            .entry(branch.to_string())
            .or_default()
            .insert(series.to_string(), value);
        Ok(())
    }
}

/// Process-local store, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
        }
    }

    /// Replace a branch's certificates (e.g. after a rotation)
    pub fn put_certificates(&self, branch: &str, certs: Vec<Certificate>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.certificates.insert(branch.to_string(), certs);
    }
}

impl BranchStore for MemoryStore {
    fn load_branch(&self, code: &str) -> Result<Option<Branch>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.branches.get(code).cloned())
    }

    fn load_certificates(&self, branch: &str) -> Result<Vec<Certificate>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.certificates.get(branch).cloned().unwrap_or_default())
    }

    fn load_folio_counter(&self, branch: &str, series: &str) -> Result<u64> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.counter(branch, series))
    }

    fn persist_folio_counter(&self, branch: &str, series: &str, value: u64) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.advance_counter(branch, series, value)
    }
}

/// JSON document on disk, rewritten atomically on every counter change
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl FileStore {
    /// Open an existing state file, or start empty if it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = fs::read(&path)?;
            serde_json::from_slice(&raw)?
        } else {
            StoreState::default()
        };
        tracing::debug!("Opened state file {}", path.display());
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Create (or overwrite) a state file with the given contents
    pub fn create(path: impl AsRef<Path>, state: StoreState) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            state: Mutex::new(state),
        };
        {
            let state = store.state.lock().unwrap_or_else(PoisonError::into_inner);
            store.write_file(&state)?;
        }
        Ok(store)
    }

    /// Write to a temp file, fsync it, rename over the state file and fsync
    /// the directory so the rename itself survives a crash
    fn write_file(&self, state: &StoreState) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(state)?;
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        sync_parent_dir(&self.path)?;
        Ok(())
    }
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

impl BranchStore for FileStore {
    fn load_branch(&self, code: &str) -> Result<Option<Branch>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.branches.get(code).cloned())
    }

    fn load_certificates(&self, branch: &str) -> Result<Vec<Certificate>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.certificates.get(branch).cloned().unwrap_or_default())
    }

    fn load_folio_counter(&self, branch: &str, series: &str) -> Result<u64> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.counter(branch, series))
    }

    fn persist_folio_counter(&self, branch: &str, series: &str, value: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = state.counter(branch, series);
        state.advance_counter(branch, series, value)?;
        if let Err(e) = self.write_file(&state) {
            // keep memory and disk in agreement
            state
                .counters
                .entry(branch.to_string())
                .or_default()
                .insert(series.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }
}
