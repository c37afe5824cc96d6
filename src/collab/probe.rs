//! Connectivity probes against branch stamping endpoints

use crate::common::{Error, Result};
use crate::coordinator::branch::Branch;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait Prober: Send + Sync {
    /// Lightweight reachability check; `Ok` means the endpoint answered
    async fn probe(&self, branch: &Branch) -> Result<()>;
}

/// Issues a GET against the branch endpoint. Any answer below 500 counts as
/// reachable; transport errors and 5xx count as failures.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, branch: &Branch) -> Result<()> {
        let response = self.client.get(&branch.endpoint).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(Error::BranchUnavailable(format!(
                "{} answered {}",
                branch.code, status
            )));
        }
        Ok(())
    }
}
