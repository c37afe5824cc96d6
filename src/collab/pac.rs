//! PAC client collaborator
//!
//! The engine hands a document to the certification authority and gets back
//! a fiscal UUID plus the signed document. It never looks inside either.

use crate::common::Result;
use crate::coordinator::branch::{Branch, Certificate};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// A successful stamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacStamp {
    /// Fiscal folio UUID assigned by the PAC
    pub uuid: String,
    pub signed_document: Bytes,
}

#[async_trait]
pub trait PacClient: Send + Sync {
    /// Stamp `payload` on behalf of `branch`, signing with `certificate`.
    ///
    /// Implementations should honor `timeout`; the failover coordinator
    /// also enforces it from the outside.
    async fn stamp(
        &self,
        branch: &Branch,
        certificate: &Certificate,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<PacStamp>;
}
