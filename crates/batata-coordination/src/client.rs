//! Coordination client contract

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{GetResponse, KeepAliveStream, LeaseId, Revision, WatchStream};

/// Primitives a lease + watch coordination store (etcd-shaped) exposes.
///
/// The client is assumed to be connected and health-checked by its owner.
#[async_trait]
pub trait CoordinationClient: Send + Sync + 'static {
    /// Acquire a lease that expires after `ttl_secs` unless renewed.
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Write `value` under `key`, optionally attached to a lease.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> Result<Revision>;

    /// Read every key starting with `prefix`.
    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse>;

    /// Watch every key starting with `prefix`.
    ///
    /// `from_revision == 0` watches from the current revision. A start revision
    /// that was compacted away is reported as `CoordinationError::Compacted`,
    /// either here or as the first item of the stream.
    async fn watch_prefix(&self, prefix: &str, from_revision: Revision) -> Result<WatchStream>;

    /// Keep a lease alive.
    ///
    /// Renewals are driven by the implementation; each acknowledgement is
    /// yielded on the stream. The stream ends when the lease can no longer be
    /// renewed, and dropping it stops renewing.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream>;

    /// Revoke a lease, deleting every key attached to it.
    async fn revoke(&self, lease: LeaseId) -> Result<()>;
}
