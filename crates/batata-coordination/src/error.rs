//! Coordination store error types

use crate::types::{LeaseId, Revision};

/// Error type for coordination store operations
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("required revision has been compacted (compact revision: {compact_revision})")]
    Compacted { compact_revision: Revision },

    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[cfg(feature = "etcd")]
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
}

impl CoordinationError {
    /// Whether the error reports a watch start revision that is no longer in history.
    pub fn is_compacted(&self) -> bool {
        matches!(self, CoordinationError::Compacted { .. })
    }
}

pub type Result<T> = std::result::Result<T, CoordinationError>;
