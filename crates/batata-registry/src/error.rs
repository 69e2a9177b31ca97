//! Registry error types

use std::time::Duration;

use batata_coordination::CoordinationError;

/// Error type for registry, resolver and stream manager operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid service instance: {0}")]
    InvalidInstance(String),

    #[error("invalid TTL {0:?}: must be zero (default) or at least one second")]
    InvalidTtl(Duration),

    #[error("invalid service name: '{0}'")]
    InvalidServiceName(String),

    #[error("invalid resolver target: {0}")]
    InvalidTarget(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("instance '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("instance '{0}' not found")]
    NotFound(String),

    #[error("registry is closed")]
    Closed,

    #[error("another registry is already active in this process")]
    AlreadyActive,

    #[error("already started")]
    AlreadyStarted,

    #[error("no resolver registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("{op} failed: {source}")]
    Coordination {
        op: &'static str,
        #[source]
        source: CoordinationError,
    },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("deadline exceeded while waiting for connection to become ready")]
    DeadlineExceeded,

    #[error("stream error: {0}")]
    Stream(#[from] crate::stream::StreamError),
}

impl RegistryError {
    /// Wrap a coordination store failure with the operation that produced it.
    pub fn coordination(op: &'static str) -> impl FnOnce(CoordinationError) -> Self {
        move |source| RegistryError::Coordination { op, source }
    }
}

impl From<config::ConfigError> for RegistryError {
    fn from(err: config::ConfigError) -> Self {
        RegistryError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
