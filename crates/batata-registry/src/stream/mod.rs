//! Long-lived per-instance streams
//!
//! [`StreamManager`] keeps one [`BidiStream`] open to every live instance of a
//! service and rebuilds it when it breaks. [`GrpcBidiStream`] adapts a tonic
//! bidirectional streaming call to the trait.

pub mod grpc;
pub mod manager;
pub mod picker;

use async_trait::async_trait;

pub use grpc::GrpcBidiStream;
pub use manager::{StreamFactory, StreamManager, StreamManagerConfig};
pub use picker::{EndpointPicker, RandomPicker, RoundRobinPicker};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("failed to open stream: {0}")]
    Open(String),

    #[error("stream status: {0}")]
    Status(#[from] tonic::Status),

    #[error("stream transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("stream closed")]
    Closed,
}

/// A bidirectional stream the manager can supervise.
#[async_trait]
pub trait BidiStream: Send + Sync + 'static {
    /// Resolve once the stream has ended, whatever the cause.
    async fn closed(&self);

    /// Terminate the stream. Calling it again has no effect.
    async fn close(&self) -> Result<(), StreamError>;
}
