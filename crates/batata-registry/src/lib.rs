//! Batata Registry - lease-backed service registration and discovery
//!
//! This crate provides:
//! - `Registry`: lease-backed registration with keep-alive, discovery and
//!   self-healing watches over a `CoordinationClient`
//! - A `batata://` resolver feeding tonic balance channels, plus the
//!   process-wide scheme table it is registered in
//! - `ServiceConnection`: load-balanced client connections with a
//!   connectivity state
//! - `StreamManager`: one long-lived bidirectional stream per live instance,
//!   rebuilt on failure

pub mod config;
pub mod connection;
pub mod error;
mod lease;
pub mod model;
pub mod registry;
pub mod resolver;
pub mod stream;
pub mod watch;

pub use config::RegistryConfig;
pub use connection::{ConnectivityState, DialOptions, ServiceConnection};
pub use error::{RegistryError, Result};
pub use model::{ServiceEvent, ServiceInstance};
pub use registry::Registry;
pub use resolver::{
    AddressSink, BalanceSink, RegistryResolverBuilder, ResolverBuilder, ResolverHandle,
    ResolverTarget, SCHEME, SchemeRegistry,
};
pub use stream::{
    BidiStream, EndpointPicker, GrpcBidiStream, RandomPicker, RoundRobinPicker, StreamError,
    StreamFactory, StreamManager, StreamManagerConfig,
};
pub use watch::ServiceWatcher;

pub use batata_coordination as coordination;
