//! Batata Coordination - lease + watch coordination store contract
//!
//! This crate provides:
//! - The `CoordinationClient` trait (grant / put / get / watch / keep-alive / revoke)
//! - Wire-level key/value, watch and keep-alive types
//! - `MemoryCoordinator`, a complete in-process store with fault injection
//! - `EtcdCoordinator`, an etcd v3 backend (feature `etcd`)

pub mod client;
pub mod error;
pub mod memory;
pub mod types;

#[cfg(feature = "etcd")]
pub mod etcd;

pub use client::CoordinationClient;
pub use error::{CoordinationError, Result};
pub use memory::MemoryCoordinator;
pub use types::*;

#[cfg(feature = "etcd")]
pub use etcd::EtcdCoordinator;
