//! Process-wide table of resolver builders keyed by scheme
//!
//! The table is a process global because RPC targets are plain strings: any
//! dial site in the process must be able to find the builder for `batata://`.
//! The registry installs its builder on construction and removes it on close,
//! and because only one registry may be active at a time the entry has a
//! single owner.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;
use tracing::debug;

use super::ResolverBuilder;

static GLOBAL: LazyLock<SchemeRegistry> = LazyLock::new(SchemeRegistry::new);

#[derive(Default)]
pub struct SchemeRegistry {
    builders: RwLock<HashMap<String, Arc<dyn ResolverBuilder>>>,
}

impl SchemeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide table.
    pub fn global() -> &'static SchemeRegistry {
        &GLOBAL
    }

    /// Install `builder` under its scheme, replacing any previous builder.
    pub fn register(&self, builder: Arc<dyn ResolverBuilder>) {
        let scheme = builder.scheme().to_string();
        debug!(scheme = %scheme, "Resolver builder registered");
        self.builders.write().insert(scheme, builder);
    }

    pub fn deregister(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        let removed = self.builders.write().remove(scheme);
        if removed.is_some() {
            debug!(scheme = %scheme, "Resolver builder deregistered");
        }
        removed
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.read().get(scheme).cloned()
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.builders.read().contains_key(scheme)
    }
}
