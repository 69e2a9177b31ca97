//! Name resolution for registry-backed RPC targets
//!
//! A resolver turns the registry's view of one service into the address list
//! the RPC client balances over. Builders are looked up by target scheme in a
//! process-wide [`SchemeRegistry`].

pub mod balance;
pub mod registry_resolver;
pub mod scheme;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{RegistryError, Result};
use crate::model::{ServiceInstance, strip_scheme, validate_service_name};

pub use balance::BalanceSink;
pub use registry_resolver::RegistryResolverBuilder;
pub use scheme::SchemeRegistry;

/// Scheme served by the registry resolver
pub const SCHEME: &str = "batata";

/// A parsed `<scheme>://[authority]/<service_name>` target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolverTarget {
    pub scheme: String,
    pub authority: String,
    pub service_name: String,
}

impl ResolverTarget {
    /// Target of `service_name` under the registry scheme.
    pub fn for_service(service_name: &str) -> Self {
        Self {
            scheme: SCHEME.to_string(),
            authority: String::new(),
            service_name: service_name.to_string(),
        }
    }

    pub fn parse(target: &str) -> Result<Self> {
        let (scheme, rest) = target
            .split_once("://")
            .ok_or_else(|| RegistryError::InvalidTarget(format!("missing scheme: {}", target)))?;
        if scheme.is_empty() {
            return Err(RegistryError::InvalidTarget(format!(
                "empty scheme: {}",
                target
            )));
        }

        let (authority, path) = rest.split_once('/').ok_or_else(|| {
            RegistryError::InvalidTarget(format!("missing service name: {}", target))
        })?;
        let service_name = path.trim_matches('/');
        validate_service_name(service_name)
            .map_err(|_| RegistryError::InvalidTarget(format!("bad service name: {}", target)))?;

        Ok(Self {
            scheme: scheme.to_string(),
            authority: authority.to_string(),
            service_name: service_name.to_string(),
        })
    }
}

impl fmt::Display for ResolverTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.service_name)
    }
}

/// The RPC client's side of resolution.
pub trait AddressSink: Send + Sync + 'static {
    /// Replace the full set of addresses to balance over.
    fn update_addresses(&self, addresses: Vec<String>);
}

/// Creates resolvers for one target scheme.
pub trait ResolverBuilder: Send + Sync + 'static {
    fn scheme(&self) -> &str;

    /// Start resolving `target`, pushing address sets into `sink`.
    fn build(&self, target: &ResolverTarget, sink: Arc<dyn AddressSink>) -> Result<ResolverHandle>;
}

/// Control handle on a running resolver.
pub struct ResolverHandle {
    refresh: Arc<Notify>,
    token: CancellationToken,
    tracker: TaskTracker,
}

impl ResolverHandle {
    pub fn new(refresh: Arc<Notify>, token: CancellationToken, tracker: TaskTracker) -> Self {
        Self {
            refresh,
            token,
            tracker,
        }
    }

    /// Ask the resolver to re-read the service immediately.
    pub fn resolve_now(&self) {
        self.refresh.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop resolving and wait for the resolver task to exit.
    pub async fn close(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for ResolverHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Dial addresses of `instances`, schemes stripped, duplicates removed,
/// first occurrence order kept.
pub fn normalize_endpoints<'a>(
    instances: impl IntoIterator<Item = &'a ServiceInstance>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    instances
        .into_iter()
        .flat_map(|instance| instance.endpoints.iter())
        .map(|endpoint| strip_scheme(endpoint))
        .filter(|address| !address.is_empty() && seen.insert(*address))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_target() {
        let target = ResolverTarget::parse("batata:///orders").unwrap();
        assert_eq!(target.scheme, "batata");
        assert_eq!(target.authority, "");
        assert_eq!(target.service_name, "orders");
        assert_eq!(target.to_string(), "batata:///orders");

        let target = ResolverTarget::parse("dns://resolver.local/payments").unwrap();
        assert_eq!(target.authority, "resolver.local");
        assert_eq!(target.service_name, "payments");

        assert_eq!(
            ResolverTarget::for_service("orders"),
            ResolverTarget::parse("batata:///orders").unwrap()
        );
    }

    #[test]
    fn test_parse_invalid_targets() {
        for target in ["orders", "://orders", "batata://", "batata:///", "batata:///a/b"] {
            assert!(
                matches!(
                    ResolverTarget::parse(target),
                    Err(RegistryError::InvalidTarget(_))
                ),
                "{} should be rejected",
                target
            );
        }
    }

    #[test]
    fn test_normalize_endpoints() {
        let a = ServiceInstance::new("a", "orders")
            .with_endpoint("grpc://10.0.0.1:9000")
            .with_endpoint("10.0.0.2:9000");
        let b = ServiceInstance::new("b", "orders")
            .with_endpoint("http://10.0.0.2:9000")
            .with_endpoint("10.0.0.3:9000");

        assert_eq!(
            normalize_endpoints([&a, &b]),
            vec!["10.0.0.1:9000", "10.0.0.2:9000", "10.0.0.3:9000"]
        );
        assert!(normalize_endpoints(std::iter::empty()).is_empty());
    }

    proptest! {
        #[test]
        fn normalized_endpoints_are_unique_and_scheme_free(
            addrs in proptest::collection::vec("(grpc://|http://)?[a-c]:[1-3]", 0..12)
        ) {
            let instance = addrs
                .iter()
                .fold(ServiceInstance::new("a", "orders"), |i, a| i.with_endpoint(a.clone()));
            let normalized = normalize_endpoints([&instance]);

            let unique: HashSet<_> = normalized.iter().collect();
            prop_assert_eq!(unique.len(), normalized.len());
            prop_assert!(normalized.iter().all(|a| !a.contains("://")));
        }
    }
}
