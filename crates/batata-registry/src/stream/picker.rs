//! Endpoint selection within one instance

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use rand::seq::IndexedRandom;

use crate::model::ServiceInstance;

/// Chooses which of an instance's endpoints to dial.
///
/// Selection never crosses instances: each managed stream belongs to exactly
/// one instance.
pub trait EndpointPicker: Send + Sync + 'static {
    /// Dial address (scheme stripped) for `instance`, or `None` when it has
    /// no endpoints.
    fn pick(&self, instance: &ServiceInstance) -> Option<String>;

    /// Forget any state kept for a removed instance.
    fn forget(&self, _instance_id: &str) {}
}

/// Cycles through each instance's endpoints independently.
#[derive(Default)]
pub struct RoundRobinPicker {
    cursors: DashMap<String, AtomicUsize>,
}

impl RoundRobinPicker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EndpointPicker for RoundRobinPicker {
    fn pick(&self, instance: &ServiceInstance) -> Option<String> {
        let addresses: Vec<&str> = instance.addresses().collect();
        if addresses.is_empty() {
            return None;
        }
        let cursor = self
            .cursors
            .entry(instance.id.clone())
            .or_insert_with(|| AtomicUsize::new(0));
        let n = cursor.fetch_add(1, Ordering::Relaxed);
        Some(addresses[n % addresses.len()].to_string())
    }

    fn forget(&self, instance_id: &str) {
        self.cursors.remove(instance_id);
    }
}

/// Picks a uniformly random endpoint of the instance.
#[derive(Default)]
pub struct RandomPicker;

impl EndpointPicker for RandomPicker {
    fn pick(&self, instance: &ServiceInstance) -> Option<String> {
        let addresses: Vec<&str> = instance.addresses().collect();
        addresses.choose(&mut rand::rng()).map(|a| a.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_is_per_instance() {
        let picker = RoundRobinPicker::new();
        let a = ServiceInstance::new("a", "orders")
            .with_endpoint("grpc://a1:1")
            .with_endpoint("a2:1");
        let b = ServiceInstance::new("b", "orders").with_endpoint("b1:1");

        assert_eq!(picker.pick(&a).as_deref(), Some("a1:1"));
        assert_eq!(picker.pick(&b).as_deref(), Some("b1:1"));
        assert_eq!(picker.pick(&a).as_deref(), Some("a2:1"));
        assert_eq!(picker.pick(&b).as_deref(), Some("b1:1"));
        assert_eq!(picker.pick(&a).as_deref(), Some("a1:1"));

        picker.forget("a");
        assert_eq!(picker.pick(&a).as_deref(), Some("a1:1"));
    }

    #[test]
    fn test_no_endpoints() {
        let empty = ServiceInstance::new("a", "orders");
        assert!(RoundRobinPicker::new().pick(&empty).is_none());
        assert!(RandomPicker.pick(&empty).is_none());
    }

    #[test]
    fn test_random_stays_within_instance() {
        let a = ServiceInstance::new("a", "orders")
            .with_endpoint("a1:1")
            .with_endpoint("a2:1");
        for _ in 0..20 {
            let picked = RandomPicker.pick(&a).unwrap();
            assert!(picked == "a1:1" || picked == "a2:1");
        }
    }
}
