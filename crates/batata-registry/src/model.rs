//! Service instance and event model, plus the store key layout
//!
//! Instances are stored as JSON under `<namespace>/<service_name>/<instance_id>`.

use std::collections::HashMap;

use batata_coordination::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RegistryError, Result};

/// Separator between key segments
pub const KEY_SEPARATOR: char = '/';

/// A registered network-reachable instance of a logical service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique within `name`
    pub id: String,
    /// Logical service name
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Free-form tags such as zone, region or weight
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Ordered dial targets, optionally scheme-prefixed (`grpc://10.0.0.1:9000`)
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Reject instances that cannot be stored under the key layout.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(RegistryError::InvalidInstance(
                "instance id must not be empty".to_string(),
            ));
        }
        if self.id.contains(KEY_SEPARATOR) {
            return Err(RegistryError::InvalidInstance(format!(
                "instance id '{}' must not contain '{}'",
                self.id, KEY_SEPARATOR
            )));
        }
        validate_service_name(&self.name)
            .map_err(|_| RegistryError::InvalidInstance(format!("invalid name '{}'", self.name)))
    }

    /// Endpoints with any transport scheme stripped.
    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.endpoints.iter().map(|e| strip_scheme(e))
    }
}

/// A change to a watched service.
///
/// For `Delete` only `id` and `name` are populated: the store does not return
/// the deleted value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEvent {
    Put(ServiceInstance),
    Delete(ServiceInstance),
}

impl ServiceEvent {
    pub fn instance(&self) -> &ServiceInstance {
        match self {
            ServiceEvent::Put(instance) | ServiceEvent::Delete(instance) => instance,
        }
    }

    pub fn is_put(&self) -> bool {
        matches!(self, ServiceEvent::Put(_))
    }
}

pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(KEY_SEPARATOR) {
        return Err(RegistryError::InvalidServiceName(name.to_string()));
    }
    Ok(())
}

/// Key prefix grouping every instance of a service.
///
/// Ends with the separator so `orders` does not match `orders-v2`.
pub fn service_prefix(namespace: &str, service_name: &str) -> String {
    format!(
        "{}{}{}{}",
        namespace.trim_end_matches(KEY_SEPARATOR),
        KEY_SEPARATOR,
        service_name,
        KEY_SEPARATOR
    )
}

/// Full key of one instance.
pub fn instance_key(namespace: &str, service_name: &str, instance_id: &str) -> String {
    format!("{}{}", service_prefix(namespace, service_name), instance_id)
}

/// Instance id encoded in a key below `prefix`, if any.
pub fn instance_id_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)
        .filter(|id| !id.is_empty() && !id.contains(KEY_SEPARATOR))
}

/// Decode one stored record.
///
/// Malformed records are skipped with a warning so one bad writer cannot hide
/// the rest of a service.
pub(crate) fn decode_instance(kv: &KeyValue) -> Option<ServiceInstance> {
    match serde_json::from_slice::<ServiceInstance>(&kv.value) {
        Ok(instance) => Some(instance),
        Err(e) => {
            warn!(key = %kv.key, error = %e, "Skipping malformed service record");
            None
        }
    }
}

/// Strip a transport scheme (`grpc://`, `http://`, ...) from an endpoint.
pub fn strip_scheme(endpoint: &str) -> &str {
    match endpoint.find("://") {
        Some(pos) => &endpoint[pos + 3..],
        None => endpoint,
    }
}
