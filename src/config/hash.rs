//! Attribute hashing for change detection.
//!
//! Hashes are computed over a canonical JSON rendering (sorted keys at every
//! depth) so the same attributes always produce the same digest, regardless
//! of how the YAML was written.

use sha2::{Digest, Sha256};

use super::spec::{Attributes, ResourceSpec};

/// Hasher for computing attribute and resource-set hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a resource's identity-relevant desired state.
    ///
    /// Covers the type, the attributes and the explicit dependencies.
    #[must_use]
    pub fn hash_resource(&self, spec: &ResourceSpec) -> String {
        let mut hasher = Sha256::new();
        hasher.update(spec.resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.hash_attributes(&spec.attributes).as_bytes());

        let mut deps: Vec<&str> = spec.depends_on.iter().map(String::as_str).collect();
        deps.sort_unstable();
        deps.dedup();
        for dep in deps {
            hasher.update([0u8]);
            hasher.update(dep.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the hash of an attribute map.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &Attributes) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in attributes {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(canonical_json(value).as_bytes());
            hasher.update([b';']);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a hash over a whole desired resource set.
    #[must_use]
    pub fn hash_resources(&self, specs: &[ResourceSpec]) -> String {
        let mut hashes: Vec<(&str, String)> = specs
            .iter()
            .map(|s| (s.id.as_str(), self.hash_resource(s)))
            .collect();
        hashes.sort_by(|a, b| a.0.cmp(b.0));

        let mut hasher = Sha256::new();
        for (id, hash) in hashes {
            hasher.update(id.as_bytes());
            hasher.update(hash.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Returns a short version of a hash for display.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        &hash[..hash.len().min(12)]
    }
}

/// Renders a JSON value with object keys sorted at every depth.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        serde_json::Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_deterministic() {
        let hasher = ConfigHasher::new();
        let spec = ResourceSpec::new("vpc", "network.vpc").with_attribute("cidr", "10.0.0.0/16");

        assert_eq!(hasher.hash_resource(&spec), hasher.hash_resource(&spec));
        assert_eq!(hasher.hash_resource(&spec).len(), 64);
    }

    #[test]
    fn test_hash_changes_with_attributes() {
        let hasher = ConfigHasher::new();
        let a = ResourceSpec::new("vpc", "network.vpc").with_attribute("cidr", "10.0.0.0/16");
        let b = ResourceSpec::new("vpc", "network.vpc").with_attribute("cidr", "10.1.0.0/16");

        assert_ne!(hasher.hash_resource(&a), hasher.hash_resource(&b));
    }

    #[test]
    fn test_nested_object_key_order_is_irrelevant() {
        let hasher = ConfigHasher::new();
        let mut a = Attributes::new();
        a.insert(String::from("tags"), json!({"team": "core", "env": "prod"}));
        let mut b = Attributes::new();
        b.insert(String::from("tags"), json!({"env": "prod", "team": "core"}));

        assert_eq!(hasher.hash_attributes(&a), hasher.hash_attributes(&b));
    }

    #[test]
    fn test_resource_set_hash_ignores_order() {
        let hasher = ConfigHasher::new();
        let vpc = ResourceSpec::new("vpc", "network.vpc");
        let subnet = ResourceSpec::new("subnet", "network.subnet").depends_on("vpc");

        assert_eq!(
            hasher.hash_resources(&[vpc.clone(), subnet.clone()]),
            hasher.hash_resources(&[subnet, vpc])
        );
    }
}
