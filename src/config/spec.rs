//! Configuration specification types for the desired-state file.
//!
//! This module defines all the structs that map to `halyard.yaml`. Resources
//! arrive here already typed: an id, a provider resource type, a free-form
//! attribute map, and optional explicit dependencies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use ::validator::Validate;

/// Attribute map of a resource. Ordered so hashing and diffs are deterministic.
pub type Attributes = BTreeMap<String, serde_json::Value>;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployConfig {
    /// Target environment.
    pub environment: EnvironmentConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider capability endpoint.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Engine tunables.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Credential hand-off configuration.
    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,
    /// Desired resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
}

/// Environment-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentConfig {
    /// Environment name; this is the lock and state scope.
    pub name: String,
    /// Optional project label used for tagging.
    #[serde(default)]
    pub project: Option<String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider capability endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Base URL of the provider capability API.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

/// Credential hand-off configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialsConfig {
    /// Directory the default sink writes opaque payloads to.
    pub directory: String,
}

/// Engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum concurrent resource operations per dependency level.
    #[validate(range(min = 1, max = 256))]
    pub concurrency: usize,
    /// Attempts per provider operation on transient errors.
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,
    /// First retry delay.
    #[validate(range(min = 1))]
    pub initial_backoff_ms: u64,
    /// Retry delay ceiling.
    #[validate(range(min = 1))]
    pub max_backoff_ms: u64,
    /// Growth factor between retries.
    #[validate(range(min = 1.0, max = 10.0))]
    pub backoff_multiplier: f64,
    /// Timeout for a single provider call.
    #[validate(range(min = 1))]
    pub call_timeout_secs: u64,
    /// Budget for one resource including its retries and polling.
    #[validate(range(min = 1))]
    pub resource_timeout_secs: u64,
    /// Budget for a whole run.
    #[validate(range(min = 1))]
    pub run_timeout_secs: u64,
    /// Lease time-to-live.
    #[validate(range(min = 1))]
    pub lock_ttl_secs: u64,
    /// Interval between lease heartbeats.
    #[validate(range(min = 1))]
    pub heartbeat_interval_secs: u64,
    /// Polls of attachment state before a teardown gives up.
    #[validate(range(min = 1))]
    pub attachment_poll_attempts: u32,
    /// Base interval between attachment polls.
    #[validate(range(min = 1))]
    pub attachment_poll_interval_ms: u64,
    /// Polls of readiness after create/update.
    #[validate(range(min = 1))]
    pub readiness_poll_attempts: u32,
    /// Base interval between readiness polls.
    #[validate(range(min = 1))]
    pub readiness_poll_interval_ms: u64,
    /// How long to wait for a held lock; zero fails fast.
    pub lock_wait_secs: u64,
}

/// A single desired resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    /// Logical id, unique within the environment.
    pub id: String,
    /// Provider resource type (e.g. `network.vpc`).
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Desired attributes. Strings of the form `${id}` or `${id.field}` are references.
    #[serde(default)]
    pub attributes: Attributes,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_token_env() -> String {
    String::from("HALYARD_PROVIDER_TOKEN")
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token_env: default_token_env(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            call_timeout_secs: 60,
            resource_timeout_secs: 900,
            run_timeout_secs: 3600,
            lock_ttl_secs: 300,
            heartbeat_interval_secs: 60,
            attachment_poll_attempts: 30,
            attachment_poll_interval_ms: 2000,
            readiness_poll_attempts: 60,
            readiness_poll_interval_ms: 5000,
            lock_wait_secs: 0,
        }
    }
}

impl EngineConfig {
    /// Lease time-to-live as a duration.
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    /// Heartbeat interval as a duration.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Lock wait budget, `None` when failing fast.
    #[must_use]
    pub const fn lock_wait(&self) -> Option<Duration> {
        if self.lock_wait_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.lock_wait_secs))
        }
    }
}

impl DeployConfig {
    /// Gets a resource spec by id.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&ResourceSpec> {
        self.resources.iter().find(|r| r.id == id)
    }

    /// Returns all resource ids in declaration order.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.id.as_str()).collect()
    }
}

impl ResourceSpec {
    /// Creates a spec with no attributes or dependencies.
    #[must_use]
    pub fn new(id: &str, resource_type: &str) -> Self {
        Self {
            id: id.to_string(),
            resource_type: resource_type.to_string(),
            attributes: Attributes::new(),
            depends_on: Vec::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, id: &str) -> Self {
        self.depends_on.push(id.to_string());
        self
    }
}
