//! Provider capability interface.
//!
//! Everything the engines know about the cloud goes through [`Provider`].
//! Implementations classify their failures into [`ProviderError`] variants;
//! the engines decide retries from that classification alone.
//!
//! [`ProviderError`]: crate::error::ProviderError

mod http;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::Attributes;
use crate::credentials::CredentialMaterial;
use crate::error::ProviderResult;

pub use http::HttpProvider;
pub use simulated::{ProviderCall, SimulatedProvider};

/// Tag carrying the environment name on every managed resource.
pub const TAG_ENVIRONMENT: &str = "halyard:environment";

/// Tag carrying the logical resource id on every managed resource.
pub const TAG_RESOURCE: &str = "halyard:resource";

/// A create or update request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    /// Environment the resource belongs to.
    pub environment: String,
    /// Logical id of the resource.
    pub logical_id: String,
    /// Provider resource type.
    pub resource_type: String,
    /// Attributes with references resolved.
    pub attributes: Attributes,
    /// Ownership tags.
    pub tags: BTreeMap<String, String>,
}

impl ResourceRequest {
    /// Creates a request tagged with its environment and logical id.
    #[must_use]
    pub fn new(environment: &str, logical_id: &str, resource_type: &str, attributes: Attributes) -> Self {
        let tags = BTreeMap::from([
            (TAG_ENVIRONMENT.to_string(), environment.to_string()),
            (TAG_RESOURCE.to_string(), logical_id.to_string()),
        ]);
        Self {
            environment: environment.to_string(),
            logical_id: logical_id.to_string(),
            resource_type: resource_type.to_string(),
            attributes,
            tags,
        }
    }
}

/// A resource as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResource {
    /// Provider-side identifier.
    pub provider_id: String,
    /// Provider resource type.
    pub resource_type: String,
    /// Live attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Credential material returned on creation, if any.
    #[serde(default)]
    pub credentials: Option<CredentialMaterial>,
}

/// Something still bound to a resource and blocking its deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment identifier (e.g. a network interface id).
    pub id: String,
    /// Kind of attachment.
    pub kind: String,
    /// What it is bound to, if known.
    #[serde(default)]
    pub attached_to: Option<String>,
}

/// Create/read/update/delete capability over one cloud platform.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Finds an existing resource carrying the request's ownership tags.
    ///
    /// Used before every create so a crash between a provider create and the
    /// state write does not produce a duplicate.
    async fn lookup(&self, request: &ResourceRequest) -> ProviderResult<Option<ProviderResource>>;

    /// Creates a resource.
    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResource>;

    /// Reads a resource's live attributes.
    async fn read(&self, resource_type: &str, provider_id: &str) -> ProviderResult<ProviderResource>;

    /// Updates a resource in place.
    async fn update(&self, provider_id: &str, request: &ResourceRequest) -> ProviderResult<ProviderResource>;

    /// Deletes a resource.
    async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()>;

    /// Whether resources of this type can have detachable sub-attachments.
    fn has_attachments(&self, resource_type: &str) -> bool;

    /// Lists attachments still bound to a resource.
    async fn attachments(&self, resource_type: &str, provider_id: &str) -> ProviderResult<Vec<Attachment>>;

    /// Whether a freshly created or updated resource is ready for dependents.
    async fn is_ready(&self, resource_type: &str, provider_id: &str) -> ProviderResult<bool>;
}

/// Shared handle to a provider.
pub type SharedProvider = Arc<dyn Provider>;
