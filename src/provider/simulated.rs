//! In-memory provider with fault injection.
//!
//! Keeps resources in a map and records every mutating call with a global
//! sequence number, so ordering guarantees can be asserted after a run.
//! Faults are keyed by logical id: queued errors per operation, lost create
//! responses, stuck attachments, slow readiness, and out-of-band drift.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use crate::config::Attributes;
use crate::credentials::{CredentialMaterial, CredentialPayload};
use crate::error::{ProviderError, ProviderResult};

use super::{Attachment, Provider, ProviderResource, ResourceRequest};

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCall {
    /// Global sequence number, starting at 1.
    pub seq: u64,
    /// Operation name (`create`, `update`, `delete`, ...).
    pub operation: &'static str,
    /// Logical id the call concerned.
    pub logical_id: String,
}

#[derive(Debug, Clone)]
struct SimResource {
    provider_id: String,
    logical_id: String,
    environment: String,
    resource_type: String,
    attributes: Attributes,
    polls_until_ready: u32,
}

#[derive(Debug, Default)]
struct Inner {
    resources: HashMap<String, SimResource>,
    next_id: u64,
    seq: u64,
    calls: Vec<ProviderCall>,
    faults: HashMap<(&'static str, String), VecDeque<ProviderError>>,
    lost_creates: HashSet<String>,
    stuck: HashSet<String>,
    attachment_types: HashSet<String>,
    readiness_delay: HashMap<String, u32>,
    credential_types: HashMap<String, String>,
}

/// Simulated provider.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl SimulatedProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a fixed delay to every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Declares a resource type as carrying detachable attachments.
    #[must_use]
    pub fn with_attachment_type(self, resource_type: &str) -> Self {
        self.lock().attachment_types.insert(resource_type.to_string());
        self
    }

    /// Makes creates of `resource_type` return credentials for `recipient`.
    #[must_use]
    pub fn with_credentials(self, resource_type: &str, recipient: &str) -> Self {
        self.lock()
            .credential_types
            .insert(resource_type.to_string(), recipient.to_string());
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues `times` failures of `operation` for `logical_id`.
    pub fn fail_next(&self, operation: &'static str, logical_id: &str, error: ProviderError, times: usize) {
        self.lock()
            .faults
            .entry((operation, logical_id.to_string()))
            .or_default()
            .extend(std::iter::repeat_n(error, times));
    }

    /// The next create of `logical_id` succeeds remotely but its response is lost.
    pub fn lose_create_response(&self, logical_id: &str) {
        self.lock().lost_creates.insert(logical_id.to_string());
    }

    /// Keeps an attachment bound to `logical_id` forever.
    pub fn stick_attachment(&self, logical_id: &str) {
        self.lock().stuck.insert(logical_id.to_string());
    }

    /// Releases a stuck attachment.
    pub fn release_attachment(&self, logical_id: &str) {
        self.lock().stuck.remove(logical_id);
    }

    /// Reports `logical_id` as not ready for the first `polls` readiness checks.
    pub fn delay_readiness(&self, logical_id: &str, polls: u32) {
        self.lock().readiness_delay.insert(logical_id.to_string(), polls);
    }

    /// Changes a live attribute out of band.
    pub fn drift(&self, logical_id: &str, key: &str, value: Value) {
        let mut inner = self.lock();
        if let Some(resource) = inner.resources.values_mut().find(|r| r.logical_id == logical_id) {
            resource.attributes.insert(key.to_string(), value);
        }
    }

    /// Removes a resource out of band.
    pub fn remove_out_of_band(&self, logical_id: &str) {
        self.lock().resources.retain(|_, r| r.logical_id != logical_id);
    }

    /// Returns the live resource for a logical id.
    #[must_use]
    pub fn live(&self, logical_id: &str) -> Option<ProviderResource> {
        self.lock()
            .resources
            .values()
            .find(|r| r.logical_id == logical_id)
            .map(to_resource)
    }

    /// Number of live resources.
    #[must_use]
    pub fn resource_count(&self) -> usize {
        self.lock().resources.len()
    }

    /// All recorded calls, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Logical ids of the recorded calls of one operation, in order.
    #[must_use]
    pub fn calls_for(&self, operation: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.logical_id.clone())
            .collect()
    }

    /// Records a call and pops an injected fault for it, if one is queued.
    fn enter(&self, operation: &'static str, logical_id: &str) -> ProviderResult<()> {
        let mut inner = self.lock();
        inner.seq += 1;
        let seq = inner.seq;
        inner.calls.push(ProviderCall {
            seq,
            operation,
            logical_id: logical_id.to_string(),
        });

        if let Some(error) = inner
            .faults
            .get_mut(&(operation, logical_id.to_string()))
            .and_then(VecDeque::pop_front)
        {
            debug!("Simulated {operation} of '{logical_id}' fails: {error}");
            return Err(error);
        }
        Ok(())
    }

    async fn pause(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn logical_id_of(&self, provider_id: &str) -> String {
        self.lock()
            .resources
            .get(provider_id)
            .map_or_else(|| provider_id.to_string(), |r| r.logical_id.clone())
    }
}

fn to_resource(resource: &SimResource) -> ProviderResource {
    ProviderResource {
        provider_id: resource.provider_id.clone(),
        resource_type: resource.resource_type.clone(),
        attributes: resource.attributes.clone(),
        credentials: None,
    }
}

#[async_trait]
impl Provider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn lookup(&self, request: &ResourceRequest) -> ProviderResult<Option<ProviderResource>> {
        self.pause().await;
        self.enter("lookup", &request.logical_id)?;
        Ok(self
            .lock()
            .resources
            .values()
            .find(|r| r.environment == request.environment && r.logical_id == request.logical_id)
            .map(to_resource))
    }

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResource> {
        self.pause().await;
        self.enter("create", &request.logical_id)?;

        let mut inner = self.lock();
        inner.next_id += 1;
        let prefix = request.resource_type.rsplit('.').next().unwrap_or("res");
        let provider_id = format!("{prefix}-{}", inner.next_id);

        let mut attributes = request.attributes.clone();
        attributes.insert(String::from("arn"), Value::String(format!("sim:{provider_id}")));

        let resource = SimResource {
            provider_id: provider_id.clone(),
            logical_id: request.logical_id.clone(),
            environment: request.environment.clone(),
            resource_type: request.resource_type.clone(),
            attributes,
            polls_until_ready: inner.readiness_delay.remove(&request.logical_id).unwrap_or(0),
        };
        let mut created = to_resource(&resource);
        inner.resources.insert(provider_id, resource);

        if inner.lost_creates.remove(&request.logical_id) {
            return Err(ProviderError::transient("connection reset after create"));
        }

        if let Some(recipient) = inner.credential_types.get(&request.resource_type) {
            created.credentials = Some(CredentialMaterial {
                recipient: recipient.clone(),
                payload: CredentialPayload::new(serde_json::json!({
                    "access_key": format!("AK-{}", created.provider_id),
                    "secret": "simulated",
                })),
            });
        }
        Ok(created)
    }

    async fn read(&self, resource_type: &str, provider_id: &str) -> ProviderResult<ProviderResource> {
        self.pause().await;
        let logical_id = self.logical_id_of(provider_id);
        self.enter("read", &logical_id)?;
        self.lock()
            .resources
            .get(provider_id)
            .map(to_resource)
            .ok_or_else(|| ProviderError::not_found(resource_type, provider_id))
    }

    async fn update(&self, provider_id: &str, request: &ResourceRequest) -> ProviderResult<ProviderResource> {
        self.pause().await;
        self.enter("update", &request.logical_id)?;

        let mut inner = self.lock();
        let resource = inner
            .resources
            .get_mut(provider_id)
            .ok_or_else(|| ProviderError::not_found(&request.resource_type, provider_id))?;

        let arn = resource.attributes.get("arn").cloned();
        resource.attributes = request.attributes.clone();
        if let Some(arn) = arn {
            resource.attributes.insert(String::from("arn"), arn);
        }
        Ok(to_resource(resource))
    }

    async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()> {
        self.pause().await;
        let logical_id = self.logical_id_of(provider_id);
        self.enter("delete", &logical_id)?;
        self.lock()
            .resources
            .remove(provider_id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found(resource_type, provider_id))
    }

    fn has_attachments(&self, resource_type: &str) -> bool {
        self.lock().attachment_types.contains(resource_type)
    }

    async fn attachments(&self, _resource_type: &str, provider_id: &str) -> ProviderResult<Vec<Attachment>> {
        self.pause().await;
        let logical_id = self.logical_id_of(provider_id);
        self.enter("attachments", &logical_id)?;

        if self.lock().stuck.contains(&logical_id) {
            return Ok(vec![Attachment {
                id: format!("eni-{provider_id}"),
                kind: String::from("network_interface"),
                attached_to: Some(provider_id.to_string()),
            }]);
        }
        Ok(Vec::new())
    }

    async fn is_ready(&self, resource_type: &str, provider_id: &str) -> ProviderResult<bool> {
        self.pause().await;
        let logical_id = self.logical_id_of(provider_id);
        self.enter("is_ready", &logical_id)?;

        let mut inner = self.lock();
        let resource = inner
            .resources
            .get_mut(provider_id)
            .ok_or_else(|| ProviderError::not_found(resource_type, provider_id))?;
        if resource.polls_until_ready == 0 {
            return Ok(true);
        }
        resource.polls_until_ready -= 1;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> ResourceRequest {
        ResourceRequest::new("dev", id, "network.vpc", Attributes::new())
    }

    #[tokio::test]
    async fn test_create_read_delete() {
        let provider = SimulatedProvider::new();
        let created = provider.create(&request("vpc")).await.expect("create");
        assert!(created.provider_id.starts_with("vpc-"));

        let read = provider.read("network.vpc", &created.provider_id).await.expect("read");
        assert_eq!(read.attributes.get("arn"), created.attributes.get("arn"));

        provider.delete("network.vpc", &created.provider_id).await.expect("delete");
        let err = provider.delete("network.vpc", &created.provider_id).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound { .. }));
        assert_eq!(provider.calls_for("delete"), vec!["vpc", created.provider_id.as_str()]);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let provider = SimulatedProvider::new();
        provider.fail_next("create", "vpc", ProviderError::transient("throttled"), 2);

        assert!(provider.create(&request("vpc")).await.is_err());
        assert!(provider.create(&request("vpc")).await.is_err());
        assert!(provider.create(&request("vpc")).await.is_ok());
        assert_eq!(provider.resource_count(), 1);
    }

    #[tokio::test]
    async fn test_lost_create_is_visible_to_lookup() {
        let provider = SimulatedProvider::new();
        provider.lose_create_response("vpc");

        assert!(provider.create(&request("vpc")).await.is_err());
        let found = provider.lookup(&request("vpc")).await.expect("lookup");
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_readiness_delay() {
        let provider = SimulatedProvider::new();
        provider.delay_readiness("vpc", 2);
        let created = provider.create(&request("vpc")).await.expect("create");

        assert!(!provider.is_ready("network.vpc", &created.provider_id).await.expect("poll"));
        assert!(!provider.is_ready("network.vpc", &created.provider_id).await.expect("poll"));
        assert!(provider.is_ready("network.vpc", &created.provider_id).await.expect("poll"));
    }
}
