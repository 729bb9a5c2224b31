//! HTTP/JSON provider capability client.
//!
//! Talks to a REST gateway exposing the capability interface:
//!
//! | Call | Request |
//! |---|---|
//! | capabilities | `GET /v1/capabilities` |
//! | lookup | `GET /v1/lookup?environment=..&resource=..&type=..` |
//! | create | `POST /v1/resources` |
//! | read | `GET /v1/resources/{type}/{id}` |
//! | update | `PUT /v1/resources/{type}/{id}` |
//! | delete | `DELETE /v1/resources/{type}/{id}` |
//! | attachments | `GET /v1/resources/{type}/{id}/attachments` |
//! | readiness | `GET /v1/resources/{type}/{id}/status` |

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url, header};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, ProviderResult};

use super::{Attachment, Provider, ProviderResource, ResourceRequest};

/// API version prefix.
const API_PREFIX: &str = "v1";

#[derive(Debug, Deserialize)]
struct Capabilities {
    #[serde(default)]
    attachment_types: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentList {
    #[serde(default)]
    attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
struct ReadyStatus {
    ready: bool,
}

/// Provider backed by an HTTP capability gateway.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
    base: Url,
    token: String,
    attachment_types: HashSet<String>,
}

impl HttpProvider {
    /// Creates a client without contacting the gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is not a valid base URL or the HTTP
    /// client cannot be built.
    pub fn new(endpoint: &str, token: &str, call_timeout: Duration) -> ProviderResult<Self> {
        let mut base = Url::parse(endpoint)
            .map_err(|e| ProviderError::invalid_spec(format!("invalid provider endpoint '{endpoint}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(ProviderError::invalid_spec(format!(
                "provider endpoint '{endpoint}' cannot be a base URL"
            )));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .timeout(call_timeout)
            .build()
            .map_err(|e| ProviderError::transient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            token: token.to_string(),
            attachment_types: HashSet::new(),
        })
    }

    /// Creates a client and loads the gateway's capabilities.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be built or the capabilities
    /// request fails.
    pub async fn connect(endpoint: &str, token: &str, call_timeout: Duration) -> ProviderResult<Self> {
        let mut provider = Self::new(endpoint, token, call_timeout)?;
        let caps: Capabilities = provider.send_json(provider.request(Method::GET, &["capabilities"])?).await?;
        debug!("Provider gateway reports attachment types: {:?}", caps.attachment_types);
        provider.attachment_types = caps.attachment_types.into_iter().collect();
        Ok(provider)
    }

    /// Declares which resource types carry detachable attachments.
    #[must_use]
    pub fn with_attachment_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attachment_types = types.into_iter().map(Into::into).collect();
        self
    }

    fn url(&self, segments: &[&str]) -> ProviderResult<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| ProviderError::invalid_spec("provider endpoint cannot be a base URL"))?;
            path.pop_if_empty().push(API_PREFIX).extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, segments: &[&str]) -> ProviderResult<RequestBuilder> {
        let url = self.url(segments)?;
        trace!("{method} {url}");
        Ok(self
            .client
            .request(method, url)
            .header(header::AUTHORIZATION, format!("Bearer {}", self.token))
            .header(header::ACCEPT, "application/json"))
    }

    async fn send(&self, request: RequestBuilder) -> ProviderResult<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::transient(format!("request timed out: {e}"))
            } else {
                ProviderError::transient(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ProviderResult<T> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| ProviderError::transient(format!("invalid response body: {e}")))
    }
}

/// Maps an HTTP failure status to an error class.
fn classify_status(status: StatusCode, body: &str) -> ProviderError {
    let message = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {body}", status.as_u16())
    };

    match status.as_u16() {
        401 | 403 => ProviderError::permission(message),
        400 | 422 => ProviderError::invalid_spec(message),
        404 => ProviderError::not_found("resource", &message),
        // 409: another operation on the resource is still in flight.
        408 | 409 | 429 | 500..=599 => ProviderError::transient(message),
        _ => ProviderError::invalid_spec(message),
    }
}

fn not_found(err: ProviderError, resource_type: &str, provider_id: &str) -> ProviderError {
    match err {
        ProviderError::NotFound { .. } => ProviderError::not_found(resource_type, provider_id),
        other => other,
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn lookup(&self, request: &ResourceRequest) -> ProviderResult<Option<ProviderResource>> {
        let builder = self.request(Method::GET, &["lookup"])?.query(&[
            ("environment", request.environment.as_str()),
            ("resource", request.logical_id.as_str()),
            ("type", request.resource_type.as_str()),
        ]);

        match self.send_json(builder).await {
            Ok(resource) => Ok(Some(resource)),
            Err(ProviderError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<ProviderResource> {
        debug!("POST create {} '{}'", request.resource_type, request.logical_id);
        self.send_json(self.request(Method::POST, &["resources"])?.json(request))
            .await
    }

    async fn read(&self, resource_type: &str, provider_id: &str) -> ProviderResult<ProviderResource> {
        self.send_json(self.request(Method::GET, &["resources", resource_type, provider_id])?)
            .await
            .map_err(|e| not_found(e, resource_type, provider_id))
    }

    async fn update(&self, provider_id: &str, request: &ResourceRequest) -> ProviderResult<ProviderResource> {
        debug!("PUT update {} '{}'", request.resource_type, request.logical_id);
        let builder = self
            .request(Method::PUT, &["resources", &request.resource_type, provider_id])?
            .json(request);
        self.send_json(builder)
            .await
            .map_err(|e| not_found(e, &request.resource_type, provider_id))
    }

    async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()> {
        debug!("DELETE {resource_type} '{provider_id}'");
        self.send(self.request(Method::DELETE, &["resources", resource_type, provider_id])?)
            .await
            .map(|_| ())
            .map_err(|e| not_found(e, resource_type, provider_id))
    }

    fn has_attachments(&self, resource_type: &str) -> bool {
        self.attachment_types.contains(resource_type)
    }

    async fn attachments(&self, resource_type: &str, provider_id: &str) -> ProviderResult<Vec<Attachment>> {
        let list: AttachmentList = self
            .send_json(self.request(Method::GET, &["resources", resource_type, provider_id, "attachments"])?)
            .await
            .map_err(|e| not_found(e, resource_type, provider_id))?;
        Ok(list.attachments)
    }

    async fn is_ready(&self, resource_type: &str, provider_id: &str) -> ProviderResult<bool> {
        let status: ReadyStatus = self
            .send_json(self.request(Method::GET, &["resources", resource_type, provider_id, "status"])?)
            .await
            .map_err(|e| not_found(e, resource_type, provider_id))?;
        Ok(status.ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Attributes;
    use serde_json::json;
    use wiremock::matchers::{bearer_token, body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn provider(server: &MockServer) -> HttpProvider {
        HttpProvider::new(&server.uri(), "secret-token", TIMEOUT).expect("provider")
    }

    fn request() -> ResourceRequest {
        let mut attributes = Attributes::new();
        attributes.insert(String::from("cidr"), json!("10.0.0.0/16"));
        ResourceRequest::new("dev", "vpc", "network.vpc", attributes)
    }

    #[tokio::test]
    async fn test_create_sends_tagged_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/resources"))
            .and(bearer_token("secret-token"))
            .and(body_partial_json(json!({
                "logical_id": "vpc",
                "tags": {"halyard:environment": "dev", "halyard:resource": "vpc"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "provider_id": "vpc-1",
                "resource_type": "network.vpc",
                "attributes": {"cidr": "10.0.0.0/16"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = provider(&server).create(&request()).await.expect("create");
        assert_eq!(created.provider_id, "vpc-1");
        assert!(created.credentials.is_none());
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        for (status, id) in [(429, "throttled"), (503, "down"), (409, "busy"), (403, "denied"), (422, "bad")] {
            Mock::given(method("GET"))
                .and(path(format!("/v1/resources/network.vpc/{id}")))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }

        let provider = provider(&server);
        let read = |id: &'static str| {
            let provider = provider.clone();
            async move { provider.read("network.vpc", id).await.unwrap_err() }
        };

        assert!(read("throttled").await.is_retryable());
        assert!(read("down").await.is_retryable());
        assert!(read("busy").await.is_retryable());
        assert!(matches!(read("denied").await, ProviderError::Permission { .. }));
        assert!(matches!(read("bad").await, ProviderError::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn test_missing_resource_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/resources/network.vpc/vpc-9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = provider(&server).delete("network.vpc", "vpc-9").await.unwrap_err();
        assert_eq!(err, ProviderError::not_found("network.vpc", "vpc-9"));
    }

    #[tokio::test]
    async fn test_lookup_absent_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/lookup"))
            .and(query_param("resource", "vpc"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        assert!(provider(&server).lookup(&request()).await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn test_connect_loads_attachment_types() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/capabilities"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "attachment_types": ["compute.load_balancer"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/resources/compute.load_balancer/lb-1/attachments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "attachments": [{"id": "eni-1", "kind": "network_interface"}]
            })))
            .mount(&server)
            .await;

        let provider = HttpProvider::connect(&server.uri(), "t", TIMEOUT).await.expect("connect");
        assert!(provider.has_attachments("compute.load_balancer"));
        assert!(!provider.has_attachments("network.vpc"));

        let attachments = provider
            .attachments("compute.load_balancer", "lb-1")
            .await
            .expect("attachments");
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].id, "eni-1");
    }

    #[test]
    fn test_endpoint_with_path_prefix() {
        let provider = HttpProvider::new("http://gw.local/api", "t", TIMEOUT).expect("provider");
        let url = provider.url(&["resources", "network.vpc", "a b"]).expect("url");
        assert_eq!(url.as_str(), "http://gw.local/api/v1/resources/network.vpc/a%20b");
    }
}
