//! S3-based state storage backend.
//!
//! This module provides a remote state storage using AWS S3 (or compatible services)
//! for distributed deployments and team collaboration. Conditional writes use
//! `If-None-Match: *` for creation and `If-Match: <etag>` for replacement, so
//! concurrent writers are arbitrated by the bucket itself.
//!
//! Layout under the configured prefix:
//!
//! ```text
//! <prefix><scope>/state.json
//! <prefix><scope>/lease.json
//! <prefix><scope>/audit/<timestamp>-<uuid>.json
//! ```

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{HalyardError, Result, StateError};
use crate::lock::{LeaseCondition, LockLease};

use super::store::StateStore;
use super::types::{AuditEntry, EnvironmentState, STATE_VERSION};

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lease key suffix.
const LEASE_KEY: &str = "lease.json";

/// Audit key prefix.
const AUDIT_PREFIX: &str = "audit/";

const BACKEND: &str = "s3";

/// HTTP statuses S3 returns when a conditional write loses.
const PRECONDITION_FAILED: u16 = 412;
const CONDITIONAL_CONFLICT: u16 = 409;

/// An object body together with its entity tag.
struct Versioned {
    content: String,
    etag: Option<String>,
}

/// Precondition for a put.
enum PutCondition<'a> {
    /// The object must not exist.
    Create,
    /// The object must still have this entity tag.
    Replace(&'a str),
    /// Unconditional.
    Overwrite,
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

/// Returns true if the SDK error is a lost precondition.
fn is_precondition_failure<E>(err: &SdkError<E, HttpResponse>) -> bool {
    err.raw_response()
        .is_some_and(|r| matches!(r.status().as_u16(), PRECONDITION_FAILED | CONDITIONAL_CONFLICT))
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    /// Gets the full S3 key for a file of a scope.
    fn key(&self, scope: &str, file: &str) -> String {
        format!("{}{scope}/{file}", self.prefix)
    }

    /// Gets an object and its entity tag.
    async fn get_object(&self, key: &str) -> Result<Option<Versioned>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    StateError::backend(BACKEND, format!("Failed to read S3 object: {e}"))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| StateError::Corrupted {
                    message: format!("Invalid UTF-8 in S3 object: {e}"),
                })?;

                Ok(Some(Versioned { content, etag }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::backend(BACKEND, format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object under a precondition.
    ///
    /// A lost precondition is reported as a conflict on `scope`.
    async fn put_object(&self, scope: &str, key: &str, content: &str, condition: PutCondition<'_>) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");

        request = match condition {
            PutCondition::Create => request.if_none_match("*"),
            PutCondition::Replace(etag) => request.if_match(etag),
            PutCondition::Overwrite => request,
        };

        match request.send().await {
            Ok(_) => Ok(()),
            Err(e) if is_precondition_failure(&e) => {
                Err(StateError::conflict(scope, format!("precondition failed on {key}")).into())
            }
            Err(e) => Err(StateError::backend(BACKEND, format!("S3 put error: {e}")).into()),
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::backend(BACKEND, format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StateError::backend(BACKEND, format!("S3 head error: {service_err}")).into())
                }
            }
        }
    }

    fn parse<T: serde::de::DeserializeOwned>(content: &str, what: &str) -> Result<T> {
        serde_json::from_str(content).map_err(|e| {
            HalyardError::State(StateError::Corrupted {
                message: format!("Failed to parse {what}: {e}"),
            })
        })
    }

    fn serialize<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
        serde_json::to_string_pretty(value)
            .map_err(|e| StateError::serialization(format!("Failed to serialize {what}: {e}")).into())
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load(&self, scope: &str) -> Result<Option<EnvironmentState>> {
        let key = self.key(scope, STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(object) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let state: EnvironmentState = Self::parse(&object.content, "state")?;
        if state.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }
            .into());
        }

        debug!("Loaded state for environment {} (revision {})", state.environment, state.revision);
        Ok(Some(state))
    }

    async fn save(&self, state: &EnvironmentState, expected_revision: u64) -> Result<()> {
        let scope = state.environment.as_str();
        let key = self.key(scope, STATE_KEY);
        let content = Self::serialize(state, "state")?;

        let current = self.get_object(&key).await?;
        match (&current, expected_revision) {
            (None, 0) => self.put_object(scope, &key, &content, PutCondition::Create).await?,
            (None, expected) => {
                return Err(StateError::conflict(scope, format!("expected revision {expected}, found none")).into());
            }
            (Some(object), expected) => {
                let stored: EnvironmentState = Self::parse(&object.content, "state")?;
                if stored.revision != expected {
                    return Err(StateError::conflict(
                        scope,
                        format!("expected revision {expected}, found {}", stored.revision),
                    )
                    .into());
                }
                let condition = object
                    .etag
                    .as_deref()
                    .map_or(PutCondition::Overwrite, PutCondition::Replace);
                self.put_object(scope, &key, &content, condition).await?;
            }
        }

        debug!("Saved state to s3://{}/{key} (revision {})", self.bucket, state.revision);
        Ok(())
    }

    async fn delete(&self, scope: &str) -> Result<()> {
        let key = self.key(scope, STATE_KEY);
        info!("Deleting state from s3://{}/{key}", self.bucket);
        self.delete_object(&key).await
    }

    async fn exists(&self, scope: &str) -> Result<bool> {
        self.object_exists(&self.key(scope, STATE_KEY)).await
    }

    async fn read_lease(&self, scope: &str) -> Result<Option<LockLease>> {
        let key = self.key(scope, LEASE_KEY);
        match self.get_object(&key).await? {
            Some(object) => Ok(Some(Self::parse(&object.content, "lease")?)),
            None => Ok(None),
        }
    }

    async fn write_lease(&self, lease: &LockLease, condition: &LeaseCondition) -> Result<()> {
        let scope = lease.scope.as_str();
        let key = self.key(scope, LEASE_KEY);
        let content = Self::serialize(lease, "lease")?;

        if *condition == LeaseCondition::Absent {
            return self.put_object(scope, &key, &content, PutCondition::Create).await;
        }

        let current = self.get_object(&key).await?;
        let stored: Option<LockLease> = match &current {
            Some(object) => Some(Self::parse(&object.content, "lease")?),
            None => None,
        };
        if !condition.matches(stored.as_ref()) {
            return Err(StateError::conflict(scope, "lease condition not met").into());
        }

        let put_condition = match current.as_ref().and_then(|o| o.etag.as_deref()) {
            Some(etag) => PutCondition::Replace(etag),
            None if current.is_none() => PutCondition::Create,
            None => PutCondition::Overwrite,
        };
        self.put_object(scope, &key, &content, put_condition).await
    }

    async fn delete_lease(&self, scope: &str, condition: &LeaseCondition) -> Result<bool> {
        let key = self.key(scope, LEASE_KEY);
        let Some(object) = self.get_object(&key).await? else {
            return Ok(false);
        };

        let stored: LockLease = Self::parse(&object.content, "lease")?;
        if !condition.matches(Some(&stored)) {
            return Ok(false);
        }

        self.delete_object(&key).await?;
        Ok(true)
    }

    async fn append_audit(&self, scope: &str, entry: &AuditEntry) -> Result<()> {
        let name = format!(
            "{AUDIT_PREFIX}{}-{}.json",
            entry.timestamp.format("%Y%m%dT%H%M%S%.6fZ"),
            &Uuid::new_v4().to_string()[..8]
        );
        let key = self.key(scope, &name);
        let content = Self::serialize(entry, "audit entry")?;
        self.put_object(scope, &key, &content, PutCondition::Create).await
    }

    async fn list_audit(&self, scope: &str) -> Result<Vec<AuditEntry>> {
        let prefix = self.key(scope, AUDIT_PREFIX);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StateError::backend(BACKEND, format!("S3 list error: {e}")))?;

            keys.extend(response.contents().iter().filter_map(|o| o.key().map(str::to_string)));

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        // Keys start with the timestamp, so lexical order is chronological.
        keys.sort();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(object) = self.get_object(&key).await? {
                entries.push(Self::parse(&object.content, "audit entry")?);
            }
        }
        Ok(entries)
    }

    fn backend_type(&self) -> &'static str {
        BACKEND
    }
}
