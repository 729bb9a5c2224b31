//! Credential hand-off to an external sink.
//!
//! Identity-bearing resources may come back from the provider with credential
//! material. The engine passes it to a [`CredentialSink`] untouched; payloads
//! are never logged, inspected, or encrypted here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::info;

use crate::error::CredentialError;

/// Opaque credential material.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialPayload(serde_json::Value);

impl CredentialPayload {
    /// Wraps provider-returned material.
    #[must_use]
    pub const fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Serialized bytes of the payload.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a `Value` cannot fail.
        serde_json::to_vec(&self.0).unwrap_or_default()
    }
}

impl std::fmt::Debug for CredentialPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialPayload(<redacted>)")
    }
}

/// Credential material together with who should receive it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialMaterial {
    /// Intended recipient (a team, a service account, a vault path).
    pub recipient: String,
    /// Opaque payload.
    pub payload: CredentialPayload,
}

/// External collaborator that distributes credential material.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialSink: Send + Sync {
    /// Hands `payload` to `recipient`.
    async fn publish(&self, recipient: &str, payload: &CredentialPayload) -> Result<(), CredentialError>;
}

/// Sink that drops each payload into a file under a directory.
#[derive(Debug, Clone)]
pub struct DirectoryCredentialSink {
    directory: PathBuf,
}

impl DirectoryCredentialSink {
    /// Creates a sink writing to `directory`.
    #[must_use]
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn file_name(recipient: &str) -> String {
        let safe: String = recipient
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        format!("{safe}.json")
    }
}

#[async_trait]
impl CredentialSink for DirectoryCredentialSink {
    async fn publish(&self, recipient: &str, payload: &CredentialPayload) -> Result<(), CredentialError> {
        let failed = |message: String| CredentialError::PublishFailed {
            recipient: recipient.to_string(),
            message,
        };

        fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| failed(format!("cannot create {}: {e}", self.directory.display())))?;

        let path = self.directory.join(Self::file_name(recipient));
        fs::write(&path, payload.to_bytes())
            .await
            .map_err(|e| failed(format!("cannot write {}: {e}", path.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| failed(format!("cannot restrict {}: {e}", path.display())))?;
        }

        info!("Published credentials for {recipient}");
        Ok(())
    }
}
