//! Local file-based state storage backend.
//!
//! This module provides a simple file-based state storage for local development
//! and single-machine deployments. Each environment gets its own directory:
//!
//! ```text
//! <base>/<scope>/state.json
//! <base>/<scope>/lease.json
//! <base>/<scope>/audit.jsonl
//! ```
//!
//! Conditional writes are serialized by an in-process mutex. Files are always
//! written to a uniquely named temp file first and then published with a
//! rename, or a hard link for lease creation, so a reader never sees a
//! partially written file and two processes cannot both create a lease.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{HalyardError, Result, StateError};
use crate::lock::{LeaseCondition, LockLease};

use super::store::StateStore;
use super::types::{AuditEntry, EnvironmentState, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".halyard";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lease file name.
const LEASE_FILE: &str = "lease.json";

/// Audit log file name.
const AUDIT_FILE: &str = "audit.jsonl";

const BACKEND: &str = "local";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Serializes read-compare-write sequences.
    write_guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store under `./.halyard`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| HalyardError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_guard: Mutex::new(()),
        }
    }

    /// Base directory of this store.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn scope_dir(&self, scope: &str) -> PathBuf {
        self.base_dir.join(scope)
    }

    fn state_path(&self, scope: &str) -> PathBuf {
        self.scope_dir(scope).join(STATE_FILE)
    }

    fn lease_path(&self, scope: &str) -> PathBuf {
        self.scope_dir(scope).join(LEASE_FILE)
    }

    fn audit_path(&self, scope: &str) -> PathBuf {
        self.scope_dir(scope).join(AUDIT_FILE)
    }

    /// Ensures the scope directory exists.
    async fn ensure_dir(&self, scope: &str) -> Result<()> {
        let dir = self.scope_dir(scope);
        if !dir.exists() {
            debug!("Creating state directory: {}", dir.display());
            fs::create_dir_all(&dir).await.map_err(|e| {
                StateError::backend(BACKEND, format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<Option<T>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::Corrupted {
                    message: format!("Failed to read {what} file: {e}"),
                }
                .into());
            }
        };

        let value = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse {what} file: {e}"),
        })?;
        Ok(Some(value))
    }

    /// Temp file next to `path`, unique per write.
    fn temp_path(path: &Path) -> PathBuf {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
        path.with_file_name(format!("{stem}.{}.tmp", Uuid::new_v4().simple()))
    }

    /// Writes and syncs `content` into a fresh temp file next to `path`.
    async fn write_temp(path: &Path, content: &[u8]) -> Result<PathBuf> {
        let temp_path = Self::temp_path(path);

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::backend(BACKEND, format!("Failed to create temp file: {e}"))
        })?;
        file.write_all(content)
            .await
            .map_err(|e| StateError::backend(BACKEND, format!("Failed to write file: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::backend(BACKEND, format!("Failed to sync file: {e}")))?;
        Ok(temp_path)
    }

    /// Writes to a temporary file, then renames it over the target.
    async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
        let temp_path = Self::write_temp(path, content).await?;

        if let Err(e) = fs::rename(&temp_path, path).await {
            Self::discard_temp(&temp_path).await;
            return Err(StateError::backend(BACKEND, format!("Failed to rename file: {e}")).into());
        }
        Ok(())
    }

    /// Publishes `content` at `path` only if nothing is there yet.
    ///
    /// The hard link either creates the complete file or fails with
    /// `AlreadyExists`.
    async fn write_exclusive(scope: &str, path: &Path, content: &[u8]) -> Result<()> {
        let temp_path = Self::write_temp(path, content).await?;
        let linked = fs::hard_link(&temp_path, path).await;
        Self::discard_temp(&temp_path).await;

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StateError::conflict(scope, "a lease already exists").into())
            }
            Err(e) => Err(StateError::backend(BACKEND, format!("Failed to create lease file: {e}")).into()),
        }
    }

    async fn discard_temp(temp_path: &Path) {
        if let Err(e) = Self::remove_if_exists(temp_path).await {
            warn!("Failed to remove temp file: {e}");
        }
    }

    async fn remove_if_exists(path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::backend(BACKEND, format!("Failed to delete {}: {e}", path.display())).into()),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| StateError::serialization(format!("Failed to serialize {what}: {e}")).into())
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self, scope: &str) -> Result<Option<EnvironmentState>> {
        let path = self.state_path(scope);
        let state: Option<EnvironmentState> = Self::read_json(&path, "state").await?;

        if let Some(state) = &state {
            debug!("Loaded state from: {} (revision {})", path.display(), state.revision);
            if state.version != STATE_VERSION {
                return Err(StateError::VersionMismatch {
                    expected: STATE_VERSION.to_string(),
                    found: state.version.clone(),
                }
                .into());
            }
        }
        Ok(state)
    }

    async fn save(&self, state: &EnvironmentState, expected_revision: u64) -> Result<()> {
        let scope = state.environment.as_str();
        let _guard = self.write_guard.lock().await;
        self.ensure_dir(scope).await?;

        let path = self.state_path(scope);
        let stored: Option<EnvironmentState> = Self::read_json(&path, "state").await?;
        let stored_revision = stored.map_or(0, |s| s.revision);
        if stored_revision != expected_revision {
            return Err(StateError::conflict(
                scope,
                format!("expected revision {expected_revision}, found {stored_revision}"),
            )
            .into());
        }

        let content = to_json(state, "state")?;
        Self::write_atomic(&path, content.as_bytes()).await?;
        debug!("Saved state to: {} (revision {})", path.display(), state.revision);
        Ok(())
    }

    async fn delete(&self, scope: &str) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        if Self::remove_if_exists(&self.state_path(scope)).await? {
            info!("Deleted state for environment: {scope}");
        }
        Ok(())
    }

    async fn exists(&self, scope: &str) -> Result<bool> {
        Ok(self.state_path(scope).exists())
    }

    async fn read_lease(&self, scope: &str) -> Result<Option<LockLease>> {
        Self::read_json(&self.lease_path(scope), "lease").await
    }

    async fn write_lease(&self, lease: &LockLease, condition: &LeaseCondition) -> Result<()> {
        let scope = lease.scope.as_str();
        let _guard = self.write_guard.lock().await;
        self.ensure_dir(scope).await?;

        let path = self.lease_path(scope);
        let content = to_json(lease, "lease")?;

        if *condition == LeaseCondition::Absent {
            return Self::write_exclusive(scope, &path, content.as_bytes()).await;
        }

        let current: Option<LockLease> = Self::read_json(&path, "lease").await?;
        if !condition.matches(current.as_ref()) {
            return Err(StateError::conflict(scope, "lease condition not met").into());
        }
        Self::write_atomic(&path, content.as_bytes()).await
    }

    async fn delete_lease(&self, scope: &str, condition: &LeaseCondition) -> Result<bool> {
        let _guard = self.write_guard.lock().await;
        let path = self.lease_path(scope);
        let current: Option<LockLease> = Self::read_json(&path, "lease").await?;

        if current.is_none() || !condition.matches(current.as_ref()) {
            return Ok(false);
        }
        Self::remove_if_exists(&path).await
    }

    async fn append_audit(&self, scope: &str, entry: &AuditEntry) -> Result<()> {
        let _guard = self.write_guard.lock().await;
        self.ensure_dir(scope).await?;

        let mut line = serde_json::to_string(entry)
            .map_err(|e| StateError::serialization(format!("Failed to serialize audit entry: {e}")))?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.audit_path(scope))
            .await
            .map_err(|e| StateError::backend(BACKEND, format!("Failed to open audit log: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StateError::backend(BACKEND, format!("Failed to append audit log: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::backend(BACKEND, format!("Failed to sync audit log: {e}")))?;
        Ok(())
    }

    async fn list_audit(&self, scope: &str) -> Result<Vec<AuditEntry>> {
        let content = match fs::read_to_string(self.audit_path(scope)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StateError::backend(BACKEND, format!("Failed to read audit log: {e}")).into());
            }
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|e| {
                    HalyardError::State(StateError::Corrupted {
                        message: format!("Failed to parse audit entry: {e}"),
                    })
                })
            })
            .collect()
    }

    fn backend_type(&self) -> &'static str {
        BACKEND
    }
}
