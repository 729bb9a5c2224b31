//! Error types for the Halyard orchestration engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, state storage, locking, graph construction, provider calls,
//! and run coordination. Resource-level failures inside a run are recorded in
//! the [`RunReport`](crate::engine::RunReport) instead of being raised here.

use std::path::PathBuf;
use thiserror::Error;

/// Exit code for a successful run.
pub const EXIT_SUCCESS: u8 = 0;

/// Exit code for a failed or partially failed run.
pub const EXIT_FAILURE: u8 = 1;

/// Exit code when the environment lock is held by someone else.
pub const EXIT_LOCK_CONTENTION: u8 = 2;

/// Exit code for an invalid specification (schema error or cycle).
pub const EXIT_INVALID_SPEC: u8 = 3;

/// The main error type for Halyard.
#[derive(Debug, Error)]
pub enum HalyardError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Lock errors.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// Provider errors surfaced outside of a run.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Run coordination errors.
    #[error("Run error: {0}")]
    Run(#[from] RunError),

    /// Credential hand-off errors.
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate resource id: {id}")]
    DuplicateId {
        /// The duplicated id.
        id: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// A conditional write lost against a concurrent writer.
    #[error("Conditional write rejected for {scope}: {message}")]
    Conflict {
        /// Environment scope of the write.
        scope: String,
        /// Description of the failed condition.
        message: String,
    },

    /// A record was asked to make a transition the state machine forbids.
    #[error("Invalid status transition for '{resource}': {from} -> {to}")]
    InvalidTransition {
        /// Resource id.
        resource: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// A resource record is missing.
    #[error("No record for resource '{resource}'")]
    RecordNotFound {
        /// Resource id.
        resource: String,
    },

    /// Storage backend error.
    #[error("{backend} state backend error: {message}")]
    Backend {
        /// Backend type name.
        backend: &'static str,
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Lock manager errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// The scope is locked by a live lease.
    #[error("Environment '{scope}' is locked by {holder} (since {since}, last heartbeat {heartbeat_at})")]
    Held {
        /// Locked scope.
        scope: String,
        /// Identifier of the lock holder.
        holder: String,
        /// When the lease was acquired.
        since: String,
        /// Last heartbeat of the lease.
        heartbeat_at: String,
    },

    /// The caller no longer holds the lease it tried to refresh.
    #[error("Lease {lease_id} on '{scope}' was lost")]
    LeaseLost {
        /// Scope of the lost lease.
        scope: String,
        /// Identifier of the lost lease.
        lease_id: String,
    },
}

/// Dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("Cyclic dependency: {}", path.join(" -> "))]
    CyclicDependency {
        /// Resource ids along the cycle, first id repeated at the end.
        path: Vec<String>,
    },

    /// A resource references an id that is not declared.
    #[error("Resource '{resource}' depends on unknown resource '{dependency}'")]
    UnknownDependency {
        /// Dependent resource id.
        resource: String,
        /// Missing dependency id.
        dependency: String,
    },

    /// The same resource id appears twice.
    #[error("Duplicate resource id in graph: {id}")]
    DuplicateNode {
        /// The duplicated id.
        id: String,
    },
}

/// Provider capability errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Transient failure (throttling, 5xx, network); retried with backoff.
    #[error("Transient provider error: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// Missing permissions; fatal, never retried.
    #[error("Permission denied: {message}")]
    Permission {
        /// Description of the failure.
        message: String,
    },

    /// The provider rejected the resource specification; fatal.
    #[error("Invalid resource specification: {message}")]
    InvalidSpec {
        /// Description of the failure.
        message: String,
    },

    /// The resource does not exist.
    #[error("{resource_type} '{provider_id}' not found")]
    NotFound {
        /// Resource type.
        resource_type: String,
        /// Provider identifier.
        provider_id: String,
    },

    /// A single provider call exceeded its timeout.
    #[error("Provider call '{operation}' timed out after {secs}s")]
    Timeout {
        /// Operation name.
        operation: String,
        /// Timeout in seconds.
        secs: u64,
    },
}

/// Run coordination errors.
#[derive(Debug, Error)]
pub enum RunError {
    /// Attachment polling ran out of attempts before the resource was free.
    #[error("Attachments of '{resource}' still bound after {attempts} polls")]
    AttachmentTimeout {
        /// Resource id.
        resource: String,
        /// Number of polls made.
        attempts: u32,
    },

    /// A resource exceeded its time budget.
    #[error("Resource '{resource}' exceeded its {secs}s budget")]
    ResourceTimeout {
        /// Resource id.
        resource: String,
        /// Budget in seconds.
        secs: u64,
    },

    /// Import target is already managed.
    #[error("Resource '{resource}' is already managed (status {status})")]
    AlreadyManaged {
        /// Resource id.
        resource: String,
        /// Current record status.
        status: String,
    },

    /// A polled resource never became ready.
    #[error("Resource '{resource}' not ready after {attempts} polls")]
    NotReady {
        /// Resource id.
        resource: String,
        /// Number of polls made.
        attempts: u32,
    },
}

/// Credential hand-off errors.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// The sink refused or failed to store the payload.
    #[error("Failed to publish credentials for {recipient}: {message}")]
    PublishFailed {
        /// Intended recipient.
        recipient: String,
        /// Description of the failure.
        message: String,
    },
}

/// Result type alias for Halyard operations.
pub type Result<T> = std::result::Result<T, HalyardError>;

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

impl HalyardError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error means the lock is held by someone else.
    #[must_use]
    pub const fn is_lock_contention(&self) -> bool {
        matches!(self, Self::Lock(LockError::Held { .. }))
    }

    /// Returns true if this error means the specification itself is invalid.
    #[must_use]
    pub const fn is_invalid_spec(&self) -> bool {
        matches!(
            self,
            Self::Config(
                ConfigError::ValidationError { .. }
                    | ConfigError::DuplicateId { .. }
                    | ConfigError::ParseError { .. }
            ) | Self::Graph(_)
                | Self::Provider(ProviderError::InvalidSpec { .. })
        )
    }

    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        if self.is_lock_contention() {
            EXIT_LOCK_CONTENTION
        } else if self.is_invalid_spec() {
            EXIT_INVALID_SPEC
        } else {
            EXIT_FAILURE
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            backend,
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a conditional-write conflict.
    #[must_use]
    pub fn conflict(scope: &str, message: impl Into<String>) -> Self {
        Self::Conflict {
            scope: scope.to_string(),
            message: message.into(),
        }
    }
}

/// How a provider error should be handled by the engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// Stop immediately.
    Fatal,
    /// The resource is gone.
    NotFound,
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a permission error.
    #[must_use]
    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission {
            message: message.into(),
        }
    }

    /// Creates an invalid-spec error.
    #[must_use]
    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource_type: &str, provider_id: &str) -> Self {
        Self::NotFound {
            resource_type: resource_type.to_string(),
            provider_id: provider_id.to_string(),
        }
    }

    /// Classifies the error for retry decisions.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Transient { .. } | Self::Timeout { .. } => ErrorClass::Transient,
            Self::Permission { .. } | Self::InvalidSpec { .. } => ErrorClass::Fatal,
            Self::NotFound { .. } => ErrorClass::NotFound,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let held = HalyardError::Lock(LockError::Held {
            scope: String::from("prod"),
            holder: String::from("ci"),
            since: String::new(),
            heartbeat_at: String::new(),
        });
        assert_eq!(held.exit_code(), EXIT_LOCK_CONTENTION);

        let cycle = HalyardError::Graph(GraphError::CyclicDependency {
            path: vec![String::from("a"), String::from("b"), String::from("a")],
        });
        assert_eq!(cycle.exit_code(), EXIT_INVALID_SPEC);
        assert_eq!(cycle.to_string(), "Graph error: Cyclic dependency: a -> b -> a");

        let io = HalyardError::Io(std::io::Error::other("disk"));
        assert_eq!(io.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_provider_error_classes() {
        assert!(ProviderError::transient("throttled").is_retryable());
        assert!(
            ProviderError::Timeout {
                operation: String::from("create"),
                secs: 5
            }
            .is_retryable()
        );
        assert_eq!(ProviderError::permission("denied").class(), ErrorClass::Fatal);
        assert_eq!(ProviderError::invalid_spec("bad").class(), ErrorClass::Fatal);
        assert_eq!(ProviderError::not_found("vpc", "v-1").class(), ErrorClass::NotFound);
    }
}
