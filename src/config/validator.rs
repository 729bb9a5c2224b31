//! Configuration validation for desired-state files.
//!
//! This module validates a parsed configuration before anything touches the
//! state store or the provider. Every error found here is an invalid
//! specification; cycles are detected separately by the graph builder.

use crate::error::{ConfigError, HalyardError, Result};
use std::collections::HashSet;
use tracing::debug;
use ::validator::Validate;

use super::spec::{DeployConfig, EngineConfig, ResourceSpec, StateBackend, StateConfig};

/// Maximum length of resource and environment names.
const MAX_NAME_LEN: usize = 63;

/// Validator for deployment configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a deployment configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_environment(&config.environment.name, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        Self::validate_resources(&config.resources, &mut result);

        if config.provider.endpoint.is_none() {
            result
                .warnings
                .push(String::from("provider.endpoint is not set; only `validate` and `state` commands will work"));
        }

        Self::into_result(result)
    }

    /// Validates only a resource list (used by import and tests).
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate_resource_list(&self, resources: &[ResourceSpec]) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();
        Self::validate_resources(resources, &mut result);
        Self::into_result(result)
    }

    fn into_result(result: ValidationResult) -> Result<ValidationResult> {
        if let Some(first_error) = result.errors.first() {
            return Err(HalyardError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }
        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Validates the environment name.
    fn validate_environment(name: &str, result: &mut ValidationResult) {
        if name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("environment.name"),
                message: String::from("Environment name cannot be empty"),
            });
        } else if !is_valid_name(name) {
            result.errors.push(ValidationError {
                field: String::from("environment.name"),
                message: format!(
                    "Environment name '{name}' is invalid. Must be lowercase alphanumeric with hyphens or underscores."
                ),
            });
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {}
        }
    }

    /// Validates engine tunables.
    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if let Err(errors) = engine.validate() {
            for (field, field_errors) in errors.field_errors() {
                for error in field_errors {
                    result.errors.push(ValidationError {
                        field: format!("engine.{field}"),
                        message: format!("engine.{field} is out of range ({})", error.code),
                    });
                }
            }
        }

        if engine.heartbeat_interval_secs >= engine.lock_ttl_secs {
            result.errors.push(ValidationError {
                field: String::from("engine.heartbeat_interval_secs"),
                message: format!(
                    "Heartbeat interval ({}s) must be shorter than the lock ttl ({}s)",
                    engine.heartbeat_interval_secs, engine.lock_ttl_secs
                ),
            });
        }

        if engine.initial_backoff_ms > engine.max_backoff_ms {
            result.warnings.push(String::from(
                "engine.initial_backoff_ms exceeds engine.max_backoff_ms; delays will be capped",
            ));
        }
    }

    /// Validates resource specifications.
    fn validate_resources(resources: &[ResourceSpec], result: &mut ValidationResult) {
        if resources.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
            return;
        }

        let ids: HashSet<&str> = resources.iter().map(|r| r.id.as_str()).collect();
        let mut seen = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen.insert(resource.id.as_str()) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.id"),
                    message: format!("Duplicate resource id: {}", resource.id),
                });
            }

            if !is_valid_name(&resource.id) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.id"),
                    message: format!(
                        "Resource id '{}' is invalid. Must be lowercase alphanumeric with hyphens or underscores.",
                        resource.id
                    ),
                });
            }

            if resource.resource_type.trim().is_empty() {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.type"),
                    message: format!("Resource '{}' has an empty type", resource.id),
                });
            }

            for (j, dep) in resource.depends_on.iter().enumerate() {
                if !ids.contains(dep.as_str()) {
                    result.errors.push(ValidationError {
                        field: format!("{prefix}.depends_on[{j}]"),
                        message: format!(
                            "Resource '{}' depends on unknown resource '{dep}'",
                            resource.id
                        ),
                    });
                }
            }
        }
    }
}

impl ValidationResult {
    /// Returns true if no errors were found.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Checks whether a name is a valid identifier.
///
/// Names start with a lowercase letter, contain lowercase alphanumerics,
/// hyphens or underscores, and do not end with a separator.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }

    let mut chars = name.chars();
    let starts_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let ends_ok = !name.ends_with('-') && !name.ends_with('_');

    starts_ok
        && ends_ok
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> DeployConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("config should parse")
    }

    #[test]
    fn test_valid_names() {
        assert!(is_valid_name("vpc"));
        assert!(is_valid_name("app-lb"));
        assert!(is_valid_name("db_primary2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("2vpc"));
        assert!(!is_valid_name("Vpc"));
        assert!(!is_valid_name("vpc-"));
        assert!(!is_valid_name("a.b"));
    }

    #[test]
    fn test_valid_config() {
        let config = parse(
            r"
environment:
  name: dev
provider:
  endpoint: http://localhost:8080
resources:
  - id: vpc
    type: network.vpc
  - id: subnet
    type: network.subnet
    depends_on: [vpc]
",
        );

        let result = ConfigValidator::new().validate(&config).expect("should be valid");
        assert!(result.is_valid());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let config = parse(
            r"
environment:
  name: dev
resources:
  - id: vpc
    type: network.vpc
  - id: vpc
    type: network.vpc
",
        );

        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(err.is_invalid_spec());
        assert!(err.to_string().contains("Duplicate resource id"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let config = parse(
            r"
environment:
  name: dev
resources:
  - id: subnet
    type: network.subnet
    depends_on: [vpc]
",
        );

        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(err.to_string().contains("unknown resource 'vpc'"));
    }

    #[test]
    fn test_s3_requires_bucket() {
        let config = parse(
            r"
environment:
  name: dev
state:
  backend: s3
",
        );

        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_heartbeat_must_be_below_ttl() {
        let config = parse(
            r"
environment:
  name: dev
engine:
  lock_ttl_secs: 30
  heartbeat_interval_secs: 30
",
        );

        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(err.to_string().contains("Heartbeat interval"));
    }

    #[test]
    fn test_engine_range_errors_are_reported() {
        let config = parse(
            r"
environment:
  name: dev
engine:
  concurrency: 0
",
        );

        let err = ConfigValidator::new().validate(&config).unwrap_err();
        assert!(err.to_string().contains("engine.concurrency"));
    }
}
