//! Configuration parser for loading the desired-state file.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, HalyardError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::DeployConfig;

/// Configuration parser for loading the desired-state file.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(HalyardError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            HalyardError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML configuration");

        let mut config: DeployConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            HalyardError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        if let (Some(base), Some(path)) = (&self.base_path, config.state.path.as_ref()) {
            let candidate = Path::new(path);
            if candidate.is_relative() {
                config.state.path = Some(base.join(candidate).display().to_string());
            }
        }

        debug!(
            "Parsed configuration for environment {} ({} resources)",
            config.environment.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Recognised variables: `HALYARD_ENVIRONMENT`, `HALYARD_STATE_BUCKET`,
    /// `HALYARD_STATE_PREFIX`, `HALYARD_PROVIDER_ENDPOINT`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Applies overrides from a variable lookup to the configuration.
    fn apply_overrides(config: &mut DeployConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(name) = lookup("HALYARD_ENVIRONMENT") {
            debug!("Overriding environment.name from environment");
            config.environment.name = name;
        }

        if let Some(bucket) = lookup("HALYARD_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = lookup("HALYARD_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(endpoint) = lookup("HALYARD_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                HalyardError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads the provider token from the variable named in the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is not set.
    pub fn provider_token(config: &DeployConfig) -> Result<String> {
        let name = &config.provider.token_env;
        std::env::var(name).map_err(|_| {
            HalyardError::Config(ConfigError::MissingEnvVar { name: name.clone() })
        })
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["halyard.yaml", "halyard.yml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(HalyardError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateBackend;
    use std::collections::HashMap;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
environment:
  name: staging
";
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("minimal config should parse");

        assert_eq!(config.environment.name, "staging");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.engine.concurrency, 4);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
environment:
  name: prod
  project: task-manager

state:
  backend: s3
  bucket: halyard-state
  prefix: task-manager/prod

provider:
  endpoint: https://cloud.internal.example/api
  token_env: CLOUD_TOKEN

engine:
  concurrency: 8
  max_attempts: 3

credentials:
  directory: .halyard/credentials

resources:
  - id: vpc
    type: network.vpc
    attributes:
      cidr: 10.0.0.0/16
  - id: subnet
    type: network.subnet
    attributes:
      vpc_id: "${vpc}"
      cidr: 10.0.1.0/24
  - id: db
    type: database.postgres
    attributes:
      size: small
    depends_on: [subnet]
"#;
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("full config should parse");

        assert_eq!(config.environment.project.as_deref(), Some("task-manager"));
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.provider.token_env, "CLOUD_TOKEN");
        assert_eq!(config.engine.concurrency, 8);
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.engine.lock_ttl_secs, 300);
        assert_eq!(config.resources.len(), 3);
        assert_eq!(config.resources[2].depends_on, vec![String::from("subnet")]);
        assert_eq!(config.resource_ids(), vec!["vpc", "subnet", "db"]);
    }

    #[test]
    fn test_invalid_yaml_is_parse_error() {
        let result = ConfigParser::new().parse_yaml("environment: [", None);
        assert!(matches!(
            result,
            Err(HalyardError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new()
            .parse_yaml("environment:\n  name: dev\n", None)
            .expect("config should parse");

        let vars: HashMap<&str, &str> = [
            ("HALYARD_ENVIRONMENT", "qa"),
            ("HALYARD_PROVIDER_ENDPOINT", "http://localhost:9000"),
        ]
        .into_iter()
        .collect();

        ConfigParser::apply_overrides(&mut config, |name| {
            vars.get(name).map(|v| (*v).to_string())
        });

        assert_eq!(config.environment.name, "qa");
        assert_eq!(config.provider.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.state.bucket.is_none());
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("create nested");
        std::fs::write(temp.path().join("halyard.yaml"), "environment:\n  name: x\n")
            .expect("write config");

        let found = find_config_file(&nested).expect("config should be found");
        assert_eq!(found, temp.path().join("halyard.yaml"));
    }
}
