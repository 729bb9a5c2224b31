//! Configuration module for Halyard.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `halyard.yaml`
//! - Validation of configuration values
//! - Computing attribute hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    Attributes, CredentialsConfig, DeployConfig, EngineConfig, EnvironmentConfig, ProviderConfig,
    ResourceSpec, StateBackend, StateConfig,
};
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use validator::{ConfigValidator, ValidationResult};
pub use hash::ConfigHasher;
