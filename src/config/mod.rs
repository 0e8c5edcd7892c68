//! Application configuration.
//!
//! Aggregates the storage and stream settings into a single Config struct
//! that can be loaded from YAML files or environment variables.

use serde::Deserialize;

#[cfg(feature = "s3")]
use crate::storage::StorageConfig;
use crate::stream::StreamsConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "funicular.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FUNICULAR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FUNICULAR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FUNICULAR_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// S3 storage configuration.
    #[cfg(feature = "s3")]
    pub storage: StorageConfig,
    /// Stream manager configuration.
    pub streams: StreamsConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `funicular.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
