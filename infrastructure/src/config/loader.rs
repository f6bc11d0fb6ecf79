//! Configuration file loader with multi-source merging

use broker_application::config::BrokerConfig;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// File name looked up in the working directory.
const PROJECT_CONFIG_FILE: &str = "llm-broker.toml";

/// Errors raised while resolving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Configuration loader that handles file discovery and merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Prefix for environment overrides; `__` separates nesting levels,
    /// e.g. `LLM_BROKER_SERVER__MAX_SESSIONS=4`.
    pub const ENV_PREFIX: &'static str = "LLM_BROKER_";

    /// Load configuration from all sources with proper priority
    pub fn load(config_path: Option<&Path>) -> Result<BrokerConfig, ConfigError> {
        if let Some(path) = config_path
            && !path.exists()
        {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let config = Self::figment(config_path)
            .extract()
            .map_err(Box::new)?;
        Ok(config)
    }

    /// Reject a configuration that cannot run.
    pub fn validate(config: BrokerConfig) -> Result<BrokerConfig, ConfigError> {
        let issues = config.validate();
        if issues.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    /// Build the layered figment without extracting it.
    pub fn figment(config_path: Option<&Path>) -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(BrokerConfig::default()));

        // Add global config (XDG or fallback)
        if let Some(global_path) = Self::global_config_path()
            && global_path.exists()
        {
            debug!("Config: merging {}", global_path.display());
            figment = figment.merge(Toml::file(&global_path));
        }

        if let Some(project_path) = Self::project_config_path() {
            debug!("Config: merging {}", project_path.display());
            figment = figment.merge(Toml::file(&project_path));
        }

        // Add explicit config path (highest priority for files)
        if let Some(path) = config_path {
            debug!("Config: merging {}", path.display());
            figment = figment.merge(Toml::file(path));
        }

        figment.merge(Env::prefixed(Self::ENV_PREFIX).split("__"))
    }

    /// Get the global config file path
    ///
    /// Returns XDG_CONFIG_HOME/llm-broker/config.toml if set,
    /// otherwise falls back to ~/.config/llm-broker/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("llm-broker").join("config.toml"))
    }

    /// Get the project-level config file path (if it exists)
    pub fn project_config_path() -> Option<PathBuf> {
        let path = PathBuf::from(PROJECT_CONFIG_FILE);
        path.exists().then_some(path)
    }
}
