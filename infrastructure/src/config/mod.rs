//! Configuration loading for llm-broker
//!
//! This module handles file I/O and merging of configuration from multiple sources.
//! The priority order (highest to lowest):
//!
//! 1. Environment: `LLM_BROKER_<SECTION>__<KEY>`
//! 2. `--config <path>` specified file
//! 3. Project root: `./llm-broker.toml`
//! 4. XDG config: `$XDG_CONFIG_HOME/llm-broker/config.toml`
//! 5. Default values
//!
//! Command-line flags are applied on top by the binary.

mod loader;

pub use loader::{ConfigError, ConfigLoader};
