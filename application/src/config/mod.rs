//! Application-level configuration.
//!
//! [`BrokerConfig`] is the fully resolved configuration the broker runs
//! with. Where it came from (files, environment, flags) is an
//! infrastructure concern; every field has a built-in default.

pub mod broker_config;

pub use broker_config::{
    BackendConfig, BrokerConfig, ContextConfig, HttpBackendConfig, LoggingConfig,
    ProcessBackendConfig, ServerConfig,
};
