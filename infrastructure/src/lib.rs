//! Infrastructure layer for llm-broker
//!
//! This crate contains adapters that implement the ports defined
//! in the application layer: the backend adapters, the local-socket
//! server, configuration file loading, and the JSONL conversation log.

pub mod backend;
pub mod config;
pub mod logging;
pub mod server;

// Re-export commonly used types
pub use backend::{HttpBackend, ProcessBackend, build_backend};
pub use config::{ConfigError, ConfigLoader};
pub use logging::JsonlConversationLogger;
pub use server::{ConnectionManager, ServerContext, SessionRegistry};
