//! Application layer for llm-broker
//!
//! This crate contains the dispatcher, port definitions, the client-facing
//! error taxonomy, and the resolved configuration. It depends only on the
//! domain layer.

pub mod config;
pub mod error;
pub mod ports;
pub mod use_cases;

// Re-export commonly used types
pub use config::{
    BackendConfig, BrokerConfig, ContextConfig, HttpBackendConfig, LoggingConfig,
    ProcessBackendConfig, ServerConfig,
};
pub use error::BrokerError;
pub use ports::{
    backend::{
        BackendError, BackendKind, BackendRequest, BackendState, BackendStatus, LlmBackend,
    },
    conversation_logger::{ConversationEvent, ConversationLogger, NoConversationLogger},
};
pub use use_cases::dispatcher::{Completion, Dispatcher, DispatcherHandle, QueueSnapshot, Ticket};
