//! Local-socket server: the broker's client-facing side.
//!
//! [`ConnectionManager`] accepts connections on a Unix socket; each becomes
//! one [`Session`](broker_domain::Session) in the [`SessionRegistry`] and
//! speaks the newline-delimited JSON [`protocol`]. Messages that pass
//! admission go to the dispatcher; replies come back on the same
//! connection.

mod connection;
mod listener;
pub mod protocol;
mod registry;

pub use listener::ConnectionManager;
pub use protocol::{ClientMessage, ProtocolError, ServerInfo, ServerMessage, StatusReport};
pub use registry::SessionRegistry;

use broker_application::config::BrokerConfig;
use broker_application::ports::conversation_logger::{ConversationLogger, NoConversationLogger};
use broker_application::use_cases::dispatcher::DispatcherHandle;
use broker_domain::ContextAccountant;
use std::sync::Arc;

/// State shared by every connection task.
pub struct ServerContext {
    pub registry: SessionRegistry,
    pub dispatcher: DispatcherHandle,
    pub accountant: ContextAccountant,
    pub server_info: ServerInfo,
    pub require_authentication: bool,
    pub conversation_logger: Arc<dyn ConversationLogger>,
}

impl ServerContext {
    pub fn new(config: &BrokerConfig, dispatcher: DispatcherHandle) -> Self {
        Self {
            registry: SessionRegistry::new(config.server.max_sessions),
            dispatcher,
            accountant: ContextAccountant::new(config.context.budget()),
            server_info: ServerInfo {
                name: "llm-broker".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                backend: config.backend.kind.to_string(),
                context_size: config.context.context_size,
                max_tokens: config.context.max_tokens,
            },
            require_authentication: config.server.require_authentication,
            conversation_logger: Arc::new(NoConversationLogger),
        }
    }

    /// Create with a conversation logger for rejected requests.
    pub fn with_conversation_logger(mut self, logger: Arc<dyn ConversationLogger>) -> Self {
        self.conversation_logger = logger;
        self
    }
}
