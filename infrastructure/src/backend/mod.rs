//! Backend adapters implementing the [`LlmBackend`] port.
//!
//! - [`ProcessBackend`]: an interactive model process on stdin/stdout
//! - [`HttpBackend`]: an OpenAI-style completion service

mod http;
mod process;

pub use http::HttpBackend;
pub use process::ProcessBackend;

use broker_application::config::BrokerConfig;
use broker_application::ports::backend::{BackendKind, LlmBackend};

/// Build the adapter selected by `backend.kind`. The backend is not started.
pub fn build_backend(config: &BrokerConfig) -> Box<dyn LlmBackend> {
    match config.backend.kind {
        BackendKind::Process => Box::new(ProcessBackend::from_config(config)),
        BackendKind::Http => Box::new(HttpBackend::from_config(config)),
    }
}
