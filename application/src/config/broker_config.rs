//! Resolved broker configuration.
//!
//! # Example (TOML)
//!
//! ```toml
//! [backend]
//! kind = "process"
//! request_timeout_ms = 90000
//!
//! [backend.process]
//! executable = "llama-cli"
//! model_path = "models/mistral-7b.Q4_K_M.gguf"
//! gpu_layers = 35
//!
//! [server]
//! socket_path = "/tmp/llm-broker.sock"
//! max_sessions = 8
//!
//! [context]
//! context_size = 8192
//! max_tokens = 1024
//! ```

use crate::ports::backend::BackendKind;
use broker_domain::{ContextBudget, MarkerSet};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings for the child-process backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessBackendConfig {
    /// Backend executable.
    pub executable: String,
    /// Model file passed with `-m`.
    pub model_path: String,
    /// Layers offloaded to the GPU, passed with `-ngl`.
    pub gpu_layers: u32,
    /// Arguments appended after the generated ones.
    pub extra_args: Vec<String>,
    /// Free-text markers in the process output that signal readiness.
    pub readiness_sentinels: Vec<String>,
}

impl Default for ProcessBackendConfig {
    fn default() -> Self {
        Self {
            executable: "llama-cli".to_string(),
            model_path: "models/model.gguf".to_string(),
            gpu_layers: 0,
            extra_args: vec![
                "--interactive-first".to_string(),
                "--simple-io".to_string(),
            ],
            readiness_sentinels: vec![
                "== Running in interactive mode. ==".to_string(),
                "main: interactive mode on".to_string(),
                "\n> ".to_string(),
            ],
        }
    }
}

impl ProcessBackendConfig {
    /// Full argument list for a window of `context_size` tokens.
    pub fn args(&self, context_size: usize) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.model_path.clone(),
            "-ngl".to_string(),
            self.gpu_layers.to_string(),
            "-c".to_string(),
            context_size.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Settings for the HTTP completion backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBackendConfig {
    /// Base URL of the completion service.
    pub endpoint: String,
    /// Path of the completion route, joined to `endpoint`.
    pub completion_path: String,
    /// Path polled until the service reports healthy.
    pub health_path: String,
    /// Model name sent in each request.
    pub model: String,
    pub temperature: f32,
    /// Stop sequences sent with each request.
    pub stop: Vec<String>,
    /// Command that launches the service; `None` assumes it already runs.
    pub launch_command: Option<Vec<String>>,
    /// Delay between health checks.
    pub health_poll_interval_ms: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080".to_string(),
            completion_path: "/v1/completions".to_string(),
            health_path: "/health".to_string(),
            model: "local-model".to_string(),
            temperature: 0.7,
            stop: vec![
                "\nUser:".to_string(),
                "<|im_end|>".to_string(),
                "</s>".to_string(),
            ],
            launch_command: None,
            health_poll_interval_ms: 1_000,
        }
    }
}

impl HttpBackendConfig {
    pub fn completion_url(&self) -> String {
        join_url(&self.endpoint, &self.completion_path)
    }

    pub fn health_url(&self) -> String {
        join_url(&self.endpoint, &self.health_path)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Backend selection and shared backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub process: ProcessBackendConfig,
    pub http: HttpBackendConfig,
    /// How long to wait for the backend to become ready.
    pub startup_timeout_ms: u64,
    /// How long a single request may take.
    pub request_timeout_ms: u64,
    /// Prepended to transcripts sent to stateless backends.
    pub system_prompt: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Process,
            process: ProcessBackendConfig::default(),
            http: HttpBackendConfig::default(),
            startup_timeout_ms: 120_000,
            request_timeout_ms: 120_000,
            system_prompt: None,
        }
    }
}

impl BackendConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Local socket server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Live sessions allowed at once; further connections are turned away.
    pub max_sessions: usize,
    /// Refuse `sendMessage` until the session has authenticated.
    pub require_authentication: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/tmp/llm-broker.sock"),
            max_sessions: 16,
            require_authentication: false,
        }
    }
}

/// Context window and admission thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub context_size: usize,
    /// Maximum generated length per reply.
    pub max_tokens: usize,
    pub warning_percent: u32,
    pub reject_percent: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            context_size: 4096,
            max_tokens: 512,
            warning_percent: 75,
            reject_percent: 90,
        }
    }
}

impl ContextConfig {
    pub fn budget(&self) -> ContextBudget {
        ContextBudget::new(self.context_size, self.max_tokens)
            .with_warning_percent(self.warning_percent)
            .with_reject_percent(self.reject_percent)
    }
}

/// Transcript logging settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// JSONL file receiving one record per exchange event.
    pub conversation_log: Option<PathBuf>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: BackendConfig,
    pub server: ServerConfig,
    pub context: ContextConfig,
    pub markers: MarkerSet,
    pub logging: LoggingConfig,
}

impl BrokerConfig {
    /// Validate this configuration, returning a list of issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.context.context_size == 0 {
            issues.push("context.context_size cannot be 0".to_string());
        }
        if self.context.max_tokens >= self.context.context_size {
            issues.push(format!(
                "context.max_tokens ({}) must be smaller than context.context_size ({})",
                self.context.max_tokens, self.context.context_size
            ));
        }
        if self.server.max_sessions == 0 {
            issues.push("server.max_sessions cannot be 0".to_string());
        }
        if self.server.socket_path.as_os_str().is_empty() {
            issues.push("server.socket_path cannot be empty".to_string());
        }
        if self.backend.startup_timeout_ms == 0 {
            issues.push("backend.startup_timeout_ms cannot be 0".to_string());
        }
        if self.backend.request_timeout_ms == 0 {
            issues.push("backend.request_timeout_ms cannot be 0".to_string());
        }

        match self.backend.kind {
            BackendKind::Process => {
                if self.backend.process.executable.trim().is_empty() {
                    issues.push("backend.process.executable cannot be empty".to_string());
                }
                if self.backend.process.readiness_sentinels.is_empty() {
                    issues.push(
                        "backend.process.readiness_sentinels needs at least one marker"
                            .to_string(),
                    );
                }
            }
            BackendKind::Http => {
                if self.backend.http.endpoint.trim().is_empty() {
                    issues.push("backend.http.endpoint cannot be empty".to_string());
                }
                if self.backend.http.health_poll_interval_ms == 0 {
                    issues.push("backend.http.health_poll_interval_ms cannot be 0".to_string());
                }
            }
        }

        issues.extend(self.markers.validate());
        issues
    }
}
