//! CLI command definitions

use broker_application::{BackendKind, BrokerConfig};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Backend variant selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    /// A long-lived model process driven over stdin/stdout
    Process,
    /// A completion service reached over HTTP
    Http,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Process => BackendKind::Process,
            BackendArg::Http => BackendKind::Http,
        }
    }
}

/// CLI arguments for llm-broker
#[derive(Parser, Debug)]
#[command(name = "llm-broker")]
#[command(author, version, about = "Share one local LLM backend among many clients")]
#[command(long_about = r#"
llm-broker owns a single language-model backend and serves it to many clients
over a Unix socket. Each connection gets its own conversation; requests from
all connections are answered one at a time, in arrival order.

Configuration is merged from (lowest to highest priority):
1. Built-in defaults
2. ~/.config/llm-broker/config.toml   Global config
3. ./llm-broker.toml                  Project-level config
4. --config <path>                    Explicit config file
5. LLM_BROKER_* environment variables (use __ for nesting)
6. Command-line flags

Example:
  llm-broker serve --model models/mistral-7b.Q4_K_M.gguf --gpu-layers 35
  llm-broker serve --backend http --endpoint http://127.0.0.1:8080
  llm-broker relay --username alice
"#)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Also write diagnostics to a daily-rolling file in this directory
    #[arg(long, value_name = "DIR", global = true)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the backend and serve clients on the socket
    Serve(ServeArgs),
    /// Connect to a running broker and chat over stdin/stdout
    Relay(RelayArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Socket path to listen on
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Backend variant
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Model file for the process backend, or model name for the HTTP backend
    #[arg(short, long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Base URL of the HTTP completion service
    #[arg(long, value_name = "URL")]
    pub endpoint: Option<String>,

    /// Layers to offload to the GPU (process backend)
    #[arg(long, value_name = "N")]
    pub gpu_layers: Option<u32>,

    /// Context window in tokens
    #[arg(long, value_name = "TOKENS")]
    pub context_size: Option<usize>,

    /// Maximum generated tokens per reply
    #[arg(long, value_name = "TOKENS")]
    pub max_tokens: Option<usize>,

    /// Maximum number of simultaneous clients
    #[arg(long, value_name = "N")]
    pub max_sessions: Option<usize>,

    /// Append a JSONL record of every backend exchange to this file
    #[arg(long, value_name = "PATH")]
    pub conversation_log: Option<PathBuf>,

    /// Print the resolved configuration as TOML and exit
    #[arg(long)]
    pub show_config: bool,
}

impl ServeArgs {
    /// Apply command-line overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut BrokerConfig) {
        if let Some(socket) = &self.socket {
            config.server.socket_path = socket.clone();
        }
        if let Some(backend) = self.backend {
            config.backend.kind = backend.into();
        }
        // --model means the model file for a process and the model name for a service
        if let Some(model) = &self.model {
            match config.backend.kind {
                BackendKind::Process => config.backend.process.model_path = model.clone(),
                BackendKind::Http => config.backend.http.model = model.clone(),
            }
        }
        if let Some(endpoint) = &self.endpoint {
            config.backend.http.endpoint = endpoint.clone();
        }
        if let Some(gpu_layers) = self.gpu_layers {
            config.backend.process.gpu_layers = gpu_layers;
        }
        if let Some(context_size) = self.context_size {
            config.context.context_size = context_size;
        }
        if let Some(max_tokens) = self.max_tokens {
            config.context.max_tokens = max_tokens;
        }
        if let Some(max_sessions) = self.max_sessions {
            config.server.max_sessions = max_sessions;
        }
        if let Some(path) = &self.conversation_log {
            config.logging.conversation_log = Some(path.clone());
        }
    }
}

#[derive(Args, Debug, Default)]
pub struct RelayArgs {
    /// Socket path of the running broker (defaults to the configured one)
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Name to authenticate as
    #[arg(short, long, value_name = "NAME")]
    pub username: Option<String>,

    /// User id sent with --username (defaults to the username)
    #[arg(long, value_name = "ID", requires = "username")]
    pub user_id: Option<String>,
}
