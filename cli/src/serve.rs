//! `llm-broker serve`: wire the layers together and run until told to stop.

use crate::commands::ServeArgs;
use anyhow::{Context, Result, bail};
use broker_application::{
    BackendState, BrokerConfig, ConversationLogger, Dispatcher, NoConversationLogger,
};
use broker_infrastructure::{
    ConfigLoader, ConnectionManager, JsonlConversationLogger, ServerContext, build_backend,
};
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Why the server stopped serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Signal(&'static str),
    BackendStopped,
}

pub async fn run(config_path: Option<&Path>, args: ServeArgs) -> Result<()> {
    let loaded = ConfigLoader::load(config_path).context("Failed to load configuration")?;
    let config = resolve_config(loaded, &args)?;

    if args.show_config {
        print!("{}", render_config(&config)?);
        return Ok(());
    }

    let conversation_logger: Arc<dyn ConversationLogger> =
        match config.logging.conversation_log.as_deref() {
            Some(path) => match JsonlConversationLogger::new(path) {
                Some(logger) => {
                    info!("Conversation log: {}", logger.path().display());
                    Arc::new(logger)
                }
                None => Arc::new(NoConversationLogger),
            },
            None => Arc::new(NoConversationLogger),
        };

    let mut backend = build_backend(&config);
    info!("Starting {} backend", backend.kind());
    backend
        .start()
        .await
        .with_context(|| format!("{} backend failed to start", backend.kind()))?;

    let (dispatcher, dispatcher_task) = Dispatcher::new(backend)
        .with_conversation_logger(Arc::clone(&conversation_logger))
        .spawn();

    let context = ServerContext::new(&config, dispatcher.clone())
        .with_conversation_logger(conversation_logger);
    let manager = ConnectionManager::new(config.server.socket_path.clone(), context);
    let listener = match manager.bind() {
        Ok(listener) => listener,
        Err(e) => {
            dispatcher.shutdown().await;
            return Err(e).with_context(|| {
                format!("Failed to bind {}", manager.socket_path().display())
            });
        }
    };

    let shutdown = manager.shutdown_token();
    let watcher = tokio::spawn({
        let backend_state = dispatcher.watch_backend();
        async move {
            let reason = tokio::select! {
                name = shutdown_signal() => StopReason::Signal(name),
                _ = backend_stopped(backend_state) => StopReason::BackendStopped,
            };
            shutdown.cancel();
            reason
        }
    });

    manager.serve(listener).await;
    dispatcher.shutdown().await;
    if let Err(e) = dispatcher_task.await {
        warn!("Dispatcher task ended abnormally: {}", e);
    }

    match watcher.await {
        Ok(StopReason::Signal(name)) => {
            info!("Stopped on {}", name);
            Ok(())
        }
        Ok(StopReason::BackendStopped) => bail!("Backend stopped unexpectedly"),
        Err(e) => bail!("Shutdown watcher failed: {}", e),
    }
}

/// Layer the command-line overrides on the loaded configuration and
/// reject it if it cannot run.
fn resolve_config(mut config: BrokerConfig, args: &ServeArgs) -> Result<BrokerConfig> {
    args.apply(&mut config);
    Ok(ConfigLoader::validate(config)?)
}

fn render_config(config: &BrokerConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to render configuration")
}

/// Resolves on SIGINT or SIGTERM, naming the signal.
async fn shutdown_signal() -> &'static str {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

/// Resolves once the backend reaches `Stopped` or its state channel closes.
async fn backend_stopped(mut state: watch::Receiver<BackendState>) {
    while *state.borrow_and_update() != BackendState::Stopped {
        if state.changed().await.is_err() {
            break;
        }
    }
    error!("Backend stopped; shutting down");
}
