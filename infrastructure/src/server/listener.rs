//! Unix-socket accept loop.

use super::ServerContext;
use super::connection::serve_connection;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accepts client connections and owns their tasks.
///
/// Shutdown (via [`shutdown_token`](Self::shutdown_token)) stops accepting,
/// closes every live connection, and removes the socket file.
pub struct ConnectionManager {
    socket_path: PathBuf,
    context: Arc<ServerContext>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(socket_path: impl Into<PathBuf>, context: ServerContext) -> Self {
        Self {
            socket_path: socket_path.into(),
            context: Arc::new(context),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Token that stops [`serve`](Self::serve) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the socket, replacing a stale socket file left by a previous run.
    pub fn bind(&self) -> io::Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        if self.socket_path.exists() {
            debug!("Removing stale socket {}", self.socket_path.display());
            std::fs::remove_file(&self.socket_path)?;
        }
        UnixListener::bind(&self.socket_path)
    }

    /// Accept connections until shutdown.
    pub async fn serve(&self, listener: UnixListener) {
        info!("Listening on {}", self.socket_path.display());
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        connections.spawn(serve_connection(
                            stream,
                            Arc::clone(&self.context),
                            self.shutdown.child_token(),
                        ));
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        if !connections.is_empty() {
            info!("Closing {} live connection(s)", connections.len());
        }
        connections.shutdown().await;
        self.remove_socket();
        info!("Connection manager stopped");
    }

    /// Best-effort removal of the socket file.
    pub fn remove_socket(&self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => debug!("Removed socket {}", self.socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Could not remove socket {}: {}",
                self.socket_path.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ProcessBackend;
    use crate::server::connection::MAX_LINE_BYTES;
    use async_trait::async_trait;
    use broker_application::config::{BrokerConfig, ProcessBackendConfig};
    use broker_application::ports::backend::{
        BackendError, BackendKind, BackendRequest, BackendState, BackendStatus, LlmBackend,
    };
    use broker_application::use_cases::dispatcher::Dispatcher;
    use broker_domain::MarkerSet;
    use serde_json::{Value, json};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::sync::{Notify, watch};
    use tokio::task::JoinHandle;

    type Invocations = Arc<Mutex<Vec<(String, Instant, Instant)>>>;

    /// Echoes each message after a delay; the first call can be held on a gate.
    struct EchoBackend {
        status: BackendStatus,
        delay: Duration,
        gate: Option<Arc<Notify>>,
        invocations: Invocations,
    }

    impl EchoBackend {
        fn new(delay: Duration) -> (Self, Invocations) {
            let invocations: Invocations = Arc::new(Mutex::new(Vec::new()));
            let backend = Self {
                status: BackendStatus::new(),
                delay,
                gate: None,
                invocations: Arc::clone(&invocations),
            };
            (backend, invocations)
        }

        fn gated(delay: Duration, gate: Arc<Notify>) -> (Self, Invocations) {
            let (mut backend, invocations) = Self::new(delay);
            backend.gate = Some(gate);
            (backend, invocations)
        }
    }

    #[async_trait]
    impl LlmBackend for EchoBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Process
        }

        fn subscribe(&self) -> watch::Receiver<BackendState> {
            self.status.subscribe()
        }

        async fn start(&mut self) -> Result<(), BackendError> {
            self.status.transition(BackendState::Ready);
            Ok(())
        }

        async fn send(&mut self, request: &BackendRequest) -> Result<String, BackendError> {
            let started = Instant::now();
            let first = self.invocations.lock().unwrap().is_empty();
            if first && let Some(gate) = &self.gate {
                gate.notified().await;
            }
            tokio::time::sleep(self.delay).await;
            self.invocations.lock().unwrap().push((
                request.message.clone(),
                started,
                Instant::now(),
            ));
            Ok(format!("echo: {}", request.message))
        }

        async fn stop(&mut self) {
            self.status.transition(BackendState::Stopped);
        }
    }

    struct Server {
        path: PathBuf,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    async fn start_server(mut backend: Box<dyn LlmBackend>, config: BrokerConfig) -> Server {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");

        backend.start().await.unwrap();
        let (dispatcher, _) = Dispatcher::new(backend).spawn();
        let manager = ConnectionManager::new(&path, ServerContext::new(&config, dispatcher));
        let listener = manager.bind().unwrap();
        let shutdown = manager.shutdown_token();
        let task = tokio::spawn(async move { manager.serve(listener).await });

        Server {
            path,
            shutdown,
            task,
            _dir: dir,
        }
    }

    struct Client {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(path: &Path) -> Self {
            let stream = UnixStream::connect(path).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                reader: BufReader::new(reader),
                writer,
            }
        }

        /// Connect and consume the `connected` greeting.
        async fn ready(path: &Path) -> Self {
            let mut client = Self::connect(path).await;
            let greeting = client.recv().await;
            assert_eq!(greeting["type"], "connected");
            client
        }

        async fn send_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn send(&mut self, record: Value) {
            self.send_raw(&format!("{}\n", record)).await;
        }

        async fn recv_line(&mut self) -> String {
            let mut line = String::new();
            let read = tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("read timeout")
                .unwrap();
            assert!(read > 0, "unexpected EOF");
            line
        }

        async fn recv(&mut self) -> Value {
            serde_json::from_str(&self.recv_line().await).unwrap()
        }

        async fn at_eof(&mut self) -> bool {
            let mut line = String::new();
            matches!(
                tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                    .await,
                Ok(Ok(0))
            )
        }
    }

    fn config() -> BrokerConfig {
        BrokerConfig::default()
    }

    #[tokio::test]
    async fn test_greeting_carries_server_info() {
        let (backend, _) = EchoBackend::new(Duration::ZERO);
        let server = start_server(Box::new(backend), config()).await;

        let mut client = Client::connect(&server.path).await;
        let greeting = client.recv().await;
        assert_eq!(greeting["type"], "connected");
        assert_eq!(greeting["serverInfo"]["name"], "llm-broker");
        assert_eq!(greeting["serverInfo"]["backend"], "process");
        assert_eq!(greeting["serverInfo"]["contextSize"], 4096);
        assert_eq!(greeting["serverInfo"]["maxTokens"], 512);
    }

    #[tokio::test]
    async fn test_authenticate_is_acknowledged_before_response() {
        let (backend, _) = EchoBackend::new(Duration::ZERO);
        let server = start_server(Box::new(backend), config()).await;
        let mut client = Client::ready(&server.path).await;

        client
            .send(json!({"type":"authenticate","userId":1,"username":"alice"}))
            .await;
        client
            .send(json!({"type":"sendMessage","content":"hi","messageId":"m1"}))
            .await;

        assert_eq!(
            client.recv().await,
            json!({"type":"authenticated","userId":1,"username":"alice"})
        );
        assert_eq!(
            client.recv().await,
            json!({"type":"response","content":"echo: hi","messageId":"m1"})
        );
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_served_one_at_a_time() {
        let (backend, invocations) = EchoBackend::new(Duration::from_millis(50));
        let server = start_server(Box::new(backend), config()).await;
        let mut alice = Client::ready(&server.path).await;
        let mut bob = Client::ready(&server.path).await;

        alice
            .send(json!({"type":"sendMessage","content":"hi","messageId":1}))
            .await;
        bob.send(json!({"type":"sendMessage","content":"hi","messageId":2}))
            .await;

        let (a, b) = tokio::join!(alice.recv(), bob.recv());
        assert_eq!(a, json!({"type":"response","content":"echo: hi","messageId":1}));
        assert_eq!(b, json!({"type":"response","content":"echo: hi","messageId":2}));

        let invocations = invocations.lock().unwrap();
        assert_eq!(invocations.len(), 2);
        assert!(invocations[0].2 <= invocations[1].1);
    }

    #[tokio::test]
    async fn test_unknown_type_keeps_connection_open() {
        let (backend, _) = EchoBackend::new(Duration::ZERO);
        let server = start_server(Box::new(backend), config()).await;
        let mut client = Client::ready(&server.path).await;

        client.send_raw("{\"type\":\"bogus\"}\n").await;
        assert_eq!(
            client.recv_line().await,
            "{\"type\":\"error\",\"message\":\"Unknown message type\"}\n"
        );

        client.send_raw("this is not json\n").await;
        assert_eq!(
            client.recv().await,
            json!({"type":"error","message":"Invalid message format"})
        );

        client.send(json!({"type":"getStatus"})).await;
        assert_eq!(client.recv().await["type"], "status");
    }

    #[tokio::test]
    async fn test_overlong_line_is_rejected_and_connection_survives() {
        let (backend, invocations) = EchoBackend::new(Duration::ZERO);
        let server = start_server(Box::new(backend), config()).await;
        let mut client = Client::ready(&server.path).await;

        let content = "x".repeat(MAX_LINE_BYTES + 16);
        client
            .send(json!({"type":"sendMessage","content":content,"messageId":1}))
            .await;
        assert_eq!(
            client.recv().await,
            json!({"type":"error","message":"Invalid message format"})
        );

        client
            .send(json!({"type":"sendMessage","content":"short","messageId":2}))
            .await;
        assert_eq!(
            client.recv().await,
            json!({"type":"response","content":"echo: short","messageId":2})
        );
        assert_eq!(invocations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_records_split_and_batched_across_reads() {
        let (backend, _) = EchoBackend::new(Duration::ZERO);
        let server = start_server(Box::new(backend), config()).await;
        let mut client = Client::ready(&server.path).await;

        client.send_raw("{\"type\":\"authent").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        client
            .send_raw("icate\",\"userId\":\"u7\",\"username\":\"bob\"}\n{\"type\":\"clearContext\"}\n")
            .await;

        assert_eq!(client.recv().await["type"], "authenticated");
        assert_eq!(client.recv().await, json!({"type":"contextCleared"}));
    }

    #[tokio::test]
    async fn test_clear_context_resets_status() {
        let (backend, _) = EchoBackend::new(Duration::ZERO);
        let server = start_server(Box::new(backend), config()).await;
        let mut client = Client::ready(&server.path).await;

        client
            .send(json!({"type":"sendMessage","content":"remember this","messageId":1}))
            .await;
        assert_eq!(client.recv().await["type"], "response");

        client.send(json!({"type":"getStatus"})).await;
        let status = client.recv().await;
        assert_eq!(status["connected"], true);
        assert_eq!(status["activeSessions"], 1);
        assert_eq!(status["queueLength"], 0);
        assert_eq!(status["inFlightOwner"], Value::Null);
        assert_eq!(status["turnCount"], 2);
        assert!(status["contextTokens"].as_u64().unwrap() > 0);
        assert_eq!(status["contextBudget"], 3584);
        assert_eq!(status["backendState"], "ready");

        client.send(json!({"type":"clearContext"})).await;
        assert_eq!(client.recv().await, json!({"type":"contextCleared"}));

        client.send(json!({"type":"getStatus"})).await;
        let status = client.recv().await;
        assert_eq!(status["turnCount"], 0);
        assert_eq!(status["contextTokens"], 0);
    }

    #[tokio::test]
    async fn test_oversized_message_never_reaches_backend() {
        let (backend, invocations) = EchoBackend::new(Duration::ZERO);
        let mut config = config();
        config.context.context_size = 100;
        config.context.max_tokens = 50;
        let server = start_server(Box::new(backend), config).await;
        let mut client = Client::ready(&server.path).await;

        client
            .send(json!({"type":"sendMessage","content":"x".repeat(400),"messageId":9}))
            .await;
        assert_eq!(
            client.recv().await,
            json!({
                "type":"error",
                "message":"Context budget exceeded (200% of 50 tokens)",
                "messageId":9
            })
        );
        assert!(invocations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_outstanding_request_is_refused() {
        let gate = Arc::new(Notify::new());
        let (backend, invocations) = EchoBackend::gated(Duration::ZERO, Arc::clone(&gate));
        let server = start_server(Box::new(backend), config()).await;
        let mut client = Client::ready(&server.path).await;

        client
            .send(json!({"type":"sendMessage","content":"one","messageId":1}))
            .await;
        client
            .send(json!({"type":"sendMessage","content":"two","messageId":2}))
            .await;
        assert_eq!(
            client.recv().await,
            json!({
                "type":"error",
                "message":"A request is already in progress for this session",
                "messageId":2
            })
        );

        gate.notify_one();
        assert_eq!(
            client.recv().await,
            json!({"type":"response","content":"echo: one","messageId":1})
        );
        assert_eq!(invocations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_names_in_flight_owner() {
        let gate = Arc::new(Notify::new());
        let (backend, _) = EchoBackend::gated(Duration::ZERO, Arc::clone(&gate));
        let server = start_server(Box::new(backend), config()).await;
        let mut alice = Client::ready(&server.path).await;
        let mut bob = Client::ready(&server.path).await;

        alice
            .send(json!({"type":"authenticate","userId":1,"username":"alice"}))
            .await;
        alice.recv().await;
        alice
            .send(json!({"type":"sendMessage","content":"slow","messageId":1}))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        bob.send(json!({"type":"sendMessage","content":"queued","messageId":2}))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        bob.send(json!({"type":"getStatus"})).await;
        let status = bob.recv().await;
        assert_eq!(status["activeSessions"], 2);
        assert_eq!(status["queueLength"], 1);
        assert_eq!(status["inFlightOwner"], "alice");

        gate.notify_one();
        assert_eq!(alice.recv().await["content"], "echo: slow");
        assert_eq!(bob.recv().await["content"], "echo: queued");
    }

    #[tokio::test]
    async fn test_disconnect_discards_queued_request() {
        let gate = Arc::new(Notify::new());
        let (backend, invocations) = EchoBackend::gated(Duration::ZERO, Arc::clone(&gate));
        let server = start_server(Box::new(backend), config()).await;
        let mut alice = Client::ready(&server.path).await;
        let mut bob = Client::ready(&server.path).await;

        alice
            .send(json!({"type":"sendMessage","content":"first","messageId":1}))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        bob.send(json!({"type":"sendMessage","content":"never","messageId":2}))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(bob);
        tokio::time::sleep(Duration::from_millis(50)).await;

        gate.notify_one();
        assert_eq!(alice.recv().await["content"], "echo: first");

        alice.send(json!({"type":"getStatus"})).await;
        let status = alice.recv().await;
        assert_eq!(status["activeSessions"], 1);
        assert_eq!(status["queueLength"], 0);
        let messages: Vec<String> = invocations
            .lock()
            .unwrap()
            .iter()
            .map(|(message, _, _)| message.clone())
            .collect();
        assert_eq!(messages, vec!["first".to_string()]);
    }

    #[tokio::test]
    async fn test_authentication_can_be_required() {
        let (backend, invocations) = EchoBackend::new(Duration::ZERO);
        let mut config = config();
        config.server.require_authentication = true;
        let server = start_server(Box::new(backend), config).await;
        let mut client = Client::ready(&server.path).await;

        client
            .send(json!({"type":"sendMessage","content":"hi","messageId":1}))
            .await;
        assert_eq!(
            client.recv().await,
            json!({"type":"error","message":"Not authenticated","messageId":1})
        );

        client
            .send(json!({"type":"authenticate","userId":5,"username":"carol"}))
            .await;
        client.recv().await;
        client
            .send(json!({"type":"sendMessage","content":"hi","messageId":2}))
            .await;
        assert_eq!(client.recv().await["content"], "echo: hi");
        assert_eq!(invocations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_connections_beyond_capacity_are_turned_away() {
        let (backend, _) = EchoBackend::new(Duration::ZERO);
        let mut config = config();
        config.server.max_sessions = 1;
        let server = start_server(Box::new(backend), config).await;
        let _first = Client::ready(&server.path).await;

        let mut second = Client::connect(&server.path).await;
        assert_eq!(
            second.recv().await,
            json!({"type":"error","message":"Server at capacity"})
        );
        assert!(second.at_eof().await);
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients_and_removes_socket() {
        let (backend, _) = EchoBackend::new(Duration::ZERO);
        let server = start_server(Box::new(backend), config()).await;
        let mut client = Client::ready(&server.path).await;
        assert!(server.path.exists());

        server.shutdown.cancel();
        server.task.await.unwrap();

        assert!(client.at_eof().await);
        assert!(!server.path.exists());
    }

    #[tokio::test]
    async fn test_stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        std::fs::write(&path, b"stale").unwrap();

        let (mut backend, _) = EchoBackend::new(Duration::ZERO);
        backend.start().await.unwrap();
        let (dispatcher, _) = Dispatcher::new(Box::new(backend)).spawn();
        let manager = ConnectionManager::new(&path, ServerContext::new(&config(), dispatcher));

        let _listener = manager.bind().unwrap();
        assert!(UnixStream::connect(&path).await.is_ok());
    }

    #[tokio::test]
    async fn test_silent_backend_times_out_and_queue_moves_on() {
        const SCRIPT: &str = r#"#!/bin/sh
printf 'ready\n> '
while IFS= read -r line; do
  case "$line" in
    stall*) ;;
    *) printf '%s back<|im_end|>\n> ' "$line" ;;
  esac
done
"#;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("model.sh");
        std::fs::write(&script, SCRIPT).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let settings = ProcessBackendConfig {
            executable: script.to_string_lossy().into_owned(),
            readiness_sentinels: vec!["ready".to_string()],
            ..ProcessBackendConfig::default()
        };
        let backend = ProcessBackend::new(settings, MarkerSet::default())
            .with_startup_timeout(Duration::from_secs(5))
            .with_request_timeout(Duration::from_millis(300));
        let server = start_server(Box::new(backend), config()).await;
        let mut first = Client::ready(&server.path).await;
        let mut second = Client::ready(&server.path).await;

        first
            .send(json!({"type":"sendMessage","content":"stall","messageId":1}))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        second
            .send(json!({"type":"sendMessage","content":"ping","messageId":2}))
            .await;

        let failed = first.recv().await;
        assert_eq!(failed["type"], "error");
        assert_eq!(failed["messageId"], 1);
        assert!(failed["message"].as_str().unwrap().contains("timed out"));

        assert_eq!(
            second.recv().await,
            json!({"type":"response","content":"ping back","messageId":2})
        );
    }
}
