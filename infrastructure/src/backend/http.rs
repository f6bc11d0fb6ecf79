//! HTTP completion-service backend.
//!
//! Talks to an OpenAI-style `/v1/completions` endpoint (llama.cpp's
//! `llama-server`, vLLM, ...). The service is stateless between requests,
//! so each prompt is the rendered transcript of the session so far.
//!
//! The broker may launch the service itself (`launch_command`), but never
//! stops it: the service outlives the broker.

use async_trait::async_trait;
use broker_application::config::{BrokerConfig, HttpBackendConfig};
use broker_application::ports::backend::{
    BackendError, BackendKind, BackendRequest, BackendState, BackendStatus, LlmBackend,
};
use broker_domain::render_transcript;
use broker_domain::util::preview;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: usize,
    temperature: f32,
    stop: &'a [String],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: Option<String>,
}

/// [`LlmBackend`] over a remote completion endpoint.
pub struct HttpBackend {
    settings: HttpBackendConfig,
    max_tokens: usize,
    system_prompt: Option<String>,
    startup_timeout: Duration,
    request_timeout: Duration,
    client: reqwest::Client,
    status: BackendStatus,
    launched: Option<Child>,
}

impl HttpBackend {
    pub fn new(settings: HttpBackendConfig) -> Self {
        Self {
            settings,
            max_tokens: 512,
            system_prompt: None,
            startup_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(120),
            client: reqwest::Client::new(),
            status: BackendStatus::new(),
            launched: None,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.backend.http.clone())
            .with_max_tokens(config.context.max_tokens)
            .with_system_prompt(config.backend.system_prompt.clone())
            .with_startup_timeout(config.backend.startup_timeout())
            .with_request_timeout(config.backend.request_timeout())
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Use a preconfigured HTTP client (proxies, TLS roots).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    fn launch(&mut self, command: &[String]) -> Result<(), BackendError> {
        let Some((program, args)) = command.split_first() else {
            return Ok(());
        };
        info!("Launching completion service: {}", command.join(" "));
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;
        self.launched = Some(child);
        Ok(())
    }

    async fn wait_healthy(&self) {
        let url = self.settings.health_url();
        loop {
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => debug!("Health check {}: {}", url, response.status()),
                Err(e) => debug!("Health check {} failed: {}", url, e),
            }
            tokio::time::sleep(self.settings.health_poll_interval()).await;
        }
    }

    async fn complete(&self, body: &CompletionRequest<'_>) -> Result<String, BackendError> {
        let response = self
            .client
            .post(self.settings.completion_url())
            .json(body)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BackendError::Request(format!(
                "HTTP {}: {}",
                status,
                preview(detail.trim(), 200)
            )));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Request(format!("Invalid completion body: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.text)
            .map(|text| text.trim().to_string())
            .ok_or(BackendError::NoCompletion)
    }
}

#[async_trait]
impl LlmBackend for HttpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.status.subscribe()
    }

    async fn start(&mut self) -> Result<(), BackendError> {
        if self.status.current() != BackendState::Starting {
            return Ok(());
        }

        if let Some(command) = self.settings.launch_command.clone()
            && let Err(e) = self.launch(&command)
        {
            self.status.transition(BackendState::Stopped);
            return Err(e);
        }

        let started = Instant::now();
        info!(
            "Waiting for completion service at {}",
            self.settings.health_url()
        );
        match tokio::time::timeout(self.startup_timeout, self.wait_healthy()).await {
            Ok(()) => {
                self.status.transition(BackendState::Ready);
                info!("Completion service ready after {:?}", started.elapsed());
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Completion service not healthy within {:?}",
                    self.startup_timeout
                );
                self.status.transition(BackendState::Stopped);
                Err(BackendError::StartupTimeout(self.startup_timeout))
            }
        }
    }

    async fn send(&mut self, request: &BackendRequest) -> Result<String, BackendError> {
        if !self.status.current().is_available() {
            return Err(BackendError::Unavailable);
        }

        let prompt = render_transcript(
            self.system_prompt.as_deref(),
            &request.history,
            &request.message,
        );
        let body = CompletionRequest {
            model: &self.settings.model,
            prompt: &prompt,
            max_tokens: self.max_tokens,
            temperature: self.settings.temperature,
            stop: &self.settings.stop,
            stream: false,
        };

        match tokio::time::timeout(self.request_timeout, self.complete(&body)).await {
            Ok(Ok(text)) => {
                if self.status.current() == BackendState::Degraded {
                    self.status.transition(BackendState::Ready);
                }
                Ok(text)
            }
            Ok(Err(e)) => {
                warn!("Completion request failed: {}", e);
                self.status.transition(BackendState::Degraded);
                Err(e)
            }
            Err(_) => {
                warn!("Completion request timed out after {:?}", self.request_timeout);
                self.status.transition(BackendState::Degraded);
                Err(BackendError::RequestTimeout(self.request_timeout))
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(child) = self.launched.take() {
            debug!(
                "Leaving completion service running (pid {:?})",
                child.id()
            );
        }
        self.status.transition(BackendState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_domain::{SessionId, Turn};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend_for(endpoint: String) -> HttpBackend {
        let settings = HttpBackendConfig {
            endpoint,
            health_poll_interval_ms: 10,
            ..HttpBackendConfig::default()
        };
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        HttpBackend::new(settings)
            .with_client(client)
            .with_startup_timeout(Duration::from_secs(5))
            .with_request_timeout(Duration::from_secs(5))
    }

    fn backend(server: &MockServer) -> HttpBackend {
        backend_for(server.uri())
    }

    fn completion(text: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .set_body_json(serde_json::json!({ "choices": [{ "text": text }] }))
    }

    /// A completion service whose health endpoint is up from the start.
    async fn healthy_service() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        server
    }

    async fn requests_to(server: &MockServer, route: &str) -> Vec<wiremock::Request> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .filter(|request| request.url.path() == route)
            .collect()
    }

    #[tokio::test]
    async fn test_start_polls_health_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut backend = backend(&server);
        let state = backend.subscribe();
        backend.start().await.unwrap();

        assert_eq!(*state.borrow(), BackendState::Ready);
        assert_eq!(requests_to(&server, "/health").await.len(), 3);
    }

    #[tokio::test]
    async fn test_send_posts_transcript_and_returns_text() {
        let server = healthy_service().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(completion("  Paris.\n"))
            .expect(1)
            .mount(&server)
            .await;

        let mut backend = backend(&server).with_max_tokens(64);
        backend.start().await.unwrap();

        let request = BackendRequest::new(SessionId::new(1), "And of France?")
            .with_history(vec![Turn::user("Capital of Italy?"), Turn::assistant("Rome.")]);
        let reply = backend.send(&request).await.unwrap();
        assert_eq!(reply, "Paris.");

        let posted = requests_to(&server, "/v1/completions").await;
        assert_eq!(posted.len(), 1);
        let body: serde_json::Value = posted[0].body_json().unwrap();
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["stream"], false);
        assert_eq!(body["model"], "local-model");
        assert!(body["stop"].is_array());
        assert_eq!(
            body["prompt"],
            "User: Capital of Italy?\nAssistant: Rome.\nUser: And of France?\nAssistant:"
        );
    }

    #[tokio::test]
    async fn test_missing_text_is_no_completion_and_degrades() {
        let server = healthy_service().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(completion("fine"))
            .mount(&server)
            .await;

        let mut backend = backend(&server);
        let state = backend.subscribe();
        backend.start().await.unwrap();

        let request = BackendRequest::new(SessionId::new(1), "hi");
        let err = backend.send(&request).await.unwrap_err();
        assert!(matches!(err, BackendError::NoCompletion));
        assert_eq!(*state.borrow(), BackendState::Degraded);

        assert_eq!(backend.send(&request).await.unwrap(), "fine");
        assert_eq!(*state.borrow(), BackendState::Ready);
    }

    #[tokio::test]
    async fn test_error_status_is_request_error() {
        let server = healthy_service().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string(r#"{"error":"out of memory"}"#),
            )
            .mount(&server)
            .await;

        let mut backend = backend(&server);
        backend.start().await.unwrap();

        let err = backend
            .send(&BackendRequest::new(SessionId::new(1), "hi"))
            .await
            .unwrap_err();
        match err {
            BackendError::Request(detail) => {
                assert!(detail.contains("500"));
                assert!(detail.contains("out of memory"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_slow_completion_times_out_and_degrades() {
        let server = healthy_service().await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(completion("too late").set_delay(Duration::from_millis(500)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/completions"))
            .respond_with(completion("on time"))
            .mount(&server)
            .await;

        let mut backend = backend(&server).with_request_timeout(Duration::from_millis(100));
        let state = backend.subscribe();
        backend.start().await.unwrap();

        let request = BackendRequest::new(SessionId::new(1), "hi");
        let err = backend.send(&request).await.unwrap_err();
        assert!(matches!(err, BackendError::RequestTimeout(_)));
        assert_eq!(*state.borrow(), BackendState::Degraded);

        assert_eq!(backend.send(&request).await.unwrap(), "on time");
        assert_eq!(*state.borrow(), BackendState::Ready);
    }

    #[tokio::test]
    async fn test_connection_refused_is_request_error() {
        let server = healthy_service().await;
        let mut backend = backend(&server);
        let state = backend.subscribe();
        backend.start().await.unwrap();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);
        backend.settings.endpoint = format!("http://{}", closed);

        let err = backend
            .send(&BackendRequest::new(SessionId::new(1), "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Request(_)));
        assert_eq!(*state.borrow(), BackendState::Degraded);
    }

    #[tokio::test]
    async fn test_launch_command_is_spawned() {
        let server = healthy_service().await;
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("launched");

        let mut backend = backend(&server);
        backend.settings.launch_command = Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            format!("touch {}", marker.display()),
        ]);
        let state = backend.subscribe();
        backend.start().await.unwrap();
        assert_eq!(*state.borrow(), BackendState::Ready);

        let mut child = backend.launched.take().unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(exit.success());
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn test_unlaunchable_command_stops_backend() {
        let server = healthy_service().await;
        let mut backend = backend(&server);
        backend.settings.launch_command = Some(vec!["/nonexistent/llm-server".to_string()]);
        let state = backend.subscribe();

        let err = backend.start().await.unwrap_err();
        assert!(matches!(err, BackendError::Spawn(_)));
        assert_eq!(*state.borrow(), BackendState::Stopped);
        assert!(requests_to(&server, "/health").await.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_leaves_launched_service_running() {
        let server = healthy_service().await;
        let mut backend = backend(&server);
        backend.settings.launch_command =
            Some(vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 1".to_string()]);
        let state = backend.subscribe();
        backend.start().await.unwrap();
        let pid = backend.launched.as_ref().and_then(|child| child.id()).unwrap();

        backend.stop().await;
        assert_eq!(*state.borrow(), BackendState::Stopped);
        assert!(backend.launched.is_none());
        // signal 0 only checks that the process still exists
        assert_eq!(unsafe { libc::kill(pid as libc::pid_t, 0) }, 0);
    }

    #[tokio::test]
    async fn test_unreachable_service_times_out_at_startup() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed = listener.local_addr().unwrap();
        drop(listener);

        let mut backend = backend_for(format!("http://{}", closed))
            .with_startup_timeout(Duration::from_millis(150));
        let state = backend.subscribe();

        let err = backend.start().await.unwrap_err();
        assert!(matches!(err, BackendError::StartupTimeout(_)));
        assert_eq!(*state.borrow(), BackendState::Stopped);
    }
}
