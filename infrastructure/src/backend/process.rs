//! Child-process backend driven over its standard streams.
//!
//! The model runs as a long-lived interactive process (llama.cpp's
//! `llama-cli` by default). Each request is written to its stdin as one
//! line; the reply is whatever appears on stdout until a terminal marker
//! shows up, since the process offers no structured end-of-generation
//! event.
//!
//! Two background tasks pump stdout and stderr into a single channel as
//! text chunks. Readiness is detected on both streams; replies are
//! accumulated from stdout only. When both streams close the process is
//! gone and the backend moves to [`BackendState::Stopped`].
//!
//! A request that times out is abandoned, not cancelled: the process may
//! keep generating. The next request first reads and discards output until
//! the abandoned reply's own terminal marker, then writes. A reply that
//! shows no marker within one more request timeout is given up on.

use async_trait::async_trait;
use broker_application::config::{BrokerConfig, ProcessBackendConfig};
use broker_application::ports::backend::{
    BackendError, BackendKind, BackendRequest, BackendState, BackendStatus, LlmBackend,
};
use broker_domain::util::preview;
use broker_domain::{CompletionDetector, MarkerSet, ResponseCleaner};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

const READ_CHUNK_BYTES: usize = 4096;

/// How long `stop` waits for the process to exit after the kill signal.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// A piece of process output, tagged with the stream it came from.
#[derive(Debug)]
enum Chunk {
    Stdout(String),
    Stderr(String),
}

impl Chunk {
    fn text(&self) -> &str {
        match self {
            Chunk::Stdout(text) | Chunk::Stderr(text) => text,
        }
    }
}

/// [`LlmBackend`] over an interactive child process.
pub struct ProcessBackend {
    settings: ProcessBackendConfig,
    context_size: usize,
    startup_timeout: Duration,
    request_timeout: Duration,
    detector: CompletionDetector,
    cleaner: ResponseCleaner,
    status: Arc<BackendStatus>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    output: Option<mpsc::UnboundedReceiver<Chunk>>,
    /// Partial output of a timed-out reply the process is still producing.
    abandoned: Option<String>,
}

impl ProcessBackend {
    pub fn new(settings: ProcessBackendConfig, markers: MarkerSet) -> Self {
        Self {
            settings,
            context_size: 4096,
            startup_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(120),
            detector: CompletionDetector::new(&markers),
            cleaner: ResponseCleaner::new(markers),
            status: Arc::new(BackendStatus::new()),
            child: None,
            stdin: None,
            output: None,
            abandoned: None,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Self {
        Self::new(config.backend.process.clone(), config.markers.clone())
            .with_context_size(config.context.context_size)
            .with_startup_timeout(config.backend.startup_timeout())
            .with_request_timeout(config.backend.request_timeout())
    }

    pub fn with_context_size(mut self, context_size: usize) -> Self {
        self.context_size = context_size;
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

    /// Launch the process and wire its output into a chunk channel.
    fn spawn_process(&mut self) -> Result<mpsc::UnboundedReceiver<Chunk>, BackendError> {
        let args = self.settings.args(self.context_size);
        info!(
            "Starting backend process: {} {}",
            self.settings.executable,
            args.join(" ")
        );

        let mut cmd = Command::new(&self.settings.executable);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Linux: request kernel to send SIGTERM to child when parent dies.
        // This catches cases where Drop doesn't run (SIGKILL, OOM kill).
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;

        let missing = |stream: &str| {
            BackendError::Spawn(std::io::Error::other(format!(
                "Failed to capture backend {}",
                stream
            )))
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let stdout_pump = tokio::spawn(pump(stdout, tx.clone(), Chunk::Stdout));
        let stderr_pump = tokio::spawn(pump(stderr, tx, Chunk::Stderr));

        let status = Arc::clone(&self.status);
        tokio::spawn(async move {
            let _ = tokio::join!(stdout_pump, stderr_pump);
            if status.transition(BackendState::Stopped) {
                warn!("Backend process closed its output streams; backend stopped");
            }
        });

        self.child = Some(child);
        self.stdin = Some(stdin);
        Ok(rx)
    }

    async fn terminate(&mut self) {
        self.stdin = None;
        self.output = None;
        self.abandoned = None;

        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(exit)) => info!("Backend process exited: {}", exit),
                Ok(Err(e)) => warn!("Failed to reap backend process: {}", e),
                Err(_) => warn!("Backend process did not exit within {:?}", STOP_GRACE),
            }
        }
    }
}

#[async_trait]
impl LlmBackend for ProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Process
    }

    fn subscribe(&self) -> watch::Receiver<BackendState> {
        self.status.subscribe()
    }

    async fn start(&mut self) -> Result<(), BackendError> {
        if self.child.is_some() {
            debug!("Backend process already started");
            return Ok(());
        }

        let mut output = match self.spawn_process() {
            Ok(output) => output,
            Err(e) => {
                self.status.transition(BackendState::Stopped);
                return Err(e);
            }
        };

        let started = Instant::now();
        let readiness = tokio::time::timeout(
            self.startup_timeout,
            await_readiness(&self.settings.readiness_sentinels, &mut output),
        )
        .await;

        match readiness {
            Ok(Ok(())) => {
                self.output = Some(output);
                self.status.transition(BackendState::Ready);
                info!("Backend process ready after {:?}", started.elapsed());
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Backend process exited during startup");
                self.terminate().await;
                self.status.transition(BackendState::Stopped);
                Err(e)
            }
            Err(_) => {
                warn!(
                    "No readiness sentinel from backend within {:?}",
                    self.startup_timeout
                );
                self.terminate().await;
                self.status.transition(BackendState::Stopped);
                Err(BackendError::StartupTimeout(self.startup_timeout))
            }
        }
    }

    async fn send(&mut self, request: &BackendRequest) -> Result<String, BackendError> {
        if !self.status.current().is_available() {
            return Err(BackendError::Unavailable);
        }
        let (Some(stdin), Some(output)) = (self.stdin.as_mut(), self.output.as_mut()) else {
            return Err(BackendError::Unavailable);
        };

        if let Some(mut partial) = self.abandoned.take() {
            let finished = tokio::time::timeout(
                self.request_timeout,
                read_until_terminal(output, &self.detector, &mut partial),
            )
            .await;
            match finished {
                Ok(Ok(())) => debug!(
                    "Abandoned reply finished; discarded {} bytes",
                    partial.len()
                ),
                Ok(Err(e)) => {
                    self.status.transition(BackendState::Stopped);
                    return Err(e);
                }
                Err(_) => warn!(
                    "Abandoned reply still unfinished after {:?}; giving up on it",
                    self.request_timeout
                ),
            }
        }

        let stale = match drain_stale(output) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.status.transition(BackendState::Stopped);
                return Err(e);
            }
        };
        if stale > 0 {
            debug!("Discarded {} bytes of stale backend output", stale);
        }

        trace!("Backend <- {}", preview(&request.message, 200));
        let mut line = request.message.clone();
        line.push('\n');
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!("Writing to backend stdin failed: {}", e);
            self.status.transition(BackendState::Stopped);
            return Err(BackendError::Disconnected);
        }

        let mut raw = String::new();
        let outcome = tokio::time::timeout(
            self.request_timeout,
            read_until_terminal(output, &self.detector, &mut raw),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                trace!("Backend -> {}", preview(&raw, 400));
                if self.status.current() == BackendState::Degraded {
                    self.status.transition(BackendState::Ready);
                }
                let reply = self.cleaner.clean(&raw);
                if reply.is_empty() {
                    return Err(BackendError::NoCompletion);
                }
                Ok(reply)
            }
            Ok(Err(e)) => {
                self.status.transition(BackendState::Stopped);
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Backend reply incomplete after {:?} ({} bytes buffered)",
                    self.request_timeout,
                    raw.len()
                );
                keep_tail(&mut raw, READ_CHUNK_BYTES);
                self.abandoned = Some(raw);
                self.status.transition(BackendState::Degraded);
                Err(BackendError::RequestTimeout(self.request_timeout))
            }
        }
    }

    async fn stop(&mut self) {
        self.terminate().await;
        self.status.transition(BackendState::Stopped);
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            debug!("ProcessBackend dropping, killing backend child process");
            let _ = child.start_kill();
        }
    }
}

/// Wait until any sentinel appears in the process output.
async fn await_readiness(
    sentinels: &[String],
    output: &mut mpsc::UnboundedReceiver<Chunk>,
) -> Result<(), BackendError> {
    if sentinels.is_empty() {
        return Ok(());
    }
    let longest = sentinels.iter().map(String::len).max().unwrap_or(0);
    let mut window = String::new();

    while let Some(chunk) = output.recv().await {
        trace!("Backend startup: {}", preview(chunk.text(), 200));
        window.push_str(chunk.text());
        if let Some(sentinel) = sentinels.iter().find(|s| window.contains(s.as_str())) {
            debug!("Backend readiness sentinel seen: {:?}", sentinel);
            return Ok(());
        }
        keep_tail(&mut window, longest);
    }
    Err(BackendError::Disconnected)
}

/// Accumulate stdout into `raw` until a terminal marker arrives.
async fn read_until_terminal(
    output: &mut mpsc::UnboundedReceiver<Chunk>,
    detector: &CompletionDetector,
    raw: &mut String,
) -> Result<(), BackendError> {
    while let Some(chunk) = output.recv().await {
        match chunk {
            Chunk::Stdout(text) => {
                raw.push_str(&text);
                if detector.is_terminal_tail(raw, text.len()) {
                    return Ok(());
                }
            }
            Chunk::Stderr(text) => trace!("Backend stderr: {}", preview(&text, 200)),
        }
    }
    Err(BackendError::Disconnected)
}

/// Discard output already buffered, returning how many bytes were dropped.
fn drain_stale(output: &mut mpsc::UnboundedReceiver<Chunk>) -> Result<usize, BackendError> {
    let mut dropped = 0;
    loop {
        match output.try_recv() {
            Ok(chunk) => dropped += chunk.text().len(),
            Err(TryRecvError::Empty) => return Ok(dropped),
            Err(TryRecvError::Disconnected) => return Err(BackendError::Disconnected),
        }
    }
}

/// Forward everything read from `source` as text chunks.
async fn pump<R>(mut source: R, tx: mpsc::UnboundedSender<Chunk>, wrap: fn(String) -> Chunk)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_CHUNK_BYTES];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8(&mut pending);
                if !text.is_empty() && tx.send(wrap(text)).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!("Reading backend output failed: {}", e);
                break;
            }
        }
    }

    if !pending.is_empty() {
        let _ = tx.send(wrap(String::from_utf8_lossy(&pending).into_owned()));
    }
}

/// Take the decodable prefix of `pending`, leaving an incomplete trailing
/// UTF-8 sequence for the next read. Invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let valid = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            return text;
        }
    };
    let rest = pending.split_off(valid);
    let complete = std::mem::replace(pending, rest);
    String::from_utf8(complete).unwrap_or_default()
}

/// Keep at most the last `keep` bytes of `window`, on a char boundary.
fn keep_tail(window: &mut String, keep: usize) {
    if window.len() <= keep {
        return;
    }
    let mut cut = window.len() - keep;
    while cut > 0 && !window.is_char_boundary(cut) {
        cut -= 1;
    }
    window.drain(..cut);
}
