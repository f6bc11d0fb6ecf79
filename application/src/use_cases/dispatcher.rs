//! Dispatcher: FIFO, single-flight access to the backend.
//!
//! Every session's requests funnel through one [`Dispatcher`] task that owns
//! the [`LlmBackend`] exclusively. Requests are served in strict arrival
//! order and never more than one is outstanding against the backend,
//! whether or not the backend itself could batch.
//!
//! # Single flight by ownership
//!
//! While a request is in flight the backend is *moved into* the in-flight
//! future and only handed back when that future settles. There is no
//! second backend to dispatch to, so the invariant holds by construction
//! rather than by a flag.
//!
//! # Message passing
//!
//! Callers talk to the task through a cloneable [`DispatcherHandle`]:
//! submissions return a [`Ticket`] that resolves once the request settles.
//! Snapshots and session discards travel the same channel, so they are
//! ordered with respect to submissions.
//!
//! # Policies
//!
//! - A session that disconnects has its *queued* entries discarded; an
//!   in-flight entry runs to completion and its result is dropped.
//! - When the backend reports that it is gone, every queued entry settles
//!   with [`BackendError::Unavailable`] and later submissions fail the same
//!   way without touching the backend.
//! - Queue depth is unbounded.

use crate::error::BrokerError;
use crate::ports::backend::{BackendError, BackendRequest, BackendState, LlmBackend};
use crate::ports::conversation_logger::{
    ConversationEvent, ConversationLogger, NoConversationLogger,
};
use broker_domain::util::preview;
use broker_domain::{SessionId, WireId};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome delivered to the submitter of a request.
pub type Completion = Result<String, BrokerError>;

/// A request waiting for (or undergoing) dispatch.
pub struct QueueEntry {
    request: BackendRequest,
    message_id: Option<WireId>,
    enqueued_at: Instant,
    reply: oneshot::Sender<Completion>,
}

impl QueueEntry {
    fn owner(&self) -> SessionId {
        self.request.session
    }

    fn settle(self, result: Completion) {
        if self.reply.send(result).is_err() {
            debug!(
                "Dispatcher: submitter for {} went away before settlement",
                self.request.session
            );
        }
    }
}

/// Resolves when a submitted request settles.
pub struct Ticket {
    rx: oneshot::Receiver<Completion>,
}

impl Ticket {
    /// Wait for the completion. A request dropped without settlement
    /// (discarded, or the dispatcher stopped) yields
    /// [`BrokerError::RequestDiscarded`].
    pub async fn settled(self) -> Completion {
        self.rx
            .await
            .unwrap_or(Err(BrokerError::RequestDiscarded))
    }
}

/// Point-in-time view of the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSnapshot {
    /// Entries waiting behind the in-flight one.
    pub queue_length: usize,
    /// Session whose request the backend is serving right now.
    pub in_flight: Option<SessionId>,
    pub backend_state: BackendState,
}

enum Command {
    Enqueue(QueueEntry),
    Discard(SessionId),
    Snapshot(oneshot::Sender<QueueSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to the dispatcher task.
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
    backend_state: watch::Receiver<BackendState>,
}

impl DispatcherHandle {
    /// Append a request to the tail of the queue.
    pub fn submit(
        &self,
        request: BackendRequest,
        message_id: Option<WireId>,
    ) -> Result<Ticket, BrokerError> {
        let (reply, rx) = oneshot::channel();
        let entry = QueueEntry {
            request,
            message_id,
            enqueued_at: Instant::now(),
            reply,
        };
        self.commands
            .send(Command::Enqueue(entry))
            .map_err(|_| BrokerError::DispatcherStopped)?;
        Ok(Ticket { rx })
    }

    /// Drop every queued (not yet dispatched) entry owned by `session`.
    pub fn discard(&self, session: SessionId) {
        let _ = self.commands.send(Command::Discard(session));
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(tx))
            .map_err(|_| BrokerError::DispatcherStopped)?;
        rx.await.map_err(|_| BrokerError::DispatcherStopped)
    }

    /// Fail queued entries, stop the backend, and end the task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn backend_state(&self) -> BackendState {
        *self.backend_state.borrow()
    }

    /// Watch backend lifecycle transitions.
    pub fn watch_backend(&self) -> watch::Receiver<BackendState> {
        self.backend_state.clone()
    }
}

struct Settled {
    backend: Box<dyn LlmBackend>,
    entry: QueueEntry,
    result: Result<String, BackendError>,
    elapsed: Duration,
}

struct InFlight {
    owner: SessionId,
    settled: BoxFuture<'static, Settled>,
}

/// The dispatcher task state. Build with [`Dispatcher::new`], then
/// [`spawn`](Dispatcher::spawn).
pub struct Dispatcher {
    backend: Option<Box<dyn LlmBackend>>,
    backend_state: watch::Receiver<BackendState>,
    queue: VecDeque<QueueEntry>,
    in_flight: Option<InFlight>,
    conversation_logger: Arc<dyn ConversationLogger>,
}

impl Dispatcher {
    /// Wrap an already started backend.
    pub fn new(backend: Box<dyn LlmBackend>) -> Self {
        let backend_state = backend.subscribe();
        Self {
            backend: Some(backend),
            backend_state,
            queue: VecDeque::new(),
            in_flight: None,
            conversation_logger: Arc::new(NoConversationLogger),
        }
    }

    /// Create with a conversation logger.
    pub fn with_conversation_logger(mut self, logger: Arc<dyn ConversationLogger>) -> Self {
        self.conversation_logger = logger;
        self
    }

    /// Run the dispatcher on its own task.
    pub fn spawn(self) -> (DispatcherHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = DispatcherHandle {
            commands,
            backend_state: self.backend_state.clone(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("Dispatcher: started");

        loop {
            self.drain();

            tokio::select! {
                Some(settled) = next_settled(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.settle(settled);
                }
                command = commands.recv() => match command {
                    Some(Command::Enqueue(entry)) => self.enqueue(entry),
                    Some(Command::Discard(session)) => self.discard(session),
                    Some(Command::Snapshot(tx)) => {
                        let _ = tx.send(self.snapshot());
                    }
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        info!("Dispatcher: stopped");
    }

    fn backend_available(&self) -> bool {
        self.backend_state.borrow().is_available()
    }

    fn enqueue(&mut self, entry: QueueEntry) {
        if !self.backend_available() {
            debug!("Dispatcher: backend unavailable, rejecting {}", entry.owner());
            self.log_rejection(&entry, "backend unavailable");
            entry.settle(Err(BackendError::Unavailable.into()));
            return;
        }
        debug!(
            "Dispatcher: enqueued request from {} (queue length {})",
            entry.owner(),
            self.queue.len() + 1
        );
        self.queue.push_back(entry);
    }

    /// Start the next request if the backend is idle.
    fn drain(&mut self) {
        while self.in_flight.is_none() {
            let Some(entry) = self.queue.pop_front() else {
                return;
            };

            if !self.backend_available() {
                entry.settle(Err(BackendError::Unavailable.into()));
                continue;
            }
            let Some(mut backend) = self.backend.take() else {
                entry.settle(Err(BackendError::Unavailable.into()));
                continue;
            };

            let owner = entry.owner();
            let waited = entry.enqueued_at.elapsed();
            debug!(
                "Dispatcher: dispatching {} after {:?} in queue: {}",
                owner,
                waited,
                preview(&entry.request.message, 80)
            );
            self.conversation_logger.log(ConversationEvent::new(
                "backend_request",
                serde_json::json!({
                    "session": owner.as_u64(),
                    "message_id": entry.message_id,
                    "bytes": entry.request.message.len(),
                    "queue_wait_ms": waited.as_millis() as u64,
                    "text": entry.request.message,
                }),
            ));

            let settled = async move {
                let started = Instant::now();
                let result = backend.send(&entry.request).await;
                Settled {
                    backend,
                    entry,
                    result,
                    elapsed: started.elapsed(),
                }
            }
            .boxed();

            self.in_flight = Some(InFlight { owner, settled });
        }
    }

    fn settle(&mut self, settled: Settled) {
        self.in_flight = None;
        let Settled {
            backend,
            entry,
            result,
            elapsed,
        } = settled;
        self.backend = Some(backend);
        let owner = entry.owner();

        match result {
            Ok(text) => {
                info!(
                    "Dispatcher: {} answered in {:?} ({} bytes)",
                    owner,
                    elapsed,
                    text.len()
                );
                self.conversation_logger.log(ConversationEvent::new(
                    "backend_response",
                    serde_json::json!({
                        "session": owner.as_u64(),
                        "message_id": entry.message_id,
                        "bytes": text.len(),
                        "elapsed_ms": elapsed.as_millis() as u64,
                        "text": text,
                    }),
                ));
                entry.settle(Ok(text));
            }
            Err(error) => {
                warn!("Dispatcher: request from {} failed: {}", owner, error);
                self.conversation_logger.log(ConversationEvent::new(
                    "backend_error",
                    serde_json::json!({
                        "session": owner.as_u64(),
                        "message_id": entry.message_id,
                        "elapsed_ms": elapsed.as_millis() as u64,
                        "error": error.to_string(),
                    }),
                ));
                let terminal = error.is_terminal();
                entry.settle(Err(error.into()));
                if terminal {
                    self.fail_queued();
                }
            }
        }
    }

    fn discard(&mut self, session: SessionId) {
        let (discarded, kept): (VecDeque<_>, VecDeque<_>) = self
            .queue
            .drain(..)
            .partition(|entry| entry.owner() == session);
        self.queue = kept;

        if !discarded.is_empty() {
            debug!(
                "Dispatcher: discarded {} queued request(s) from {}",
                discarded.len(),
                session
            );
        }
        for entry in discarded {
            entry.settle(Err(BrokerError::RequestDiscarded));
        }
        if self.in_flight.as_ref().is_some_and(|f| f.owner == session) {
            debug!(
                "Dispatcher: in-flight request from {} will complete unobserved",
                session
            );
        }
    }

    fn fail_queued(&mut self) {
        if !self.queue.is_empty() {
            warn!(
                "Dispatcher: backend gone, failing {} queued request(s)",
                self.queue.len()
            );
        }
        for entry in self.queue.drain(..) {
            entry.settle(Err(BackendError::Unavailable.into()));
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            queue_length: self.queue.len(),
            in_flight: self.in_flight.as_ref().map(|f| f.owner),
            backend_state: *self.backend_state.borrow(),
        }
    }

    async fn shutdown(&mut self) {
        self.fail_queued();
        if let Some(in_flight) = self.in_flight.take() {
            // Dropping the future drops the backend it holds, which releases
            // the underlying process.
            warn!(
                "Dispatcher: abandoning in-flight request from {}",
                in_flight.owner
            );
        }
        if let Some(backend) = self.backend.as_mut() {
            backend.stop().await;
        }
    }

    fn log_rejection(&self, entry: &QueueEntry, reason: &str) {
        self.conversation_logger.log(ConversationEvent::new(
            "request_rejected",
            serde_json::json!({
                "session": entry.owner().as_u64(),
                "message_id": entry.message_id,
                "reason": reason,
            }),
        ));
    }
}

async fn next_settled(slot: &mut Option<InFlight>) -> Option<Settled> {
    match slot {
        Some(in_flight) => Some((&mut in_flight.settled).await),
        None => None,
    }
}
