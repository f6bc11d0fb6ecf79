//! Per-connection task.
//!
//! One task per accepted socket. It reads newline-delimited records,
//! answers protocol-level requests itself, and hands `sendMessage` to the
//! dispatcher. Replies from every source (direct answers, completions
//! settled later) funnel through one outbound channel that only this task
//! writes to the socket, so records never interleave.

use super::ServerContext;
use super::protocol::{self, ClientMessage, ProtocolError, ServerMessage, StatusReport};
use broker_application::BrokerError;
use broker_application::ports::backend::BackendRequest;
use broker_application::ports::conversation_logger::ConversationEvent;
use broker_application::use_cases::dispatcher::QueueSnapshot;
use broker_domain::util::preview;
use broker_domain::{Identity, Session, SessionId, WireId};
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Longest inbound record accepted, newline excluded.
pub(crate) const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Serve one client until it disconnects or the server shuts down.
pub(crate) async fn serve_connection(
    stream: UnixStream,
    context: Arc<ServerContext>,
    shutdown: CancellationToken,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    let id = match context.registry.open() {
        Ok(id) => id,
        Err(e) => {
            warn!("Refusing connection: {}", e);
            let _ = write_record(&mut write_half, &ServerMessage::error(e.to_string(), None)).await;
            let _ = write_half.shutdown().await;
            return;
        }
    };
    info!("Client connected: {}", id);

    let (outbound, mut outbox) = mpsc::unbounded_channel();
    let connection = Connection {
        id,
        context: Arc::clone(&context),
        outbound,
    };
    connection.reply(ServerMessage::Connected {
        message: "Connected to llm-broker".to_string(),
        server_info: context.server_info.clone(),
    });

    let mut codec = LinesCodec::new_with_max_length(MAX_LINE_BYTES);
    let mut inbound = BytesMut::with_capacity(8 * 1024);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("{}: closing for shutdown", id);
                break;
            }
            Some(message) = outbox.recv() => {
                if let Err(e) = write_record(&mut write_half, &message).await {
                    debug!("{}: write failed: {}", id, e);
                    break;
                }
            }
            read = read_half.read_buf(&mut inbound) => match read {
                Ok(0) => {
                    let last = codec.decode_eof(&mut inbound);
                    connection.handle_frame(last).await;
                    break;
                }
                Ok(_) => loop {
                    let frame = codec.decode(&mut inbound);
                    if matches!(frame, Ok(None)) {
                        break;
                    }
                    connection.handle_frame(frame).await;
                },
                Err(e) => {
                    debug!("{}: read failed: {}", id, e);
                    break;
                }
            },
        }
    }

    connection.close();
}

async fn write_record(writer: &mut OwnedWriteHalf, message: &ServerMessage) -> std::io::Result<()> {
    let line = protocol::encode(message)?;
    trace!("Server -> {}", line.trim_end());
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

struct Connection {
    id: SessionId,
    context: Arc<ServerContext>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
}

impl Connection {
    fn reply(&self, message: ServerMessage) {
        let _ = self.outbound.send(message);
    }

    async fn handle_frame(&self, frame: Result<Option<String>, LinesCodecError>) {
        match frame {
            Ok(Some(line)) => self.handle_line(line.trim()).await,
            Ok(None) => {}
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("{}: dropping record over {} bytes", self.id, MAX_LINE_BYTES);
                self.reply(ServerMessage::error(ProtocolError::InvalidFormat.to_string(), None));
            }
            Err(LinesCodecError::Io(e)) => {
                debug!("{}: undecodable record: {}", self.id, e);
                self.reply(ServerMessage::error(ProtocolError::InvalidFormat.to_string(), None));
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        trace!("{} -> {}", self.id, preview(line, 200));

        match protocol::decode(line) {
            Ok(ClientMessage::Authenticate { user_id, username }) => {
                self.authenticate(user_id, username)
            }
            Ok(ClientMessage::SendMessage {
                content,
                message_id,
            }) => self.send_message(content, message_id),
            Ok(ClientMessage::ClearContext) => self.clear_context(),
            Ok(ClientMessage::GetStatus) => self.status().await,
            Err(e) => {
                debug!("{}: {}", self.id, e);
                self.reply(ServerMessage::error(e.to_string(), None));
            }
        }
    }

    fn authenticate(&self, user_id: WireId, username: String) {
        let identity = match Identity::new(user_id, username) {
            Ok(identity) => identity,
            Err(e) => return self.reply(ServerMessage::error(e.to_string(), None)),
        };
        let reply = ServerMessage::Authenticated {
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
        };
        info!("{} authenticated as {}", self.id, identity.username);
        self.context
            .registry
            .with_session(self.id, |session| session.authenticate(identity));
        self.reply(reply);
    }

    fn send_message(&self, content: String, message_id: Option<WireId>) {
        let context = &self.context;

        let prepared = context.registry.with_session(self.id, |session| {
            if context.require_authentication && !session.is_authenticated() {
                return Err(BrokerError::NotAuthenticated);
            }
            let admission = context.accountant.admit(session.token_count(), &content)?;
            if admission.is_warning() {
                warn!(
                    "{}: context at {}% of {} tokens",
                    session.owner_label(),
                    admission.usage_percent(),
                    context.accountant.budget().available()
                );
            }
            session.begin_request(message_id.clone())?;
            Ok(BackendRequest::new(self.id, content.clone())
                .with_history(session.turns().to_vec()))
        });

        let request = match prepared {
            Some(Ok(request)) => request,
            Some(Err(e)) => return self.reject(e, message_id),
            None => return,
        };

        let ticket = match context.dispatcher.submit(request, message_id.clone()) {
            Ok(ticket) => ticket,
            Err(e) => {
                context
                    .registry
                    .with_session(self.id, Session::abandon_request);
                return self.reply(ServerMessage::error(e.to_string(), message_id));
            }
        };

        let id = self.id;
        let context = Arc::clone(&self.context);
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            match ticket.settled().await {
                Ok(reply) => {
                    let cost = context.accountant.exchange_cost(&content, &reply);
                    let recorded = context
                        .registry
                        .with_session(id, |session| {
                            session.complete_request(&content, &reply, cost)
                        })
                        .is_some();
                    if recorded {
                        let _ = outbound.send(ServerMessage::Response {
                            content: reply,
                            message_id,
                        });
                    } else {
                        debug!("{} disconnected; dropping completed reply", id);
                    }
                }
                Err(BrokerError::RequestDiscarded) => {
                    context.registry.with_session(id, Session::abandon_request);
                }
                Err(e) => {
                    context.registry.with_session(id, Session::abandon_request);
                    let _ = outbound.send(ServerMessage::error(e.to_string(), message_id));
                }
            }
        });
    }

    fn reject(&self, error: BrokerError, message_id: Option<WireId>) {
        info!("{}: request rejected: {}", self.id, error);
        if error.is_rejection() {
            self.context.conversation_logger.log(ConversationEvent::new(
                "request_rejected",
                serde_json::json!({
                    "session": self.id.as_u64(),
                    "message_id": message_id,
                    "reason": error.to_string(),
                }),
            ));
        }
        self.reply(ServerMessage::error(error.to_string(), message_id));
    }

    fn clear_context(&self) {
        self.context
            .registry
            .with_session(self.id, Session::clear_context);
        debug!("{}: context cleared", self.id);
        self.reply(ServerMessage::ContextCleared);
    }

    async fn status(&self) {
        let context = &self.context;
        let snapshot = match context.dispatcher.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(_) => QueueSnapshot {
                queue_length: 0,
                in_flight: None,
                backend_state: context.dispatcher.backend_state(),
            },
        };
        let (turn_count, context_tokens) = context
            .registry
            .with_session(self.id, |session| (session.turns().len(), session.token_count()))
            .unwrap_or_default();

        self.reply(ServerMessage::Status(StatusReport {
            connected: true,
            active_sessions: context.registry.len(),
            queue_length: snapshot.queue_length,
            in_flight_owner: snapshot
                .in_flight
                .map(|owner| context.registry.owner_label(owner)),
            turn_count,
            context_tokens,
            context_budget: context.accountant.budget().available(),
            backend_state: snapshot.backend_state,
        }));
    }

    /// Unregister the session and drop its queued requests.
    fn close(self) {
        if let Some(session) = self.context.registry.close(self.id)
            && session.has_outstanding()
        {
            debug!("{} left with a request outstanding", self.id);
        }
        self.context.dispatcher.discard(self.id);
        info!("Client disconnected: {}", self.id);
    }
}
