//! `llm-broker relay`: a plain-text client for a running broker.
//!
//! Each stdin line becomes a `sendMessage`; `/clear` and `/status` map to
//! `clearContext` and `getStatus`. Server records are printed one per line.
//! After stdin closes the relay waits for outstanding replies, then exits.

use crate::commands::RelayArgs;
use anyhow::{Context, Result, bail};
use broker_domain::WireId;
use broker_infrastructure::ConfigLoader;
use broker_infrastructure::server::protocol::{self, ClientMessage, ServerMessage, StatusReport};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tracing::{debug, info};

pub async fn run(config_path: Option<&Path>, args: RelayArgs) -> Result<()> {
    let socket = match args.socket {
        Some(socket) => socket,
        None => socket_from_config(config_path)?,
    };
    let identity = args.username.map(|username| {
        let user_id = args
            .user_id
            .as_deref()
            .map(parse_user_id)
            .unwrap_or_else(|| WireId::from(username.as_str()));
        (user_id, username)
    });

    let stream = UnixStream::connect(&socket)
        .await
        .with_context(|| format!("Failed to connect to {}", socket.display()))?;
    info!("Connected to {}", socket.display());

    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    relay(stream, identity, stdin, &mut stdout).await
}

fn socket_from_config(config_path: Option<&Path>) -> Result<PathBuf> {
    let config = ConfigLoader::load(config_path).context("Failed to load configuration")?;
    Ok(config.server.socket_path)
}

/// Numeric ids go on the wire as numbers, anything else as text.
fn parse_user_id(raw: &str) -> WireId {
    raw.parse::<i64>()
        .map(WireId::from)
        .unwrap_or_else(|_| WireId::from(raw))
}

/// Pump `input` lines to the broker and broker records to `output`.
pub async fn relay<I, O>(
    stream: UnixStream,
    identity: Option<(WireId, String)>,
    input: I,
    output: &mut O,
) -> Result<()>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = stream.into_split();
    let mut server = BufReader::new(read_half).lines();
    let mut input = input.lines();
    let mut input_open = true;
    let mut outstanding = 0usize;
    let mut next_id = 1;

    if let Some((user_id, username)) = identity {
        send(
            &mut write_half,
            &ClientMessage::Authenticate { user_id, username },
        )
        .await?;
        outstanding += 1;
    }

    while input_open || outstanding > 0 {
        tokio::select! {
            line = server.next_line() => {
                let Some(line) = line.context("Lost connection to broker")? else {
                    bail!("Broker closed the connection");
                };
                let text = match serde_json::from_str::<ServerMessage>(&line) {
                    Ok(message) => {
                        if !matches!(message, ServerMessage::Connected { .. }) {
                            outstanding = outstanding.saturating_sub(1);
                        }
                        render(&message)
                    }
                    Err(_) => line,
                };
                output.write_all(text.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await?;
            }
            line = input.next_line(), if input_open => match line? {
                Some(line) => {
                    if let Some(message) = client_message(&line, &mut next_id) {
                        send(&mut write_half, &message).await?;
                        outstanding += 1;
                    }
                }
                None => {
                    debug!("Input closed; {} reply(ies) outstanding", outstanding);
                    input_open = false;
                }
            },
        }
    }

    Ok(())
}

async fn send(writer: &mut OwnedWriteHalf, message: &ClientMessage) -> Result<()> {
    let line = protocol::encode(message)?;
    writer
        .write_all(line.as_bytes())
        .await
        .context("Failed to write to broker")?;
    Ok(())
}

/// Map one input line to a client record. Blank lines map to nothing.
fn client_message(line: &str, next_id: &mut i64) -> Option<ClientMessage> {
    let line = line.trim();
    match line {
        "" => None,
        "/clear" => Some(ClientMessage::ClearContext),
        "/status" => Some(ClientMessage::GetStatus),
        _ => {
            let message_id = WireId::from(*next_id);
            *next_id += 1;
            Some(ClientMessage::SendMessage {
                content: line.to_string(),
                message_id: Some(message_id),
            })
        }
    }
}

fn render(message: &ServerMessage) -> String {
    match message {
        ServerMessage::Connected {
            message,
            server_info,
        } => format!(
            "{} ({} {}, {} backend, {} token context)",
            message,
            server_info.name,
            server_info.version,
            server_info.backend,
            server_info.context_size
        ),
        ServerMessage::Authenticated { username, .. } => {
            format!("Authenticated as {}", username)
        }
        ServerMessage::Response { content, .. } => content.clone(),
        ServerMessage::Error { message, .. } => format!("error: {}", message),
        ServerMessage::ContextCleared => "Context cleared".to_string(),
        ServerMessage::Status(report) => render_status(report),
    }
}

fn render_status(report: &StatusReport) -> String {
    let in_flight = report.in_flight_owner.as_deref().unwrap_or("idle");
    format!(
        "sessions: {}, queued: {}, in flight: {}, backend: {}\n\
         context: {}/{} tokens over {} turn(s)",
        report.active_sessions,
        report.queue_length,
        in_flight,
        report.backend_state,
        report.context_tokens,
        report.context_budget,
        report.turn_count
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_application::BackendState;
    use broker_infrastructure::server::ServerInfo;
    use tokio::net::UnixListener;

    #[test]
    fn test_client_message_mapping() {
        let mut next_id = 1;
        assert_eq!(client_message("   ", &mut next_id), None);
        assert_eq!(
            client_message("/clear", &mut next_id),
            Some(ClientMessage::ClearContext)
        );
        assert_eq!(
            client_message(" /status ", &mut next_id),
            Some(ClientMessage::GetStatus)
        );
        assert_eq!(
            client_message("hello there\n", &mut next_id),
            Some(ClientMessage::SendMessage {
                content: "hello there".to_string(),
                message_id: Some(WireId::from(1)),
            })
        );
        assert_eq!(
            client_message("again", &mut next_id),
            Some(ClientMessage::SendMessage {
                content: "again".to_string(),
                message_id: Some(WireId::from(2)),
            })
        );
    }

    #[test]
    fn test_parse_user_id() {
        assert_eq!(parse_user_id("42"), WireId::from(42));
        assert_eq!(parse_user_id("u-42"), WireId::from("u-42"));
    }

    #[test]
    fn test_render_status() {
        let text = render(&ServerMessage::Status(StatusReport {
            connected: true,
            active_sessions: 3,
            queue_length: 1,
            in_flight_owner: Some("alice".to_string()),
            turn_count: 2,
            context_tokens: 40,
            context_budget: 3584,
            backend_state: BackendState::Ready,
        }));
        assert_eq!(
            text,
            "sessions: 3, queued: 1, in flight: alice, backend: ready\n\
             context: 40/3584 tokens over 2 turn(s)"
        );
    }

    #[test]
    fn test_render_error() {
        let text = render(&ServerMessage::error("Unknown message type", None));
        assert_eq!(text, "error: Unknown message type");
    }

    /// Answers each record in order, the way the broker would.
    async fn fake_broker(listener: UnixListener) -> Vec<ClientMessage> {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();
        let mut received = Vec::new();

        let greeting = ServerMessage::Connected {
            message: "Connected to llm-broker".to_string(),
            server_info: ServerInfo {
                name: "llm-broker".to_string(),
                version: "0.1.0".to_string(),
                backend: "process".to_string(),
                context_size: 4096,
                max_tokens: 512,
            },
        };
        write_half
            .write_all(protocol::encode(&greeting).unwrap().as_bytes())
            .await
            .unwrap();

        while let Some(line) = lines.next_line().await.unwrap() {
            let message = protocol::decode(&line).unwrap();
            let reply = match &message {
                ClientMessage::Authenticate { user_id, username } => {
                    ServerMessage::Authenticated {
                        user_id: user_id.clone(),
                        username: username.clone(),
                    }
                }
                ClientMessage::SendMessage {
                    content,
                    message_id,
                } => ServerMessage::Response {
                    content: content.to_uppercase(),
                    message_id: message_id.clone(),
                },
                ClientMessage::ClearContext => ServerMessage::ContextCleared,
                ClientMessage::GetStatus => ServerMessage::error("status unavailable", None),
            };
            received.push(message);
            write_half
                .write_all(protocol::encode(&reply).unwrap().as_bytes())
                .await
                .unwrap();
        }
        received
    }

    #[tokio::test]
    async fn test_relay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let broker = tokio::spawn(fake_broker(UnixListener::bind(&path).unwrap()));

        let stream = UnixStream::connect(&path).await.unwrap();
        let input: &[u8] = b"hello\n\n/clear\n/status\n";
        let mut output = Vec::new();
        relay(
            stream,
            Some((WireId::from(7), "alice".to_string())),
            input,
            &mut output,
        )
        .await
        .unwrap();

        let output = String::from_utf8(output).unwrap();
        assert_eq!(
            output,
            "Connected to llm-broker (llm-broker 0.1.0, process backend, 4096 token context)\n\
             Authenticated as alice\n\
             HELLO\n\
             Context cleared\n\
             error: status unavailable\n"
        );

        let received = broker.await.unwrap();
        assert_eq!(received.len(), 4);
        assert_eq!(
            received[1],
            ClientMessage::SendMessage {
                content: "hello".to_string(),
                message_id: Some(WireId::from(1)),
            }
        );
    }

    #[tokio::test]
    async fn test_relay_reports_closed_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let broker = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let stream = UnixStream::connect(&path).await.unwrap();
        // input that stays open without producing a line
        let (_keep_open, input) = tokio::io::duplex(64);
        let mut output = Vec::new();
        let err = relay(stream, None, BufReader::new(input), &mut output)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed"));
        broker.await.unwrap();
    }
}
