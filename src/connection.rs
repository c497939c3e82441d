use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::client::{ConnectionCommand, MessageCallback, normalize_channel};
use crate::config::ChatConfig;
use crate::error::ChatError;
use crate::parser;
use crate::types::{Capability, ConnectionStatus};

/// Bound on every socket operation. Twitch's keepalive PING arrives
/// roughly every five minutes; the extra 30 seconds keep an idle but
/// healthy connection from being treated as dead, so a timeout reliably
/// means the connection is gone.
pub(crate) const IO_TIMEOUT: Duration = Duration::from_secs(330);

const MAX_BACKOFF: Duration = Duration::from_secs(512);

/// Session state owned exclusively by the worker. Commands mutate it so a
/// reconnect replays the most recent login/join/capability handshake.
struct Session {
    host: String,
    port: u16,
    nickname: String,
    token: String,
    /// Normalized: lower-case, `#`-prefixed.
    channel: String,
    capabilities: Vec<Capability>,
    live: bool,
}

impl Session {
    fn from_config(config: ChatConfig) -> Self {
        // The channel was validated non-empty before the worker spawned.
        let channel = normalize_channel(&config.channel).unwrap_or_default();
        Self {
            host: config.host,
            port: config.port,
            nickname: config.nickname,
            token: config.token,
            channel,
            capabilities: config.capabilities,
            live: config.live,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

enum SessionEnd {
    Stopped,
    Transport(io::Error),
}

pub(crate) async fn run_connection_loop(
    config: ChatConfig,
    mut commands: mpsc::Receiver<ConnectionCommand>,
    status_tx: watch::Sender<ConnectionStatus>,
    mut callback: MessageCallback,
) {
    let session_id = Uuid::new_v4();
    let mut session = Session::from_config(config);
    let mut failures: u32 = 0;
    let mut attempt: u32 = 0;

    tracing::info!(
        session.id = %session_id,
        host = %session.host,
        channel.name = %session.channel,
        live = session.live,
        "chat connection worker started"
    );

    loop {
        let delay = backoff_delay(failures);
        if !delay.is_zero() {
            update_status(
                &status_tx,
                session_id,
                ConnectionStatus::Reconnecting {
                    reason: format!("{failures} consecutive connection failures"),
                    retry_in: delay,
                },
            );
            if wait_out_backoff(delay, &mut commands, &mut session).await {
                break;
            }
        }

        attempt += 1;
        update_status(&status_tx, session_id, ConnectionStatus::Connecting { attempt });

        let stream = match dial(session.addr(), &mut commands, &mut session).await {
            Ok(Some(stream)) => stream,
            Ok(None) => break,
            Err(error) => {
                failures += 1;
                tracing::warn!(
                    session.id = %session_id,
                    error = %error,
                    failures,
                    "connection attempt failed"
                );
                continue;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;

        update_status(&status_tx, session_id, ConnectionStatus::Authenticating);
        if let Err(error) = handshake(&mut writer, &session).await {
            failures += 1;
            tracing::warn!(
                session.id = %session_id,
                error = %error,
                failures,
                "handshake failed"
            );
            continue;
        }
        failures = 0;
        update_status(&status_tx, session_id, ConnectionStatus::Joined);
        tracing::info!(
            session.id = %session_id,
            channel.name = %session.channel,
            "connected and joined"
        );

        update_status(&status_tx, session_id, ConnectionStatus::Running);
        match run_session(
            &mut reader,
            &mut writer,
            &mut session,
            &mut commands,
            &mut callback,
            session_id,
        )
        .await
        {
            SessionEnd::Stopped => {
                update_status(&status_tx, session_id, ConnectionStatus::Stopping);
                // Half-close the write side so the peer sees a clean FIN
                // and any in-flight receive fails fast instead of waiting
                // out the full timeout.
                if let Err(error) = writer.shutdown().await {
                    tracing::debug!(session.id = %session_id, error = %error, "socket shutdown failed");
                }
                break;
            }
            SessionEnd::Transport(error) => {
                update_status(&status_tx, session_id, ConnectionStatus::Disconnected);
                tracing::warn!(
                    session.id = %session_id,
                    error = %error,
                    "transport failure, reconnecting"
                );
            }
        }
    }

    update_status(&status_tx, session_id, ConnectionStatus::Stopped);
    tracing::info!(session.id = %session_id, "chat connection worker stopped");
}

/// Delay before the next dial after `failures` consecutive failures:
/// `0, 1, 2, 4, ..., 512`, holding at 512 until a connection succeeds.
pub(crate) fn backoff_delay(failures: u32) -> Duration {
    if failures <= 1 {
        return Duration::ZERO;
    }
    let exponent = (failures - 2).min(9);
    Duration::from_secs(1u64 << exponent).min(MAX_BACKOFF)
}

/// Sleeps for `delay`, still answering commands. Returns true on stop.
async fn wait_out_backoff(
    delay: Duration,
    commands: &mut mpsc::Receiver<ConnectionCommand>,
    session: &mut Session,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            command = commands.recv() => match command {
                None | Some(ConnectionCommand::Stop) => return true,
                Some(command) => handle_offline_command(session, command),
            },
        }
    }
}

/// Dials with the I/O timeout, still answering commands. `Ok(None)` means
/// a stop arrived mid-dial.
async fn dial(
    addr: String,
    commands: &mut mpsc::Receiver<ConnectionCommand>,
    session: &mut Session,
) -> Result<Option<TcpStream>, io::Error> {
    let connect = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(&addr));
    tokio::pin!(connect);
    loop {
        tokio::select! {
            result = &mut connect => {
                return match result {
                    Ok(Ok(stream)) => Ok(Some(stream)),
                    Ok(Err(error)) => Err(error),
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
                };
            }
            command = commands.recv() => match command {
                None | Some(ConnectionCommand::Stop) => return Ok(None),
                Some(command) => handle_offline_command(session, command),
            },
        }
    }
}

/// Commands that arrive while no socket exists update the session state
/// used by the next handshake; sends have nothing to write to and fail.
fn handle_offline_command(session: &mut Session, command: ConnectionCommand) {
    let not_connected =
        || ChatError::SendFailed(io::Error::new(io::ErrorKind::NotConnected, "not connected"));
    match command {
        ConnectionCommand::Login {
            nickname,
            token,
            respond_to,
        } => {
            session.nickname = nickname;
            session.token = token;
            let _ = respond_to.send(Ok(()));
        }
        ConnectionCommand::Join {
            channel,
            respond_to,
        } => {
            session.channel = channel;
            let _ = respond_to.send(Ok(()));
        }
        ConnectionCommand::Part { respond_to, .. } => {
            let _ = respond_to.send(Err(not_connected()));
        }
        ConnectionCommand::RequestCapabilities {
            capabilities,
            respond_to,
        } => {
            remember_capabilities(session, &capabilities);
            let _ = respond_to.send(Ok(()));
        }
        ConnectionCommand::Privmsg { respond_to, .. }
        | ConnectionCommand::Ping { respond_to, .. }
        | ConnectionCommand::Pong { respond_to, .. } => {
            let _ = respond_to.send(Err(not_connected()));
        }
        ConnectionCommand::Stop => {}
    }
}

async fn handshake(writer: &mut OwnedWriteHalf, session: &Session) -> Result<(), io::Error> {
    send_line(writer, &format!("PASS {}", session.token)).await?;
    send_line(writer, &format!("NICK {}", session.nickname.to_lowercase())).await?;
    send_line(writer, &format!("JOIN {}", session.channel)).await?;
    for capability in &session.capabilities {
        send_line(writer, &format!("CAP REQ :twitch.tv/{capability}")).await?;
    }
    Ok(())
}

async fn run_session(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    session: &mut Session,
    commands: &mut mpsc::Receiver<ConnectionCommand>,
    callback: &mut MessageCallback,
    session_id: Uuid,
) -> SessionEnd {
    // Kept across iterations: read_until is cancel-safe and resumes a
    // partially buffered line after a command wins the race.
    let mut line: Vec<u8> = Vec::new();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(ConnectionCommand::Stop) => return SessionEnd::Stopped,
                Some(command) => handle_command(writer, session, command, session_id).await,
            },
            read = tokio::time::timeout(IO_TIMEOUT, reader.read_until(b'\n', &mut line)) => {
                match read {
                    Ok(Ok(0)) => {
                        return SessionEnd::Transport(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed by server",
                        ));
                    }
                    Ok(Ok(_)) if line.ends_with(b"\n") => {
                        if let Err(error) = handle_line(writer, &line, callback, session_id).await {
                            return SessionEnd::Transport(error);
                        }
                        line.clear();
                    }
                    // Partial line at an EOF boundary; the next read
                    // reports the close.
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => return SessionEnd::Transport(error),
                    Err(_) => {
                        return SessionEnd::Transport(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "no server activity within the read timeout",
                        ));
                    }
                }
            }
        }
    }
}

/// Decodes, parses, and delivers one complete line. A malformed or
/// undecodable line is logged and skipped so one bad line never kills the
/// session; only the automatic PONG write can fail the session here.
async fn handle_line(
    writer: &mut OwnedWriteHalf,
    raw: &[u8],
    callback: &mut MessageCallback,
    session_id: Uuid,
) -> Result<(), io::Error> {
    let Ok(text) = std::str::from_utf8(raw) else {
        tracing::warn!(session.id = %session_id, "discarding line with invalid UTF-8");
        return Ok(());
    };
    let text = text.trim_end_matches(['\r', '\n']);
    if text.is_empty() {
        return Ok(());
    }

    let message = match parser::parse(text) {
        Ok(message) => message,
        Err(error) => {
            tracing::warn!(
                session.id = %session_id,
                line = %text,
                error = %error,
                "failed to parse chat line, skipping"
            );
            return Ok(());
        }
    };

    if message.command_type == "PING" {
        send_line(writer, "PONG").await?;
    }

    callback(message);
    Ok(())
}

async fn handle_command(
    writer: &mut OwnedWriteHalf,
    session: &mut Session,
    command: ConnectionCommand,
    session_id: Uuid,
) {
    match command {
        ConnectionCommand::Login {
            nickname,
            token,
            respond_to,
        } => {
            session.nickname = nickname;
            session.token = token;
            let result = async {
                send_line(writer, &format!("PASS {}", session.token)).await?;
                send_line(writer, &format!("NICK {}", session.nickname.to_lowercase())).await
            }
            .await;
            let _ = respond_to.send(result.map_err(ChatError::SendFailed));
        }
        ConnectionCommand::Join {
            channel,
            respond_to,
        } => {
            session.channel = channel.clone();
            let result = send_line(writer, &format!("JOIN {channel}")).await;
            let _ = respond_to.send(result.map_err(ChatError::SendFailed));
        }
        ConnectionCommand::Part {
            channel,
            respond_to,
        } => {
            let result = send_line(writer, &format!("PART {channel}")).await;
            let _ = respond_to.send(result.map_err(ChatError::SendFailed));
        }
        ConnectionCommand::RequestCapabilities {
            capabilities,
            respond_to,
        } => {
            remember_capabilities(session, &capabilities);
            let result = async {
                for capability in &capabilities {
                    send_line(writer, &format!("CAP REQ :twitch.tv/{capability}")).await?;
                }
                Ok(())
            }
            .await;
            let _ = respond_to.send(result.map_err(ChatError::SendFailed));
        }
        ConnectionCommand::Privmsg { text, respond_to } => {
            if session.live {
                let result = send_line(writer, &format!("PRIVMSG {} :{}", session.channel, text)).await;
                let _ = respond_to.send(result.map_err(ChatError::SendFailed));
            } else {
                tracing::info!(
                    session.id = %session_id,
                    channel.name = %session.channel,
                    message = %text,
                    "live mode off, echoing locally"
                );
                let _ = respond_to.send(Ok(()));
            }
        }
        ConnectionCommand::Ping { text, respond_to } => {
            let result = send_line(writer, &keepalive("PING", &text)).await;
            let _ = respond_to.send(result.map_err(ChatError::SendFailed));
        }
        ConnectionCommand::Pong { text, respond_to } => {
            let result = send_line(writer, &keepalive("PONG", &text)).await;
            let _ = respond_to.send(result.map_err(ChatError::SendFailed));
        }
        // Handled by the select loops before reaching here.
        ConnectionCommand::Stop => {}
    }
}

fn keepalive(command: &str, text: &str) -> String {
    if text.is_empty() {
        command.to_string()
    } else {
        format!("{command} {text}")
    }
}

fn remember_capabilities(session: &mut Session, capabilities: &[Capability]) {
    for capability in capabilities {
        if !session.capabilities.contains(capability) {
            session.capabilities.push(*capability);
        }
    }
}

async fn send_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<(), io::Error> {
    writer.write_all(format!("{line}\r\n").as_bytes()).await?;
    writer.flush().await
}

fn update_status(
    status_tx: &watch::Sender<ConnectionStatus>,
    session_id: Uuid,
    new_status: ConnectionStatus,
) {
    if *status_tx.borrow() == new_status {
        return;
    }
    tracing::debug!(session.id = %session_id, status = ?new_status, "connection status changed");
    // The handle may already be gone; the command channel closing is what
    // stops the worker, not this.
    let _ = status_tx.send(new_status);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delays_follow_the_doubling_sequence_and_hold_at_max() {
        let delays: Vec<u64> = (1..=14).map(|n| backoff_delay(n).as_secs()).collect();
        assert_eq!(
            delays,
            vec![0, 1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 512, 512, 512]
        );
    }

    #[test]
    fn backoff_restarts_at_zero_after_a_success() {
        // A success resets the failure counter; the next failure dials
        // again without delay.
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::ZERO);
    }

    #[test]
    fn keepalive_omits_the_trailing_space_for_empty_payloads() {
        assert_eq!(keepalive("PING", ""), "PING");
        assert_eq!(keepalive("PONG", "tmi.twitch.tv"), "PONG tmi.twitch.tv");
    }

    #[test]
    fn capabilities_are_remembered_without_duplicates() {
        let mut session = Session {
            host: "127.0.0.1".to_string(),
            port: 6667,
            nickname: "cubiedev".to_string(),
            token: "oauth:secret".to_string(),
            channel: "#flackblag".to_string(),
            capabilities: vec![Capability::Tags],
            live: false,
        };
        remember_capabilities(&mut session, &[Capability::Tags, Capability::Commands]);
        assert_eq!(
            session.capabilities,
            vec![Capability::Tags, Capability::Commands]
        );
    }
}
