use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::ChatConfig;
use crate::connection::run_connection_loop;
use crate::error::{ChatError, Result};
use crate::types::{Capability, ConnectionStatus, Message};

const COMMAND_BUFFER: usize = 32;

/// Invoked on the worker task once per parsed message, in wire order. It
/// must not block indefinitely: the worker cannot read further lines or
/// answer keepalive PINGs while the callback runs.
pub type MessageCallback = Box<dyn FnMut(Message) + Send + 'static>;

#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    Login {
        nickname: String,
        token: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Join {
        channel: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Part {
        channel: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    RequestCapabilities {
        capabilities: Vec<Capability>,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Privmsg {
        text: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Ping {
        text: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Pong {
        text: String,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Stop,
}

/// Handle to one chat session.
///
/// [`ChatConnection::spawn`] starts a worker task that owns the socket:
/// it dials, runs the login/join/capability handshake, delivers parsed
/// messages to the callback, and reconnects with backoff on transport
/// failure. Handle methods enqueue commands for the worker and are safe
/// to call concurrently with message delivery. Dropping the handle
/// without calling [`stop`](Self::stop) also shuts the worker down, since
/// the command channel closes.
pub struct ChatConnection {
    sender: mpsc::Sender<ConnectionCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
    worker: Option<JoinHandle<()>>,
}

impl ChatConnection {
    /// Validates the config and starts the worker, which connects in the
    /// background. Returns immediately; use [`join`](Self::join) to block
    /// until the session ends.
    pub fn spawn(
        config: ChatConfig,
        callback: impl FnMut(Message) + Send + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let worker = tokio::spawn(run_connection_loop(
            config,
            receiver,
            status_tx,
            Box::new(callback),
        ));
        Ok(Self {
            sender,
            status_rx,
            worker: Some(worker),
        })
    }

    /// Suspends the caller until the worker has stopped.
    pub async fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(error) = worker.await {
                tracing::warn!(error = %error, "connection worker panicked or was cancelled");
            }
        }
    }

    /// Sends a `PASS`/`NICK` pair and updates the identity replayed by
    /// reconnect handshakes.
    pub async fn login(&self, nickname: &str, token: &str) -> Result<()> {
        if nickname.trim().is_empty() || token.trim().is_empty() {
            return Err(ChatError::InvalidCredentials);
        }
        self.ask(|respond_to| ConnectionCommand::Login {
            nickname: nickname.to_string(),
            token: token.to_string(),
            respond_to,
        })
        .await
    }

    /// Joins `name` (case-normalized, `#`-prefixed if missing) and makes
    /// it the channel replayed by reconnect handshakes.
    pub async fn join_channel(&self, name: &str) -> Result<()> {
        let channel = normalize_channel(name)?;
        self.ask(|respond_to| ConnectionCommand::Join {
            channel,
            respond_to,
        })
        .await
    }

    pub async fn leave_channel(&self, name: &str) -> Result<()> {
        let channel = normalize_channel(name)?;
        self.ask(|respond_to| ConnectionCommand::Part {
            channel,
            respond_to,
        })
        .await
    }

    /// Sends one `CAP REQ` per capability.
    pub async fn add_capability(&self, capabilities: &[Capability]) -> Result<()> {
        self.ask(|respond_to| ConnectionCommand::RequestCapabilities {
            capabilities: capabilities.to_vec(),
            respond_to,
        })
        .await
    }

    /// Sends `text` to the joined channel. In live mode this writes a
    /// `PRIVMSG`; otherwise the send is diverted to a local echo with no
    /// network effect.
    pub async fn send_message(&self, text: &str) -> Result<()> {
        self.ask(|respond_to| ConnectionCommand::Privmsg {
            text: text.to_string(),
            respond_to,
        })
        .await
    }

    /// Formats `text` as a whisper directed at `user` and routes it
    /// through [`send_message`](Self::send_message).
    pub async fn send_whisper(&self, user: &str, text: &str) -> Result<()> {
        self.send_message(&format!("/w {user} {text}")).await
    }

    pub async fn send_ping(&self, text: &str) -> Result<()> {
        self.ask(|respond_to| ConnectionCommand::Ping {
            text: text.to_string(),
            respond_to,
        })
        .await
    }

    pub async fn send_pong(&self, text: &str) -> Result<()> {
        self.ask(|respond_to| ConnectionCommand::Pong {
            text: text.to_string(),
            respond_to,
        })
        .await
    }

    /// Signals the worker to exit after its current line. Idempotent; a
    /// stop racing an already-stopped worker is a no-op.
    pub async fn stop(&self) {
        let _ = self.sender.send(ConnectionCommand::Stop).await;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    async fn ask(
        &self,
        make_command: impl FnOnce(oneshot::Sender<Result<()>>) -> ConnectionCommand,
    ) -> Result<()> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(make_command(respond_to))
            .await
            .map_err(|_| ChatError::ConnectionClosed)?;
        response.await.map_err(|_| ChatError::ConnectionClosed)?
    }
}

pub(crate) fn normalize_channel(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name == "#" {
        return Err(ChatError::InvalidChannel);
    }
    let name = name.to_lowercase();
    if name.starts_with('#') {
        Ok(name)
    } else {
        Ok(format!("#{name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_lowercased_and_hash_prefixed() {
        assert_eq!(normalize_channel("FlackBlag").unwrap(), "#flackblag");
        assert_eq!(normalize_channel("#flackblag").unwrap(), "#flackblag");
        assert_eq!(normalize_channel(" #FlackBlag ").unwrap(), "#flackblag");
    }

    #[test]
    fn empty_channel_names_are_rejected() {
        assert!(matches!(
            normalize_channel(""),
            Err(ChatError::InvalidChannel)
        ));
        assert!(matches!(
            normalize_channel("  "),
            Err(ChatError::InvalidChannel)
        ));
        assert!(matches!(
            normalize_channel("#"),
            Err(ChatError::InvalidChannel)
        ));
    }
}
