use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("malformed chat line: {line:?}")]
    MalformedMessage { line: String },
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("nickname and auth token must both be non-empty")]
    InvalidCredentials,
    #[error("channel name must be non-empty")]
    InvalidChannel,
    #[error("unknown capability: {0:?}")]
    InvalidCapability(String),
    #[error("send failed, connection broken: {0}")]
    SendFailed(#[source] std::io::Error),
    #[error("connection worker is no longer running")]
    ConnectionClosed,
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;
