//! Client for Twitch's chat-over-IRC dialect, spoken over a raw TCP
//! stream.
//!
//! Two pieces: [`parser::parse`] turns one wire line into a typed
//! [`Message`], and [`ChatConnection`] owns the socket (handshake,
//! background receive loop, reconnection with backoff, cooperative
//! shutdown) and delivers parsed messages to a callback.
//!
//! ```no_run
//! use tmi_client::{ChatConfig, ChatConnection};
//!
//! # async fn run() -> tmi_client::Result<()> {
//! let config = ChatConfig::anonymous("irc.chat.twitch.tv", 6667, "flackblag");
//! let mut connection = ChatConnection::spawn(config, |message| {
//!     println!("{}: {}", message.user.as_deref().unwrap_or("server"), message.body);
//! })?;
//! connection.join().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
mod connection;
pub mod error;
pub mod parser;
pub mod types;

pub use client::{ChatConnection, MessageCallback};
pub use config::ChatConfig;
pub use error::{ChatError, Result};
pub use types::{Capability, ConnectionStatus, Message};
