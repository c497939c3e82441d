use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ChatError;

/// One parsed chat line.
///
/// Built once per received line by [`crate::parser::parse`], immutable
/// afterwards, and handed to the message callback in wire order. For
/// `PING`/`PONG` lines only `full_text` and `command_type` are populated;
/// their wire format differs from every other command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// The original raw line, preserved for diagnostics.
    pub full_text: String,
    /// Tag key to tag value. Empty when the line carried no `@...` prefix.
    /// A value may be the empty string (absent data), which is distinct
    /// from the key being absent entirely.
    pub tags: HashMap<String, String>,
    /// Message kind: `PRIVMSG`, `JOIN`, `PING`, `CAP * ACK`, a numeric
    /// reply code, etc. Never empty.
    pub command_type: String,
    /// Sender identity. `None` for server-origin lines such as those
    /// prefixed by `jtv` or the bare server hostname.
    pub user: Option<String>,
    /// Raw remainder of the command line after the type token.
    pub params: String,
    /// Channel name, when `params` contains a `#`-prefixed token.
    pub channel: Option<String>,
    /// Trailing free-text payload, empty when none was sent. An
    /// action-encoded payload is rewritten to the `/me <text>` form.
    pub body: String,
}

impl Message {
    pub(crate) fn empty(full_text: &str) -> Self {
        Self {
            full_text: full_text.to_string(),
            tags: HashMap::new(),
            command_type: String::new(),
            user: None,
            params: String::new(),
            channel: None,
            body: String::new(),
        }
    }
}

/// Opt-in protocol extensions negotiated via `CAP REQ`, unlocking richer
/// tag metadata on inbound lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Membership,
    Tags,
    Commands,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Membership => "membership",
            Capability::Tags => "tags",
            Capability::Commands => "commands",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "membership" => Ok(Capability::Membership),
            "tags" => Ok(Capability::Tags),
            "commands" => Ok(Capability::Commands),
            other => Err(ChatError::InvalidCapability(other.to_string())),
        }
    }
}

/// Connection state machine, published on a watch channel by the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting { attempt: u32 },
    Authenticating,
    Joined,
    Running,
    Reconnecting { reason: String, retry_in: Duration },
    Stopping,
    Stopped,
}
