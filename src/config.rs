use config::{Config, Environment, File};
use serde::{Deserialize, Deserializer};

use crate::error::{ChatError, Result};
use crate::types::Capability;

/// Static session parameters for one [`crate::ChatConnection`].
///
/// Loadable from the environment and an optional `config` file via
/// [`ChatConfig::load`], or constructed directly.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    pub host: String,
    pub port: u16,
    /// Channel to join; the leading `#` is optional.
    pub channel: String,
    pub nickname: String,
    pub token: String,
    #[serde(default, deserialize_with = "deserialize_string_or_list_of_caps")]
    pub capabilities: Vec<Capability>,
    /// True sends real PRIVMSGs; false diverts sends to a local echo so
    /// the surrounding application can dry-run without code changes.
    #[serde(default)]
    pub live: bool,
}

impl ChatConfig {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        channel: impl Into<String>,
        nickname: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            channel: channel.into(),
            nickname: nickname.into(),
            token: token.into(),
            capabilities: Vec::new(),
            live: false,
        }
    }

    /// Read-only session under a throwaway `justinfan` identity, which
    /// Twitch accepts without a real token.
    pub fn anonymous(host: impl Into<String>, port: u16, channel: impl Into<String>) -> Self {
        let nickname = format!("justinfan{}", rand::random::<u32>() % 80000 + 1000);
        Self::new(host, port, channel, nickname, "SCHMOOPIIE")
    }

    /// Layers `TMI`-prefixed environment variables (`TMI__CHANNEL`, ...)
    /// with an optional `config` file next to the working directory.
    pub fn load() -> Result<Self> {
        let settings = Config::builder()
            .add_source(
                Environment::with_prefix("TMI")
                    .separator("__")
                    .try_parsing(true),
            )
            .add_source(File::with_name("config").required(false))
            .set_default("host", "irc.chat.twitch.tv")?
            .set_default("port", 6667)?
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.nickname.trim().is_empty() || self.token.trim().is_empty() {
            return Err(ChatError::InvalidCredentials);
        }
        if self.channel.trim().is_empty() {
            return Err(ChatError::InvalidChannel);
        }
        Ok(())
    }
}

fn deserialize_string_or_list_of_caps<'de, D>(deserializer: D) -> Result<Vec<Capability>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    use serde_json::Value;

    let value = Value::deserialize(deserializer)?;
    let mut capabilities = Vec::new();

    match value {
        Value::String(s) => {
            for item in s.split(',').map(str::trim).filter(|item| !item.is_empty()) {
                capabilities.push(item.parse().map_err(D::Error::custom)?);
            }
        }
        Value::Array(items) => {
            for item in items {
                if let Value::String(s) = item {
                    capabilities.push(s.parse().map_err(D::Error::custom)?);
                } else {
                    return Err(D::Error::custom(
                        "capability list must contain only strings",
                    ));
                }
            }
        }
        _ => return Err(D::Error::custom("expected string or array of strings")),
    }

    Ok(capabilities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capabilities_accept_a_list() {
        let config: ChatConfig = serde_json::from_value(json!({
            "host": "irc.chat.twitch.tv",
            "port": 6667,
            "channel": "flackblag",
            "nickname": "cubiedev",
            "token": "oauth:secret",
            "capabilities": ["tags", "Commands"],
        }))
        .unwrap();
        assert_eq!(
            config.capabilities,
            vec![Capability::Tags, Capability::Commands]
        );
    }

    #[test]
    fn capabilities_accept_a_single_comma_separated_string() {
        let config: ChatConfig = serde_json::from_value(json!({
            "host": "irc.chat.twitch.tv",
            "port": 6667,
            "channel": "flackblag",
            "nickname": "cubiedev",
            "token": "oauth:secret",
            "capabilities": "membership, tags",
        }))
        .unwrap();
        assert_eq!(
            config.capabilities,
            vec![Capability::Membership, Capability::Tags]
        );
    }

    #[test]
    fn unknown_capability_is_rejected() {
        let result: Result<ChatConfig, _> = serde_json::from_value(json!({
            "host": "irc.chat.twitch.tv",
            "port": 6667,
            "channel": "flackblag",
            "nickname": "cubiedev",
            "token": "oauth:secret",
            "capabilities": ["emotes"],
        }));
        assert!(result.is_err());
    }

    #[test]
    fn validation_rejects_empty_credentials_and_channel() {
        let mut config = ChatConfig::new("irc.chat.twitch.tv", 6667, "flackblag", "", "token");
        assert!(matches!(
            config.validate(),
            Err(ChatError::InvalidCredentials)
        ));

        config.nickname = "cubiedev".to_string();
        config.token = String::new();
        assert!(matches!(
            config.validate(),
            Err(ChatError::InvalidCredentials)
        ));

        config.token = "oauth:secret".to_string();
        config.channel = "  ".to_string();
        assert!(matches!(config.validate(), Err(ChatError::InvalidChannel)));

        config.channel = "#flackblag".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn anonymous_identity_is_a_justinfan_nick() {
        let config = ChatConfig::anonymous("irc.chat.twitch.tv", 6667, "flackblag");
        assert!(config.nickname.starts_with("justinfan"));
        assert!(config.validate().is_ok());
        assert!(!config.live);
    }
}
