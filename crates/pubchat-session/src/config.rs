//! Session configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! topic = "chat"
//! history_limit = 1000
//! default_name = "anonymous coward"
//! name_key = "name"
//! ```

use pubchat_core::{DEFAULT_HISTORY_LIMIT, DEFAULT_TOPIC};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Display name used until the user picks one.
pub const DEFAULT_NAME: &str = "anonymous coward";

/// Storage key the display name is persisted under.
pub const NAME_KEY: &str = "name";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pubsub topic all chat traffic uses.
    pub topic: String,
    /// Maximum number of messages kept in history.
    pub history_limit: usize,
    /// Fallback display name when storage has none.
    pub default_name: String,
    pub name_key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            default_name: DEFAULT_NAME.to_string(),
            name_key: NAME_KEY.to_string(),
        }
    }
}

/// Error loading a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

impl SessionConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
