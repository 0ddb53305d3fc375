//! Loading the relay configuration from disk and the environment
//!
//! Resolution order, later sources winning:
//! 1. Built-in defaults (accessor methods on each section)
//! 2. `config.toml` (explicit path, or `$XDG_CONFIG_HOME/llmbot/config.toml`)
//! 3. Environment variables (`BING_COOKIE`, `POE_COOKIE`, `SLACK_*`, ...)

use crate::components::{
    BingConfig, DispatcherConfig, GradioConfig, Gpt4Config, MidjourneyConfig, PoeConfig,
    SlackConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors from configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading the config file
    #[error("config IO error at {path}: {source}")]
    Io {
        /// File that failed to read
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// TOML parse error
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    /// Dispatcher and shared networking settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Bing chat
    #[serde(default)]
    pub bing: BingConfig,
    /// Poe
    #[serde(default)]
    pub poe: PoeConfig,
    /// Slack relay
    #[serde(default)]
    pub slack: SlackConfig,
    /// Gradio spaces
    #[serde(default)]
    pub gradio: GradioConfig,
    /// `gpt4` backend
    #[serde(default)]
    pub gpt4: Gpt4Config,
    /// Midjourney image bridge
    #[serde(default)]
    pub midjourney: MidjourneyConfig,
}

impl RelayConfig {
    /// Default config file path: `$XDG_CONFIG_HOME/llmbot/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".config")
            })
            .join("llmbot")
            .join("config.toml")
    }

    /// Load from `path` (or the default path) and apply environment overrides
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load only the file, without environment overrides
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse a TOML document
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(content)?)
    }

    /// Overlay values from an environment lookup
    ///
    /// Empty values are ignored so an exported-but-blank variable does not
    /// wipe a configured credential.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(value) = get("LLMBOT_MODEL") {
            self.dispatcher.default_model = Some(value);
        }
        if let Some(value) = get("HTTP_PROXY") {
            self.dispatcher.proxy = Some(value);
        }
        if let Some(value) = get("BING_COOKIE") {
            self.bing.cookie = Some(value);
        }
        if let Some(value) = get("POE_COOKIE") {
            self.poe.cookie = Some(value);
        }
        if let Some(value) = get("SLACK_LISTEN_BOT_TOKEN") {
            self.slack.bot_token = Some(value);
        }
        if let Some(value) = get("SLACK_CHANNEL") {
            self.slack.channel = Some(value);
        }
        if let Some(value) = get("SLACK_CHATBOT_NAME") {
            self.slack.chatbot_name = Some(value);
        }
        if let Some(value) = get("GPT4_AUTH_CODE") {
            self.gpt4.auth_code = Some(value);
        }
        if let Some(value) = get("MJ_UUID") {
            self.midjourney.uuid = Some(value);
        }
    }
}
