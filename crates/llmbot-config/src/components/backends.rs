//! Per-backend configuration
//!
//! Every field is optional in the file; accessors resolve defaults so the
//! relay never has to know which values were written by the user.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Bing conversation style
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum BingVariant {
    /// More imaginative answers
    #[default]
    Creative,
    /// Middle ground
    Balanced,
    /// Shorter, factual answers
    Precise,
}

impl fmt::Display for BingVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BingVariant::Creative => write!(f, "Creative"),
            BingVariant::Balanced => write!(f, "Balanced"),
            BingVariant::Precise => write!(f, "Precise"),
        }
    }
}

/// Which service resolves image-generation directives
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageCreatorKind {
    /// Bing Image Creator, authenticated with the Bing cookie
    #[default]
    Bing,
    /// Midjourney func2api bridge, authenticated with `MJ_UUID`
    Midjourney,
}

/// Bing chat configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BingConfig {
    /// `_U` cookie value, or a full cookie header
    pub cookie: Option<String>,
    /// Conversation style
    #[serde(default)]
    pub variant: BingVariant,
    /// Conversation creation endpoint
    pub conversation_url: Option<String>,
    /// ChatHub WebSocket endpoint
    pub chathub_url: Option<String>,
    /// Base URL for the image creator
    pub images_url: Option<String>,
    /// Image service used for `GenerateContentQuery` directives
    #[serde(default)]
    pub image_creator: ImageCreatorKind,
    /// Seconds between image result polls
    pub image_poll_secs: Option<u64>,
    /// Maximum image result polls
    pub image_poll_attempts: Option<u32>,
    /// Lifetime granted to a conversation after each completed exchange
    pub session_ttl_secs: Option<u64>,
    /// Portion of the lifetime that must remain for a conversation to be reused
    pub session_margin_secs: Option<u64>,
}

impl BingConfig {
    /// Get the conversation creation endpoint
    pub fn conversation_url(&self) -> String {
        self.conversation_url
            .clone()
            .unwrap_or_else(|| "https://www.bing.com/turing/conversation/create".to_string())
    }

    /// Get the ChatHub endpoint
    pub fn chathub_url(&self) -> String {
        self.chathub_url
            .clone()
            .unwrap_or_else(|| "wss://sydney.bing.com/sydney/ChatHub".to_string())
    }

    /// Get the image creator base URL
    pub fn images_url(&self) -> String {
        self.images_url
            .clone()
            .unwrap_or_else(|| "https://www.bing.com".to_string())
    }

    /// Get the delay between image polls
    pub fn image_poll_interval(&self) -> Duration {
        Duration::from_secs(self.image_poll_secs.unwrap_or(5))
    }

    /// Get the maximum image polls
    pub fn image_poll_attempts(&self) -> u32 {
        self.image_poll_attempts.unwrap_or(40)
    }

    /// Get the conversation lifetime
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs.unwrap_or(3900))
    }

    /// Get the reuse safety margin
    pub fn session_margin(&self) -> Duration {
        Duration::from_secs(self.session_margin_secs.unwrap_or(3600))
    }
}

/// Poe configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoeConfig {
    /// `p-b` cookie value
    pub cookie: Option<String>,
    /// Site base URL
    pub base_url: Option<String>,
    /// Update-channel socket base; a random `tchN` host is used when unset
    pub socket_url: Option<String>,
}

impl PoeConfig {
    /// Get the site base URL
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| "https://poe.com".to_string())
    }
}

/// Slack relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SlackConfig {
    /// User token (`xoxp-...`)
    pub bot_token: Option<String>,
    /// Channel id (`C0...`)
    pub channel: Option<String>,
    /// Real name of the bot to mention; the last bot in the workspace otherwise
    pub chatbot_name: Option<String>,
    /// Web API base URL
    pub api_url: Option<String>,
    /// Seconds between thread polls
    pub poll_interval_secs: Option<u64>,
    /// Overall wait budget for one reply
    pub timeout_secs: Option<u64>,
}

impl SlackConfig {
    /// Get the Web API base URL
    pub fn api_url(&self) -> String {
        self.api_url
            .clone()
            .unwrap_or_else(|| "https://slack.com/api".to_string())
    }

    /// Get the poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(2))
    }

    /// Get the overall reply budget
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(60))
    }
}

/// Gradio space configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GradioConfig {
    /// Spaces selectable by index with `/use gradio <n>`
    pub spaces: Option<Vec<String>>,
    /// Fixed queue session hash; random per process when unset
    pub session_hash: Option<String>,
}

impl GradioConfig {
    /// Get the indexed space list
    pub fn spaces(&self) -> Vec<String> {
        self.spaces.clone().unwrap_or_else(|| {
            vec![
                "https://modelscope.cn/studios/AI-ModelScope/ChatGLM6B-unofficial/summary"
                    .to_string(),
                "https://modelscope.cn/studios/baichuan-inc/baichuan-7B-demo/summary".to_string(),
                "https://huggingface.co/spaces/HuggingFaceH4/falcon-chat".to_string(),
            ]
        })
    }
}

/// `gpt4` (liaobots) configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gpt4Config {
    /// Pre-issued auth code; a fresh one is requested when unset
    pub auth_code: Option<String>,
    /// Site base URL
    pub base_url: Option<String>,
    /// Number of history messages carried into each request
    pub history_limit: Option<usize>,
}

impl Gpt4Config {
    /// Get the site base URL
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| "https://liaobots.com".to_string())
    }

    /// Get the history limit
    pub fn history_limit(&self) -> usize {
        self.history_limit.unwrap_or(6)
    }
}

/// Midjourney bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MidjourneyConfig {
    /// Bridge account UUID (`MJ_UUID`)
    pub uuid: Option<String>,
    /// Bridge base URL
    pub base_url: Option<String>,
    /// Seconds between result polls
    pub poll_interval_secs: Option<u64>,
    /// Maximum result polls
    pub poll_attempts: Option<u32>,
}

impl MidjourneyConfig {
    /// Get the bridge base URL
    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| "http://midjourney-api.ai-des.com".to_string())
    }

    /// Get the poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.unwrap_or(6))
    }

    /// Get the maximum polls
    pub fn poll_attempts(&self) -> u32 {
        self.poll_attempts.unwrap_or(60)
    }
}
