//! Slack relay: post into a channel, poll the thread for the bot's reply
//!
//! The chat bot (typically a Slack app wrapping an LLM) streams by editing
//! its reply in place and marks unfinished text with a trailing `_Typing…_`.

use super::{ChatBackend, ChatRequest, NetworkSettings};
use crate::error::{RelayError, Result};
use crate::reconciler::{ChatExchange, Fragment, Reconciler};
use async_trait::async_trait;
use llmbot_config::SlackConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Suffix the bot keeps on its reply while still writing
pub const TYPING_SUFFIX: &str = "_Typing…_";

/// Workspace member
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct SlackUser {
    /// Member id
    pub id: String,
    /// Display name
    #[serde(default)]
    pub real_name: Option<String>,
    /// App or bot user
    #[serde(default)]
    pub is_bot: bool,
}

/// Message in a thread
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ThreadMessage {
    /// Message text
    #[serde(default)]
    pub text: String,
    /// Message timestamp, doubling as its id
    #[serde(default)]
    pub ts: Option<String>,
    /// Present once the message was edited
    #[serde(default)]
    pub edited: Option<Value>,
}

impl ThreadMessage {
    /// Whether the author changed the message after posting
    pub fn is_edited(&self) -> bool {
        self.edited.is_some()
    }
}

/// The three workspace calls the relay needs
#[async_trait]
pub trait WorkspaceClient: Send + Sync {
    /// Post `text`, in `thread_ts` when given; returns the new message `ts`
    async fn post_message(&self, channel: &str, text: &str, thread_ts: Option<&str>)
        -> Result<String>;

    /// Messages of the thread rooted at `thread_ts`
    async fn replies(&self, channel: &str, thread_ts: &str) -> Result<Vec<ThreadMessage>>;

    /// Workspace members
    async fn list_users(&self) -> Result<Vec<SlackUser>>;
}

/// Web API client authenticated with a user token
pub struct SlackWebClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl SlackWebClient {
    /// Client for `api_url` using `token`
    pub fn new(api_url: impl Into<String>, token: impl Into<String>, network: &NetworkSettings) -> Result<Self> {
        Ok(Self {
            client: network.http_client()?,
            api_url: api_url.into(),
            token: token.into(),
        })
    }

    fn check(method: &str, body: Value) -> Result<Value> {
        if body.get("ok").and_then(Value::as_bool) == Some(true) {
            return Ok(body);
        }
        let error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error")
            .to_string();
        Err(match error.as_str() {
            "invalid_auth" | "not_authed" | "token_revoked" | "account_inactive" => {
                RelayError::Auth(format!("{method}: {error}"))
            }
            _ => RelayError::BackendUnavailable(format!("{method}: {error}")),
        })
    }
}

#[async_trait]
impl WorkspaceClient for SlackWebClient {
    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<String> {
        let body = json!({
            "channel": channel,
            "text": text,
            "thread_ts": thread_ts,
            "include_all_metadata": true,
            "blocks": [{ "type": "section", "text": { "type": "mrkdwn", "text": text } }]
        });
        let response: Value = self
            .client
            .post(format!("{}/chat.postMessage", self.api_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        let response = Self::check("chat.postMessage", response)?;
        response
            .get("ts")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RelayError::Protocol("chat.postMessage returned no ts".to_string()))
    }

    async fn replies(&self, channel: &str, thread_ts: &str) -> Result<Vec<ThreadMessage>> {
        let response: Value = self
            .client
            .get(format!("{}/conversations.replies", self.api_url))
            .bearer_auth(&self.token)
            .query(&[
                ("channel", channel),
                ("ts", thread_ts),
                ("include_all_metadata", "true"),
            ])
            .send()
            .await?
            .json()
            .await?;
        let response = Self::check("conversations.replies", response)?;
        let messages = response.get("messages").cloned().unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(messages)?)
    }

    async fn list_users(&self) -> Result<Vec<SlackUser>> {
        let response: Value = self
            .client
            .get(format!("{}/users.list", self.api_url))
            .bearer_auth(&self.token)
            .send()
            .await?
            .json()
            .await?;
        let response = Self::check("users.list", response)?;
        let members = response.get("members").cloned().unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(members)?)
    }
}

/// Split a reply into its content and whether the bot is done
pub fn parse_reply(text: &str) -> (String, bool) {
    match text.strip_suffix(TYPING_SUFFIX) {
        Some(content) => (content.trim().to_string(), false),
        None => (text.trim().to_string(), true),
    }
}

fn ts_value(ts: &str) -> f64 {
    ts.parse().unwrap_or(0.0)
}

/// Slack backend
pub struct SlackBackend {
    client: Box<dyn WorkspaceClient>,
    channel: String,
    chatbot_name: Option<String>,
    mention: Option<String>,
    thread_ts: Option<String>,
    poll_interval: Duration,
    timeout: Duration,
}

impl SlackBackend {
    /// Backend using the Web API with the configured token and channel
    pub fn new(config: &SlackConfig, network: &NetworkSettings) -> Result<Self> {
        let token = config.bot_token.as_deref().unwrap_or_default();
        if !token.starts_with("xoxp-") {
            return Err(RelayError::Config(
                "Slack token must be a user token (xoxp-...)".to_string(),
            ));
        }
        let client = SlackWebClient::new(config.api_url(), token, network)?;
        Self::with_client(Box::new(client), config)
    }

    /// Backend over any workspace client
    pub fn with_client(client: Box<dyn WorkspaceClient>, config: &SlackConfig) -> Result<Self> {
        let channel = config.channel.clone().unwrap_or_default();
        if !channel.starts_with("C0") {
            return Err(RelayError::Config(format!(
                "invalid Slack channel id '{channel}'"
            )));
        }
        Ok(Self {
            client,
            channel,
            chatbot_name: config.chatbot_name.clone(),
            mention: None,
            thread_ts: None,
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        })
    }

    /// Thread the conversation lives in
    pub fn thread(&self) -> Option<&str> {
        self.thread_ts.as_deref()
    }

    async fn mention(&mut self) -> Result<String> {
        if let Some(mention) = &self.mention {
            return Ok(mention.clone());
        }
        let users = self.client.list_users().await?;
        let bots: Vec<&SlackUser> = users.iter().filter(|user| user.is_bot).collect();
        let chosen = bots
            .iter()
            .find(|bot| bot.real_name.is_some() && bot.real_name == self.chatbot_name)
            .or_else(|| bots.last());

        let mention = match chosen {
            Some(bot) => {
                info!(bot = %bot.id, name = ?bot.real_name, "mentioning slack bot");
                format!("<@{}> ", bot.id)
            }
            None => {
                warn!("no bot users found in the workspace");
                String::new()
            }
        };
        self.mention = Some(mention.clone());
        Ok(mention)
    }
}

#[async_trait]
impl ChatBackend for SlackBackend {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send(&mut self, request: ChatRequest) -> Result<ChatExchange> {
        let text = format!("{}{}", self.mention().await?, request.prompt);
        let posted = self
            .client
            .post_message(&self.channel, &text, self.thread_ts.as_deref())
            .await?;
        let thread = self.thread_ts.get_or_insert_with(|| posted.clone()).clone();
        debug!(%thread, %posted, "prompt posted");

        let mut reconciler = Reconciler::new(ChatExchange::new(&request.prompt), request.observer.clone());
        let deadline = Instant::now() + self.timeout;

        while Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
            let messages = match self.client.replies(&self.channel, &thread).await {
                Ok(messages) => messages,
                Err(e @ RelayError::Auth(_)) => return Err(e),
                Err(e) => {
                    debug!(error = %e, "replies poll failed");
                    continue;
                }
            };

            let reply = messages.iter().find(|message| {
                message.is_edited()
                    && message
                        .ts
                        .as_deref()
                        .is_some_and(|ts| ts_value(ts) > ts_value(&posted))
            });
            let Some(reply) = reply else {
                continue;
            };

            let (content, done) = parse_reply(&reply.text);
            if done {
                reconciler.apply(Fragment::complete(Some(content)));
                break;
            }
            reconciler.apply(Fragment::partial(content));
        }

        if !reconciler.is_terminal() {
            warn!(timeout = ?self.timeout, "slack reply did not finish in time");
            reconciler.fail("timed out waiting for the reply to finish");
        }
        Ok(reconciler.finish())
    }
}
