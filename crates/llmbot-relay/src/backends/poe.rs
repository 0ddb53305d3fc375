//! Poe bots over GraphQL plus the update channel
//!
//! Bootstrap reads the channel settings and form key, subscribes to
//! `messageAdded`, and refreshes the channel sequence. A prompt is one
//! `messageEdgeCreate` mutation; the answer streams back over the channel
//! socket.

use super::{ChatBackend, ChatRequest, NetworkSettings};
use crate::bootstrap::{self, sign_payload, RetryPolicy};
use crate::error::{RelayError, Result};
use crate::reconciler::{ChatExchange, Fragment, Origin, Reconciler};
use crate::transport::{ChannelDialect, ChannelEvent, ChannelMessage, FramedSocket, SocketOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use llmbot_config::PoeConfig;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info};

/// User-facing model names and the bot codenames behind them
pub const POE_MODELS: &[(&str, &str)] = &[
    ("chatgpt", "chinchilla"),
    ("sage", "capybara"),
    ("claude", "a2"),
    ("claude+", "a2_2"),
    ("qianlong", "qianlonggpt"),
    ("midjourney", "midjourney"),
];

/// Codename for a model name, `chinchilla` for anything unknown
pub fn codename(model: &str) -> &'static str {
    POE_MODELS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, codename)| *codename)
        .unwrap_or("chinchilla")
}

const CHAT_VIEW_QUERY: &str = "query ChatViewQuery($bot: String!) {\n  chatOfBot(bot: $bot) {\n    id\n    chatId\n    defaultBotNickname\n    shouldShowDisclaimer\n  }\n}\n";

const SEND_MESSAGE_MUTATION: &str = "mutation chatHelpers_sendMessageMutation_Mutation(\n  $chatId: BigInt!\n  $bot: String!\n  $query: String!\n  $source: MessageSource\n  $withChatBreak: Boolean!\n) {\n  messageEdgeCreate(chatId: $chatId, bot: $bot, query: $query, source: $source, withChatBreak: $withChatBreak) {\n    chatBreak {\n      cursor\n      node {\n        id\n        messageId\n        text\n        author\n        suggestedReplies\n        creationTime\n        state\n      }\n      id\n    }\n    message {\n      cursor\n      node {\n        id\n        messageId\n        text\n        author\n        suggestedReplies\n        creationTime\n        state\n      }\n      id\n    }\n    status\n  }\n}\n";

const SUBSCRIPTIONS_MUTATION: &str = "mutation subscriptionsMutation(\n  $subscriptions: [AutoSubscriptionQuery!]!\n) {\n  autoSubscribe(subscriptions: $subscriptions) {\n    viewer {\n      id\n    }\n  }\n}\n";

const MESSAGE_ADDED_SUBSCRIPTION: &str = "subscription subscriptions_messageAdded_Subscription(\n  $chatId: BigInt!\n) {\n  messageAdded(chatId: $chatId) {\n    id\n    messageId\n    creationTime\n    state\n    text\n    author\n    linkifiedText\n    suggestedReplies\n  }\n}\n";

const VIEWER_STATE_SUBSCRIPTION: &str = "subscription subscriptions_viewerStateUpdated_Subscription {\n  viewerStateUpdated {\n    id\n    availableBots {\n      id\n      displayName\n      profilePicture\n    }\n  }\n}\n";

static FORMKEY_SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<script>if\(.+\)throw new Error;(.+)</script>").unwrap());
static FORMKEY_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r#"var .="([0-9a-f]+)","#).unwrap());
static FORMKEY_CIPHER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d+)\]=.\[(\d+)\]").unwrap());

/// Recover the form key hidden in the home page script
pub fn extract_formkey(html: &str) -> Option<String> {
    let script = FORMKEY_SCRIPT.captures(html)?.get(1)?.as_str();
    let key: Vec<char> = FORMKEY_KEY.captures(script)?.get(1)?.as_str().chars().collect();

    let pairs: Vec<(usize, usize)> = FORMKEY_CIPHER
        .captures_iter(script)
        .filter_map(|caps| Some((caps[1].parse().ok()?, caps[2].parse().ok()?)))
        .collect();
    if pairs.is_empty() {
        return None;
    }

    let mut formkey = vec![None; pairs.len()];
    for (slot, index) in pairs {
        if slot < formkey.len() {
            formkey[slot] = key.get(index).copied();
        }
    }
    formkey.into_iter().collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelData {
    channel: String,
    box_name: String,
    #[serde(default)]
    min_seq: Value,
    channel_hash: String,
}

impl ChannelData {
    fn min_seq(&self) -> String {
        match &self.min_seq {
            Value::String(seq) => seq.clone(),
            Value::Null => "0".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Settings {
    #[serde(default)]
    formkey: Option<String>,
    tchannel_data: ChannelData,
}

/// Credentials established by bootstrap
#[derive(Debug, Clone)]
struct Credentials {
    formkey: String,
    channel: ChannelData,
}

/// Poe backend
pub struct PoeBackend {
    client: reqwest::Client,
    base_url: String,
    socket_url: Option<String>,
    cookie: String,
    socket: SocketOptions,
    retry: RetryPolicy,
    credentials: Option<Credentials>,
    chat_ids: HashMap<&'static str, i64>,
}

impl PoeBackend {
    /// Backend authenticated with the `p-b` cookie
    pub fn new(cookie: &str, config: &PoeConfig, network: &NetworkSettings) -> Result<Self> {
        let cookie = cookie.trim();
        if cookie.is_empty() {
            return Err(RelayError::Config("Poe cookie must not be empty".to_string()));
        }
        Ok(Self {
            client: network.http_client()?,
            base_url: config.base_url(),
            socket_url: config.socket_url.clone(),
            cookie: format!("p-b={cookie}"),
            socket: network.socket.clone(),
            retry: network.retry.clone(),
            credentials: None,
            chat_ids: HashMap::new(),
        })
    }

    /// Whether bootstrap already ran
    pub fn is_started(&self) -> bool {
        self.credentials.is_some()
    }

    /// Fetch credentials, subscribe and refresh the channel sequence
    pub async fn start(&mut self) -> Result<()> {
        let this = &*self;
        let settings =
            bootstrap::with_retry(&this.retry, "poe settings", || this.fetch_settings(None))
                .await?;

        let formkey = match this.fetch_home_formkey().await {
            Some(formkey) => formkey,
            None => settings.formkey.clone().ok_or_else(|| {
                RelayError::Auth("no form key in settings or home page".to_string())
            })?,
        };
        let mut credentials = Credentials {
            formkey,
            channel: settings.tchannel_data,
        };

        bootstrap::with_retry(&this.retry, "poe subscribe", || this.subscribe(&credentials))
            .await?;

        let channel = credentials.channel.channel.clone();
        let refreshed = bootstrap::with_retry(&this.retry, "poe channel sequence", || {
            this.fetch_settings(Some(&channel))
        })
        .await?;
        credentials.channel.min_seq = refreshed.tchannel_data.min_seq;
        info!(channel = %credentials.channel.channel, "poe session established");

        self.credentials = Some(credentials);
        self.chat_ids.clear();
        Ok(())
    }

    async fn fetch_settings(&self, channel: Option<&str>) -> Result<Settings> {
        let url = match channel {
            Some(channel) => format!("{}/api/settings?channel={}", self.base_url, channel),
            None => format!("{}/api/settings", self.base_url),
        };
        let response = self
            .client
            .get(&url)
            .header("cookie", &self.cookie)
            .send()
            .await
            .map_err(|e| RelayError::Transient(format!("settings request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(bootstrap::status_error(status, "poe settings"));
        }
        response
            .json()
            .await
            .map_err(|e| RelayError::Auth(format!("unexpected settings response: {e}")))
    }

    async fn fetch_home_formkey(&self) -> Option<String> {
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .header("cookie", &self.cookie)
            .send()
            .await
            .ok()?;
        let html = response.text().await.ok()?;
        let formkey = extract_formkey(&html);
        if formkey.is_none() {
            debug!("home page carries no form key script");
        }
        formkey
    }

    async fn subscribe(&self, credentials: &Credentials) -> Result<()> {
        let body = json!({
            "queryName": "subscriptionsMutation",
            "variables": {
                "subscriptions": [
                    { "subscriptionName": "messageAdded", "query": MESSAGE_ADDED_SUBSCRIPTION },
                    { "subscriptionName": "viewerStateUpdated", "query": VIEWER_STATE_SUBSCRIPTION }
                ]
            },
            "query": SUBSCRIPTIONS_MUTATION
        });
        self.graphql(credentials, &body).await.map(|_| ())
    }

    async fn graphql(&self, credentials: &Credentials, body: &Value) -> Result<Value> {
        let payload = serde_json::to_string(body)?;
        let response = self
            .client
            .post(format!("{}/api/gql_POST", self.base_url))
            .header("content-type", "application/json")
            .header("accept", "*/*")
            .header("origin", &self.base_url)
            .header("cookie", &self.cookie)
            .header("poe-formkey", &credentials.formkey)
            .header("poe-tchannel", &credentials.channel.channel)
            .header("poe-tag-id", sign_payload(&payload, &credentials.formkey))
            .body(payload)
            .send()
            .await
            .map_err(|e| RelayError::Transient(format!("graphql request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(bootstrap::status_error(status, "poe graphql"));
        }
        Ok(response.json().await?)
    }

    async fn chat_id(&mut self, credentials: &Credentials, bot: &'static str) -> Result<i64> {
        if let Some(id) = self.chat_ids.get(bot) {
            return Ok(*id);
        }
        let body = json!({ "query": CHAT_VIEW_QUERY, "variables": { "bot": bot } });
        let response = self.graphql(credentials, &body).await?;
        let id = response
            .pointer("/data/chatOfBot/chatId")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                RelayError::Auth(format!(
                    "could not get the chat id for {bot}; the cookie or form key is invalid"
                ))
            })?;
        self.chat_ids.insert(bot, id);
        Ok(id)
    }

    fn channel_url(&self, channel: &ChannelData) -> String {
        let base = match &self.socket_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!(
                "wss://tch{}.tch.quora.com",
                rand::rng().random_range(1..1_000_000)
            ),
        };
        format!(
            "{}/up/{}/updates?min_seq={}&channel={}&hash={}",
            base,
            channel.box_name,
            channel.min_seq(),
            channel.channel,
            channel.channel_hash
        )
    }
}

fn micros_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

fn channel_fragment(message: ChannelMessage) -> Option<Fragment> {
    let text = message.text.clone();
    let fragment = match message.state.as_deref()? {
        "complete" => Fragment::complete(text),
        "incomplete" => Fragment::partial(text.unwrap_or_default()),
        other => {
            debug!(state = other, "ignoring message state");
            return None;
        }
    };
    let fragment = if message.is_human() {
        fragment.from_origin(Origin::User)
    } else {
        fragment
    };
    Some(match message.creation_time.and_then(micros_to_datetime) {
        Some(at) => fragment.at(at),
        None => fragment,
    })
}

#[async_trait]
impl ChatBackend for PoeBackend {
    fn name(&self) -> &str {
        "poe"
    }

    async fn send(&mut self, request: ChatRequest) -> Result<ChatExchange> {
        if !self.is_started() {
            self.start().await?;
        }
        let credentials = self
            .credentials
            .clone()
            .ok_or_else(|| RelayError::Auth("poe session is not established".to_string()))?;

        let bot = codename(&request.model);
        let chat_id = self.chat_id(&credentials, bot).await?;

        let mut socket = FramedSocket::open(
            &self.channel_url(&credentials.channel),
            &[],
            ChannelDialect,
            &self.socket,
        )
        .await?;

        let body = json!({
            "query": SEND_MESSAGE_MUTATION,
            "variables": {
                "bot": bot,
                "query": request.prompt,
                "chatId": chat_id,
                "source": null,
                "withChatBreak": false
            }
        });
        let response = self.graphql(&credentials, &body).await?;

        let Some(node) = response
            .pointer("/data/messageEdgeCreate/message")
            .filter(|message| !message.is_null())
        else {
            socket.close();
            return Ok(ChatExchange::finished(
                &request.prompt,
                format!("{} Rate limit exceeded.", request.model),
            ));
        };
        if node.pointer("/node/messageId").is_none() {
            socket.close();
            return Ok(ChatExchange::finished(
                &request.prompt,
                format!("An unknown error occurred. Raw response data: {response}"),
            ));
        }

        let mut exchange = ChatExchange::new(&request.prompt);
        if let Some(sent_at) = node
            .pointer("/node/creationTime")
            .and_then(Value::as_i64)
            .and_then(micros_to_datetime)
        {
            exchange = exchange.created_at(sent_at);
        }
        let mut reconciler = Reconciler::new(exchange, request.observer.clone());

        while let Some(event) = socket.next_event().await {
            if let ChannelEvent::MessageAdded(message) = event {
                if let Some(fragment) = channel_fragment(message) {
                    reconciler.apply(fragment);
                }
            }
            if reconciler.is_terminal() {
                break;
            }
        }
        socket.close();

        Ok(reconciler.finish())
    }
}
