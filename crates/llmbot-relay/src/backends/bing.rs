//! Bing chat over the ChatHub socket
//!
//! A conversation is created over HTTP, then every prompt is one `chat`
//! invocation on a fresh hub socket. The conversation is reused for follow-up
//! prompts while enough of its lifetime is left, and forgotten as soon as the
//! service says it will not take more turns.

use super::{ChatBackend, ChatRequest, NetworkSettings, USER_AGENT};
use crate::bootstrap::{self, RetryPolicy};
use crate::error::{RelayError, Result};
use crate::imaging::{bing_cookie_header, ImageCreator};
use crate::reconciler::{ChatExchange, Fragment, Origin, Reconciler, NO_RESPONSE};
use crate::session::{SessionHandle, SessionSlot};
use crate::transport::{
    CompletionItem, FramedSocket, HubDialect, HubEvent, HubMessage, SocketOptions,
};
use async_trait::async_trait;
use chrono::Utc;
use llmbot_config::{BingConfig, BingVariant};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Appended when the service closes the conversation
pub const CONVERSATION_CLOSED_NOTE: &str =
    "\n\nSystem info: New Bing closed this conversation. Please try again.";

const BASE_OPTION_SETS: &[&str] = &[
    "nlu_direct_response_filter",
    "deepleo",
    "disable_emoji_spoken_text",
    "responsible_ai_policy_235",
    "enablemm",
    "h3imaginative",
    "rcsprtsalwlst",
    "dv3sugg",
    "autosave",
    "gencontentv3",
];

const ALLOWED_MESSAGE_TYPES: &[&str] = &[
    "ActionRequest",
    "Chat",
    "Context",
    "InternalSearchQuery",
    "InternalSearchResult",
    "Disengaged",
    "InternalLoaderMessage",
    "Progress",
    "RenderCardRequest",
    "AdsQuery",
    "SemanticSerp",
    "GenerateContentQuery",
    "SearchQuery",
];

const SLICE_IDS: &[&str] = &[
    "winmuid3tf",
    "osbsdusgreccf",
    "ttstmout",
    "crchatrev",
    "winlongmsgtf",
    "ctrlworkpay",
    "norespwtf",
    "tempcacheread",
    "temptacache",
    "505scss0",
    "508jbcars0",
    "515enbotdets0",
    "5082tsports",
    "515vaoprvs",
    "424dagslnv1s0",
    "kcimgattcf",
    "427startpms",
];

const IMAGE_DIRECTIVE: &str = "GenerateContentQuery";

/// Option sets for a conversation style, without duplicates
pub fn option_sets(variant: BingVariant) -> Vec<&'static str> {
    let mut sets: Vec<&'static str> = Vec::with_capacity(BASE_OPTION_SETS.len() + 2);
    let extra: &[&'static str] = match variant {
        BingVariant::Balanced => &["galileo"],
        BingVariant::Creative => &["clgalileo", "h3imaginative"],
        BingVariant::Precise => &["clgalileo", "h3precise"],
    };
    for set in BASE_OPTION_SETS.iter().chain(extra) {
        if !sets.contains(set) {
            sets.push(set);
        }
    }
    sets
}

/// `chat` invocation frame for one prompt
pub fn invocation(
    prompt: &str,
    session: &SessionHandle,
    is_start_of_session: bool,
    variant: BingVariant,
) -> Value {
    let trace_id: [u8; 16] = rand::random();
    let trace_id: String = trace_id.iter().map(|b| format!("{b:02x}")).collect();

    json!({
        "arguments": [{
            "source": "cib",
            "optionsSets": option_sets(variant),
            "allowedMessageTypes": ALLOWED_MESSAGE_TYPES,
            "sliceIds": SLICE_IDS,
            "traceId": trace_id,
            "isStartOfSession": is_start_of_session,
            "message": {
                "locale": "zh-CN",
                "market": "en-US",
                "region": "US",
                "location": "lat:47.639557;long:-122.128159;re=1000m;",
                "locationHints": [{
                    "country": "United States",
                    "state": "California",
                    "city": "Los Angeles",
                    "timezoneoffset": 8,
                    "countryConfidence": 8,
                    "Center": { "Latitude": 34.0536909, "Longitude": -118.242766 },
                    "RegionType": 2,
                    "SourceType": 1
                }],
                "author": "user",
                "inputMethod": "Keyboard",
                "messageType": "Chat",
                "text": prompt
            },
            "conversationSignature": session.signature,
            "participant": { "id": session.client_id },
            "conversationId": session.conversation_id
        }],
        "invocationId": session.turn_counter.to_string(),
        "target": "chat",
        "type": 4
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationResponse {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    conversation_signature: Option<String>,
    #[serde(default)]
    result: Option<ConversationResult>,
}

#[derive(Debug, Deserialize)]
struct ConversationResult {
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP side of the backend: conversation creation
struct ConversationApi {
    client: reqwest::Client,
    url: String,
    cookie: Option<String>,
    ttl: Duration,
}

impl ConversationApi {
    async fn create(&self) -> Result<SessionHandle> {
        let mut request = self
            .client
            .get(&self.url)
            .header("accept", "application/json")
            .header("accept-language", "zh-CN,zh;q=0.9")
            .header(
                "x-ms-useragent",
                "azsdk-js-api-client-factory/1.0.0-beta.1 core-rest-pipeline/1.10.0 OS/MacIntel",
            );
        if let Some(cookie) = &self.cookie {
            request = request.header("cookie", bing_cookie_header(cookie));
        }

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Transient(format!("conversation request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(bootstrap::status_error(status, "conversation create"));
        }

        let body: ConversationResponse = response
            .json()
            .await
            .map_err(|e| RelayError::Transient(format!("unreadable conversation: {e}")))?;

        let result = body.result.as_ref();
        match result.and_then(|r| r.value.as_deref()) {
            Some("Success") => {}
            Some("UnauthorizedRequest") => {
                let message = result
                    .and_then(|r| r.message.clone())
                    .unwrap_or_else(|| "UnauthorizedRequest".to_string());
                return Err(RelayError::Auth(message));
            }
            other => {
                return Err(RelayError::Transient(format!(
                    "conversation not created: {}",
                    other.unwrap_or("no result")
                )))
            }
        }

        match (
            body.conversation_id,
            body.client_id,
            body.conversation_signature,
        ) {
            (Some(conversation_id), Some(client_id), Some(signature)) => {
                let expires_at = Utc::now()
                    + chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
                Ok(SessionHandle::new(
                    conversation_id,
                    client_id,
                    signature,
                    expires_at,
                ))
            }
            _ => Err(RelayError::Protocol(
                "conversation response is missing ids".to_string(),
            )),
        }
    }
}

/// Bing chat backend
pub struct BingBackend {
    api: ConversationApi,
    chathub_url: String,
    variant: BingVariant,
    socket: SocketOptions,
    retry: RetryPolicy,
    session: SessionSlot,
    ttl: Duration,
    images: Option<Box<dyn ImageCreator>>,
}

impl BingBackend {
    /// Backend for `config`, resolving image directives with `images`
    pub fn new(
        config: &BingConfig,
        network: &NetworkSettings,
        images: Option<Box<dyn ImageCreator>>,
    ) -> Result<Self> {
        let cookie = config.cookie.clone().filter(|c| !c.trim().is_empty());
        if cookie.is_none() {
            warn!("BING_COOKIE is not set, conversations will be anonymous");
        }
        Ok(Self {
            api: ConversationApi {
                client: network.http_client()?,
                url: config.conversation_url(),
                cookie,
                ttl: config.session_ttl(),
            },
            chathub_url: config.chathub_url(),
            variant: config.variant,
            socket: network.socket.clone(),
            retry: network.retry.clone(),
            session: SessionSlot::new(config.session_margin()),
            ttl: config.session_ttl(),
            images,
        })
    }

    /// Conversation kept for the next prompt, if still valid
    pub fn session(&mut self) -> Option<SessionHandle> {
        self.session.current()
    }

    async fn resolve_session(&mut self) -> Result<(SessionHandle, bool)> {
        if let Some(handle) = self.session.current() {
            debug!(conversation = %handle.conversation_id, turn = handle.turn_counter, "reusing conversation");
            return Ok((handle, false));
        }
        let api = &self.api;
        let handle = bootstrap::with_retry(&self.retry, "bing conversation", move || api.create()).await?;
        info!(conversation = %handle.conversation_id, "bing conversation created");
        Ok((handle, true))
    }

    async fn converse(
        &self,
        request: &ChatRequest,
        session: &SessionHandle,
        is_start_of_session: bool,
    ) -> Result<ChatExchange> {
        let headers = [
            ("accept-language", "zh-CN,zh;q=0.9".to_string()),
            ("cache-control", "no-cache".to_string()),
            ("pragma", "no-cache".to_string()),
            ("user-agent", USER_AGENT.to_string()),
        ];
        let mut socket =
            FramedSocket::open(&self.chathub_url, &headers, HubDialect, &self.socket).await?;
        socket.send(&invocation(
            &request.prompt,
            session,
            is_start_of_session,
            self.variant,
        ))?;

        let exchange = ChatExchange::new(&request.prompt).in_conversation(Some(session.clone()));
        let mut reconciler = Reconciler::new(exchange, request.observer.clone());

        while let Some(event) = socket.next_event().await {
            match event {
                HubEvent::Update(messages) => {
                    if let Some(message) = messages.first() {
                        note_image_directive(&mut reconciler, message);
                        if message.is_chat() {
                            reconciler.apply(update_fragment(message));
                        }
                    }
                }
                HubEvent::Completion(item) => {
                    for message in &item.messages {
                        note_image_directive(&mut reconciler, message);
                    }
                    if let Some(fragment) = completion_fragment(&item) {
                        reconciler.apply(fragment);
                    }
                }
                HubEvent::StreamEnd => {
                    reconciler.apply(Fragment::complete(None));
                }
                HubEvent::Ping | HubEvent::CloseRequest | HubEvent::Other(_) => {}
            }
            if reconciler.is_terminal() {
                break;
            }
        }
        socket.close();

        Ok(reconciler.finish())
    }

    async fn attach_images(&self, exchange: &mut ChatExchange) {
        let (Some(prompt), Some(creator)) = (exchange.side_channel.image_prompt.clone(), &self.images)
        else {
            return;
        };

        info!(creator = creator.name(), %prompt, "creating images");
        match creator.create(&prompt).await {
            Ok(urls) => {
                if exchange.text == NO_RESPONSE {
                    exchange.text.clear();
                }
                for url in &urls {
                    exchange.text.push_str(&format!("\n\n![{prompt}]({url})"));
                }
                exchange.side_channel.images = urls;
            }
            Err(e) => {
                warn!(error = %e, "image creation failed");
                exchange
                    .text
                    .push_str(&format!("\n\nImage creation failed: {e}"));
            }
        }
    }
}

fn update_fragment(message: &HubMessage) -> Fragment {
    let fragment = Fragment::partial(message.text.clone().unwrap_or_default())
        .from_origin(Origin::from_author(message.author.as_deref()));
    match serde_json::to_value(message) {
        Ok(detail) => fragment.with_detail(detail),
        Err(_) => fragment,
    }
}

fn completion_fragment(item: &CompletionItem) -> Option<Fragment> {
    let ended = item.conversation_ended();
    let (text, detail) = match item.last_bot_message() {
        Some(message) => (
            Some(message.display_text()),
            serde_json::to_value(message).ok(),
        ),
        None => (
            item.result.as_ref().and_then(|r| r.value.clone()),
            None,
        ),
    };

    let fragment = if ended {
        Fragment::conversation_end(text)
    } else {
        Fragment::final_text(text?)
    };
    Some(match detail {
        Some(detail) => fragment.with_detail(detail),
        None => fragment,
    })
}

fn note_image_directive(reconciler: &mut Reconciler, message: &HubMessage) {
    if message.message_type.as_deref() != Some(IMAGE_DIRECTIVE) {
        return;
    }
    if let (Some(prompt), Some(side)) = (message.text.clone(), reconciler.side_channel_mut()) {
        debug!(%prompt, "image directive");
        side.image_prompt = Some(prompt);
    }
}

#[async_trait]
impl ChatBackend for BingBackend {
    fn name(&self) -> &str {
        "bing"
    }

    async fn send(&mut self, request: ChatRequest) -> Result<ChatExchange> {
        let (session, fresh) = self.resolve_session().await?;
        let outcome = self.converse(&request, &session, fresh).await;
        let mut exchange = match outcome {
            Ok(exchange) => exchange,
            Err(e) => {
                self.session.clear();
                return Err(match e {
                    RelayError::Connection(_) => e,
                    other => RelayError::BackendUnavailable(other.to_string()),
                });
            }
        };

        self.attach_images(&mut exchange).await;

        if exchange.conversation_ended {
            info!(conversation = %session.conversation_id, "bing closed the conversation");
            self.session.clear();
            exchange.conversation = None;
            exchange.text.push_str(CONVERSATION_CLOSED_NOTE);
        } else if exchange.text == NO_RESPONSE {
            debug!(conversation = %session.conversation_id, "empty reply, dropping conversation");
            self.session.clear();
            exchange.conversation = None;
            exchange.text.push_str(CONVERSATION_CLOSED_NOTE);
        } else {
            let renewed = session.renewed(Utc::now(), self.ttl);
            exchange.conversation = Some(renewed.clone());
            self.session.store(renewed);
        }

        Ok(exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> SessionHandle {
        SessionHandle::new("conv-1", "client-1", "sig-1", Utc::now())
    }

    #[test]
    fn test_option_sets_per_variant() {
        let creative = option_sets(BingVariant::Creative);
        assert_eq!(creative.iter().filter(|s| **s == "h3imaginative").count(), 1);
        assert!(creative.contains(&"clgalileo"));

        let balanced = option_sets(BingVariant::Balanced);
        assert!(balanced.contains(&"galileo"));
        assert!(!balanced.contains(&"clgalileo"));

        let precise = option_sets(BingVariant::Precise);
        assert!(precise.contains(&"h3precise"));
    }

    #[test]
    fn test_invocation_carries_session() {
        let mut session = handle();
        session.turn_counter = 3;
        let frame = invocation("hello", &session, false, BingVariant::Creative);

        assert_eq!(frame["invocationId"], "3");
        assert_eq!(frame["type"], 4);
        assert_eq!(frame["target"], "chat");
        let args = &frame["arguments"][0];
        assert_eq!(args["message"]["text"], "hello");
        assert_eq!(args["conversationId"], "conv-1");
        assert_eq!(args["participant"]["id"], "client-1");
        assert_eq!(args["isStartOfSession"], false);
        assert_eq!(args["traceId"].as_str().map(str::len), Some(32));
    }

    #[test]
    fn test_completion_without_bot_message_uses_result_value() {
        let item: CompletionItem = serde_json::from_value(json!({
            "messages": [{"author": "user", "text": "hi"}],
            "result": {"value": "Throttled"}
        }))
        .unwrap();
        let fragment = completion_fragment(&item).unwrap();
        assert_eq!(fragment.text.as_deref(), Some("Throttled"));
    }

    #[test]
    fn test_disengaged_completion_ends_conversation() {
        let item: CompletionItem = serde_json::from_value(json!({
            "messages": [
                {"author": "bot", "text": "Sorry, let's move on"},
                {"author": "bot", "messageType": "Disengaged", "text": ""}
            ]
        }))
        .unwrap();
        let fragment = completion_fragment(&item).unwrap();
        assert_eq!(fragment.marker, crate::reconciler::Marker::ConversationEnd);
        assert_eq!(fragment.text.as_deref(), Some("Sorry, let's move on"));
    }
}
