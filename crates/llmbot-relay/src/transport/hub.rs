//! Record-separator delimited hub dialect
//!
//! Frames are JSON objects terminated by `0x1E`; one WebSocket message may
//! carry several. The `type` field selects the frame kind:
//!
//! | type | meaning |
//! |---|---|
//! | 1 | streaming update (`arguments[0].messages`) |
//! | 2 | completion item with the final messages and throttling |
//! | 3 | end of stream |
//! | 6 | ping, answered with `{"type":6}` |
//! | 7 | close request, answered with `{"type":7}` |

use super::Dialect;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Frame delimiter
pub const RECORD_SEPARATOR: char = '\u{1e}';

const HANDSHAKE: &str = "{\"protocol\":\"json\",\"version\":1}\u{1e}";
const PING: &str = "{\"type\":6}\u{1e}";
const CLOSE_ACK: &str = "{\"type\":7}\u{1e}";

/// One block of an adaptive card
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CardBlock {
    /// Rendered text of the block
    #[serde(default)]
    pub text: Option<String>,
}

/// Card attached to a bot message
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AdaptiveCard {
    /// Card blocks
    #[serde(default)]
    pub body: Vec<CardBlock>,
}

/// Chat message carried by update and completion frames
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HubMessage {
    /// Message text
    #[serde(default)]
    pub text: Option<String>,
    /// `bot` or `user`
    #[serde(default)]
    pub author: Option<String>,
    /// Absent for plain chat; `Disengaged`, `GenerateContentQuery`, ... otherwise
    #[serde(default)]
    pub message_type: Option<String>,
    /// Payload kind for typed messages (`IMAGE` for image directives)
    #[serde(default)]
    pub content_type: Option<String>,
    /// Cards used when `text` is empty
    #[serde(default)]
    pub adaptive_cards: Vec<AdaptiveCard>,
    /// Server timestamp
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Message id
    #[serde(default)]
    pub message_id: Option<String>,
}

impl HubMessage {
    /// Plain chat message (no `messageType`)
    pub fn is_chat(&self) -> bool {
        self.message_type.is_none()
    }

    /// Text, falling back to the joined adaptive card texts
    pub fn display_text(&self) -> String {
        match self.text.as_deref() {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => self
                .adaptive_cards
                .iter()
                .map(|card| {
                    card.body
                        .iter()
                        .filter_map(|block| block.text.as_deref())
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Per-conversation usage counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Throttling {
    /// Messages sent so far
    #[serde(default)]
    pub num_user_messages_in_conversation: Option<u32>,
    /// Conversation limit
    #[serde(default)]
    pub max_num_user_messages_in_conversation: Option<u32>,
}

impl Throttling {
    /// Conversation used up its message quota
    ///
    /// Only counters the server actually sent are compared.
    pub fn is_exhausted(&self) -> bool {
        match (
            self.num_user_messages_in_conversation,
            self.max_num_user_messages_in_conversation,
        ) {
            (Some(used), Some(max)) => used >= max,
            _ => false,
        }
    }
}

/// Outcome attached to a completion item
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionResult {
    /// `Success`, `Throttled`, ...
    #[serde(default)]
    pub value: Option<String>,
    /// Human-readable detail
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a type-2 frame
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompletionItem {
    /// Every message of the exchange, user prompt included
    #[serde(default)]
    pub messages: Vec<HubMessage>,
    /// Usage counters
    #[serde(default)]
    pub throttling: Option<Throttling>,
    /// Request outcome
    #[serde(default)]
    pub result: Option<CompletionResult>,
    /// When the server forgets the conversation
    #[serde(default)]
    pub conversation_expiry_time: Option<String>,
}

impl CompletionItem {
    /// Last plain chat message written by the bot
    pub fn last_bot_message(&self) -> Option<&HubMessage> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.is_chat() && m.author.as_deref() == Some("bot"))
    }

    /// The backend refuses further turns in this conversation
    pub fn conversation_ended(&self) -> bool {
        let disengaged = self
            .messages
            .last()
            .and_then(|m| m.message_type.as_deref())
            == Some("Disengaged");
        disengaged
            || self
                .throttling
                .as_ref()
                .is_some_and(Throttling::is_exhausted)
    }
}

/// Decoded hub frame
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// Type 1 with at least one message
    Update(Vec<HubMessage>),
    /// Type 2
    Completion(Box<CompletionItem>),
    /// Type 3
    StreamEnd,
    /// Type 6
    Ping,
    /// Type 7
    CloseRequest,
    /// Any other frame type
    Other(u64),
}

/// Record-separator dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct HubDialect;

impl HubDialect {
    fn decode_frame(raw: &str) -> Option<HubEvent> {
        let frame: Value = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "dropping malformed hub frame");
                return None;
            }
        };
        let kind = frame.get("type").and_then(Value::as_u64)?;

        match kind {
            1 => {
                let messages = frame
                    .pointer("/arguments/0/messages")
                    .cloned()
                    .map(serde_json::from_value::<Vec<HubMessage>>)
                    .transpose();
                match messages {
                    Ok(Some(messages)) if !messages.is_empty() => Some(HubEvent::Update(messages)),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(error = %e, "dropping undecodable update");
                        None
                    }
                }
            }
            2 => {
                let item = frame
                    .get("item")
                    .cloned()
                    .map(serde_json::from_value::<CompletionItem>);
                match item {
                    Some(Ok(item)) => Some(HubEvent::Completion(Box::new(item))),
                    Some(Err(e)) => {
                        debug!(error = %e, "dropping undecodable completion");
                        None
                    }
                    None => Some(HubEvent::Completion(Box::default())),
                }
            }
            3 => Some(HubEvent::StreamEnd),
            6 => Some(HubEvent::Ping),
            7 => Some(HubEvent::CloseRequest),
            other => Some(HubEvent::Other(other)),
        }
    }
}

impl Dialect for HubDialect {
    type Event = HubEvent;

    fn name(&self) -> &'static str {
        "hub"
    }

    fn handshake(&self) -> Vec<String> {
        vec![HANDSHAKE.to_string(), PING.to_string()]
    }

    fn encode(&self, value: &Value) -> String {
        format!("{value}{RECORD_SEPARATOR}")
    }

    fn decode(&self, payload: &str) -> Vec<HubEvent> {
        payload
            .split(RECORD_SEPARATOR)
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .filter_map(Self::decode_frame)
            .collect()
    }

    fn reply_to(&self, event: &HubEvent) -> Option<String> {
        match event {
            HubEvent::Ping => Some(PING.to_string()),
            HubEvent::CloseRequest => Some(CLOSE_ACK.to_string()),
            _ => None,
        }
    }

    fn heartbeat(&self) -> Option<String> {
        Some(PING.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handshake_frames_are_exact() {
        let frames = HubDialect.handshake();
        assert_eq!(frames[0], "{\"protocol\":\"json\",\"version\":1}\u{1e}");
        assert_eq!(frames[1], "{\"type\":6}\u{1e}");
    }

    #[test]
    fn test_encode_appends_separator() {
        let frame = HubDialect.encode(&json!({"type": 4}));
        assert_eq!(frame, "{\"type\":4}\u{1e}");
    }

    #[test]
    fn test_decode_splits_batched_frames() {
        let payload = "{}\u{1e}{\"type\":6}\u{1e}{\"type\":3,\"invocationId\":\"0\"}\u{1e}";
        let events = HubDialect.decode(payload);
        assert_eq!(events, vec![HubEvent::Ping, HubEvent::StreamEnd]);
    }

    #[test]
    fn test_malformed_frame_is_dropped() {
        let payload = "{not json\u{1e}{\"type\":7}\u{1e}";
        assert_eq!(HubDialect.decode(payload), vec![HubEvent::CloseRequest]);
    }

    #[test]
    fn test_update_without_messages_is_skipped() {
        let payload = json!({"type": 1, "arguments": [{"throttling": {}}]}).to_string();
        assert!(HubDialect.decode(&payload).is_empty());
    }

    #[test]
    fn test_pings_get_pongs() {
        assert_eq!(
            HubDialect.reply_to(&HubEvent::Ping).as_deref(),
            Some("{\"type\":6}\u{1e}")
        );
        assert_eq!(
            HubDialect.reply_to(&HubEvent::CloseRequest).as_deref(),
            Some("{\"type\":7}\u{1e}")
        );
        assert!(HubDialect.reply_to(&HubEvent::StreamEnd).is_none());
    }

    #[test]
    fn test_completion_detects_quota_exhaustion() {
        let payload = json!({
            "type": 2,
            "item": {
                "messages": [
                    {"author": "user", "text": "hi"},
                    {"author": "bot", "text": "hello"}
                ],
                "throttling": {
                    "numUserMessagesInConversation": 20,
                    "maxNumUserMessagesInConversation": 20
                }
            }
        })
        .to_string();

        let events = HubDialect.decode(&payload);
        let HubEvent::Completion(item) = &events[0] else {
            panic!("expected completion, got {events:?}");
        };
        assert!(item.conversation_ended());
        assert_eq!(
            item.last_bot_message().map(HubMessage::display_text).as_deref(),
            Some("hello")
        );
    }

    #[test]
    fn test_zero_allotment_is_exhausted() {
        let throttling = Throttling {
            num_user_messages_in_conversation: Some(0),
            max_num_user_messages_in_conversation: Some(0),
        };
        assert!(throttling.is_exhausted());
    }

    #[test]
    fn test_missing_counters_are_not_exhausted() {
        let throttling: Throttling = serde_json::from_value(json!({})).unwrap();
        assert!(!throttling.is_exhausted());

        let partial: Throttling =
            serde_json::from_value(json!({"numUserMessagesInConversation": 3})).unwrap();
        assert!(!partial.is_exhausted());
    }

    #[test]
    fn test_display_text_falls_back_to_cards() {
        let message: HubMessage = serde_json::from_value(json!({
            "author": "bot",
            "text": "",
            "adaptiveCards": [{"body": [{"text": "first"}, {"text": "second"}]}]
        }))
        .unwrap();
        assert_eq!(message.display_text(), "first\nsecond");
    }
}
