//! Batched update-channel dialect
//!
//! Every WebSocket message is `{"messages": ["<json>", ...]}` where each entry
//! is itself a JSON document; only `payload.data.messageAdded` matters to the
//! relay.

use super::Dialect;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// `messageAdded` payload
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    /// Message id
    #[serde(default)]
    pub message_id: Option<i64>,
    /// Text so far
    #[serde(default)]
    pub text: Option<String>,
    /// `incomplete` while streaming, `complete` when done
    #[serde(default)]
    pub state: Option<String>,
    /// `human` for the prompt echo, the bot codename otherwise
    #[serde(default)]
    pub author: Option<String>,
    /// Creation time in microseconds since the epoch
    #[serde(default)]
    pub creation_time: Option<i64>,
}

impl ChannelMessage {
    /// Echo of the prompt
    pub fn is_human(&self) -> bool {
        self.author.as_deref() == Some("human")
    }

    /// Final state reached
    pub fn is_complete(&self) -> bool {
        self.state.as_deref() == Some("complete")
    }
}

/// Decoded channel entry
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A chat message was added or updated
    MessageAdded(ChannelMessage),
    /// Subscription traffic the relay does not use
    Other,
}

/// `{"messages": [...]}` dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelDialect;

impl ChannelDialect {
    fn decode_entry(entry: &Value) -> Option<ChannelEvent> {
        let document = match entry {
            Value::String(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(document) => document,
                Err(e) => {
                    debug!(error = %e, "dropping malformed channel entry");
                    return None;
                }
            },
            Value::Object(_) => entry.clone(),
            _ => return None,
        };

        match document.pointer("/payload/data/messageAdded") {
            Some(added) => match serde_json::from_value(added.clone()) {
                Ok(message) => Some(ChannelEvent::MessageAdded(message)),
                Err(e) => {
                    debug!(error = %e, "dropping undecodable messageAdded");
                    None
                }
            },
            None => Some(ChannelEvent::Other),
        }
    }
}

impl Dialect for ChannelDialect {
    type Event = ChannelEvent;

    fn name(&self) -> &'static str {
        "tchannel"
    }

    fn encode(&self, value: &Value) -> String {
        json!({ "messages": [value.to_string()] }).to_string()
    }

    fn decode(&self, payload: &str) -> Vec<ChannelEvent> {
        let batch: Value = match serde_json::from_str(payload) {
            Ok(batch) => batch,
            Err(e) => {
                debug!(error = %e, "dropping malformed channel batch");
                return Vec::new();
            }
        };

        batch
            .get("messages")
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter_map(Self::decode_entry).collect())
            .unwrap_or_default()
    }
}
