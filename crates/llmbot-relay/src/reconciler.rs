//! Response reconciliation
//!
//! Backends stream a mix of partial updates, authoritative replacements,
//! echoes of the prompt and completion markers. The [`Reconciler`] folds them
//! into one [`ChatExchange`] whose text only ever grows (or is replaced by a
//! more complete value) and tells the observer about every change.
//!
//! ```text
//! AwaitingFirst --text--> Streaming --Complete / ConversationEnd / close--> Terminal
//!        \_____________________Complete / ConversationEnd / close_____________/
//! ```

use crate::session::SessionHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Result text when a stream ends without any content
pub const NO_RESPONSE: &str = "No response";

/// Callback receiving the full current text on every change
pub type Observer = Arc<dyn Fn(&str) + Send + Sync>;

/// Reconciliation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing accepted yet
    AwaitingFirst,
    /// Text is accumulating
    Streaming,
    /// Exchange is final; further fragments are ignored
    Terminal,
}

/// Who produced a fragment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The backend
    Bot,
    /// Echo of the prompt
    User,
}

impl Origin {
    /// Classify a backend author field
    pub fn from_author(author: Option<&str>) -> Self {
        match author {
            Some("user") | Some("human") => Origin::User,
            _ => Origin::Bot,
        }
    }
}

/// What a fragment means for the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Incremental text; ignored when shorter than what we have
    Partial,
    /// Authoritative replacement that keeps the exchange open
    Final,
    /// End of the exchange, optionally with authoritative text
    Complete,
    /// End of the exchange and of the whole conversation
    ConversationEnd,
}

/// One normalized piece of backend output
#[derive(Debug, Clone)]
pub struct Fragment {
    /// Text carried by the fragment
    pub text: Option<String>,
    /// Author
    pub origin: Origin,
    /// Server timestamp, when the backend provides one
    pub timestamp: Option<DateTime<Utc>>,
    /// Meaning
    pub marker: Marker,
    /// Raw message kept for the side channel
    pub detail: Option<Value>,
}

impl Fragment {
    fn with_marker(marker: Marker, text: Option<String>) -> Self {
        Self {
            text,
            origin: Origin::Bot,
            timestamp: None,
            marker,
            detail: None,
        }
    }

    /// Partial bot text
    pub fn partial(text: impl Into<String>) -> Self {
        Self::with_marker(Marker::Partial, Some(text.into()))
    }

    /// Authoritative bot text
    pub fn final_text(text: impl Into<String>) -> Self {
        Self::with_marker(Marker::Final, Some(text.into()))
    }

    /// Completion marker
    pub fn complete(text: Option<String>) -> Self {
        Self::with_marker(Marker::Complete, text)
    }

    /// Conversation-closed marker
    pub fn conversation_end(text: Option<String>) -> Self {
        Self::with_marker(Marker::ConversationEnd, text)
    }

    /// Set the author
    pub fn from_origin(mut self, origin: Origin) -> Self {
        self.origin = origin;
        self
    }

    /// Set the server timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach the raw message
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Data that rides along with the text
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SideChannel {
    /// Last raw message accepted
    pub detail: Option<Value>,
    /// Image directive issued by the backend
    pub image_prompt: Option<String>,
    /// Image URLs produced for the directive
    pub images: Vec<String>,
}

/// One request/response round trip
#[derive(Debug, Clone)]
pub struct ChatExchange {
    /// Exchange id
    pub id: Uuid,
    /// Conversation the exchange belongs to
    pub conversation: Option<SessionHandle>,
    /// Prompt as sent
    pub prompt: String,
    /// Response text
    pub text: String,
    /// No further fragments will be folded in
    pub terminal: bool,
    /// Failure reported by the backend
    pub error: Option<String>,
    /// Extra data
    pub side_channel: SideChannel,
    /// The backend will not accept further turns in this conversation
    pub conversation_ended: bool,
    /// Fragments stamped earlier than this belong to older exchanges
    pub created_at: DateTime<Utc>,
}

impl ChatExchange {
    /// New exchange stamped now
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation: None,
            prompt: prompt.into(),
            text: String::new(),
            terminal: false,
            error: None,
            side_channel: SideChannel::default(),
            conversation_ended: false,
            created_at: Utc::now(),
        }
    }

    /// Override the creation stamp
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Attach the conversation
    pub fn in_conversation(mut self, conversation: Option<SessionHandle>) -> Self {
        self.conversation = conversation;
        self
    }

    /// Exchange finished with fixed text and no streaming
    pub fn finished(prompt: impl Into<String>, text: impl Into<String>) -> Self {
        let mut exchange = Self::new(prompt);
        exchange.text = text.into();
        exchange.terminal = true;
        exchange
    }
}

/// Folds fragments into a [`ChatExchange`]
pub struct Reconciler {
    exchange: ChatExchange,
    phase: Phase,
    observer: Option<Observer>,
}

impl Reconciler {
    /// Start reconciling `exchange`
    pub fn new(exchange: ChatExchange, observer: Option<Observer>) -> Self {
        Self {
            exchange,
            phase: Phase::AwaitingFirst,
            observer,
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the exchange is final
    pub fn is_terminal(&self) -> bool {
        self.phase == Phase::Terminal
    }

    /// Exchange so far
    pub fn exchange(&self) -> &ChatExchange {
        &self.exchange
    }

    /// Side channel, writable until the exchange is final
    pub fn side_channel_mut(&mut self) -> Option<&mut SideChannel> {
        (!self.is_terminal()).then_some(&mut self.exchange.side_channel)
    }

    /// Fold one fragment in, returning the phase afterwards
    pub fn apply(&mut self, fragment: Fragment) -> Phase {
        if self.is_terminal() {
            trace!(marker = ?fragment.marker, "ignoring fragment after terminal");
            return self.phase;
        }
        if fragment.origin == Origin::User {
            trace!("ignoring prompt echo");
            return self.phase;
        }
        if let Some(timestamp) = fragment.timestamp {
            if timestamp < self.exchange.created_at {
                debug!(%timestamp, "ignoring fragment from an earlier exchange");
                return self.phase;
            }
        }

        if let Some(detail) = fragment.detail {
            self.exchange.side_channel.detail = Some(detail);
        }

        let changed = match fragment.text {
            Some(text) if !text.is_empty() => self.accept(text, fragment.marker),
            _ => false,
        };

        match fragment.marker {
            Marker::Partial | Marker::Final => {
                if changed {
                    self.phase = Phase::Streaming;
                }
            }
            Marker::Complete => self.phase = Phase::Terminal,
            Marker::ConversationEnd => {
                self.exchange.conversation_ended = true;
                self.phase = Phase::Terminal;
            }
        }
        self.exchange.terminal = self.is_terminal();

        if changed {
            self.notify();
        }
        self.phase
    }

    /// Record a backend failure and end the exchange
    pub fn fail(&mut self, error: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        self.exchange.error = Some(error.into());
        self.phase = Phase::Terminal;
        self.exchange.terminal = true;
    }

    /// End the exchange (stream closed or terminal reached) and hand it over
    ///
    /// An exchange that never received text gets [`NO_RESPONSE`].
    pub fn finish(mut self) -> ChatExchange {
        self.phase = Phase::Terminal;
        self.exchange.terminal = true;
        if self.exchange.text.is_empty() {
            self.exchange.text = NO_RESPONSE.to_string();
        }
        self.exchange
    }

    fn accept(&mut self, text: String, marker: Marker) -> bool {
        if text == self.exchange.text {
            return false;
        }
        if marker == Marker::Partial && text.chars().count() < self.exchange.text.chars().count()
        {
            debug!("ignoring stale partial");
            return false;
        }
        self.exchange.text = text;
        true
    }

    fn notify(&self) {
        let Some(observer) = &self.observer else {
            return;
        };
        let text = self.exchange.text.as_str();
        if panic::catch_unwind(AssertUnwindSafe(|| observer(text))).is_err() {
            warn!(exchange = %self.exchange.id, "observer panicked, continuing");
        }
    }
}
