//! Resumable conversation state kept by socket backends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Everything needed to continue a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHandle {
    /// Server conversation id
    pub conversation_id: String,
    /// Participant id
    pub client_id: String,
    /// Conversation signature sent with every request
    pub signature: String,
    /// When the server forgets the conversation
    pub expires_at: DateTime<Utc>,
    /// Invocation id of the next request
    pub turn_counter: u64,
}

impl SessionHandle {
    /// Handle for a freshly created conversation
    pub fn new(
        conversation_id: impl Into<String>,
        client_id: impl Into<String>,
        signature: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            client_id: client_id.into(),
            signature: signature.into(),
            expires_at,
            turn_counter: 0,
        }
    }

    /// Whether at least `margin` of the lifetime is left at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        chrono::Duration::from_std(margin)
            .ok()
            .and_then(|margin| now.checked_add_signed(margin))
            .is_some_and(|deadline| deadline < self.expires_at)
    }

    /// Handle for the next turn after a completed exchange
    pub fn renewed(&self, now: DateTime<Utc>, ttl: Duration) -> Self {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(now);
        Self {
            expires_at,
            turn_counter: self.turn_counter + 1,
            ..self.clone()
        }
    }
}

/// Slot holding at most one session per backend
#[derive(Debug, Clone)]
pub struct SessionSlot {
    handle: Option<SessionHandle>,
    margin: Duration,
}

impl SessionSlot {
    /// Empty slot discarding handles with less than `margin` lifetime left
    pub fn new(margin: Duration) -> Self {
        Self {
            handle: None,
            margin,
        }
    }

    /// Valid handle, discarding a stale one
    pub fn current(&mut self) -> Option<SessionHandle> {
        self.current_at(Utc::now())
    }

    /// Valid handle as of `now`
    pub fn current_at(&mut self, now: DateTime<Utc>) -> Option<SessionHandle> {
        match &self.handle {
            Some(handle) if handle.is_valid_at(now, self.margin) => Some(handle.clone()),
            Some(handle) => {
                debug!(conversation = %handle.conversation_id, "discarding expired session");
                self.handle = None;
                None
            }
            None => None,
        }
    }

    /// Replace the stored handle
    pub fn store(&mut self, handle: SessionHandle) {
        self.handle = Some(handle);
    }

    /// Forget the conversation
    pub fn clear(&mut self) {
        self.handle = None;
    }

    /// Stored handle regardless of validity
    pub fn peek(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }
}
