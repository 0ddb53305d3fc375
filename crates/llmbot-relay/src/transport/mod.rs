//! Framed message transport
//!
//! Every socket-speaking backend talks to its service through a
//! [`FramedSocket`] parameterized by a [`Dialect`]. The dialect owns the wire
//! envelope (delimiters, batching, handshake frames) and the decoding of raw
//! payloads into typed events; the socket owns the connection, the keepalive
//! replies and the periodic heartbeat.
//!
//! Dialects:
//! - [`HubDialect`]: record-separator delimited JSON (Bing ChatHub)
//! - [`ChannelDialect`]: `{"messages": [...]}` batches (Poe update channel)
//! - [`QueueDialect`]: one JSON object per message (Gradio queue)

mod hub;
mod keepalive;
mod queue;
mod socket;
mod tchannel;

pub use hub::{
    AdaptiveCard, CardBlock, CompletionItem, CompletionResult, HubDialect, HubEvent, HubMessage,
    Throttling, RECORD_SEPARATOR,
};
pub use keepalive::{delay_to_boundary, HEARTBEAT_PERIOD};
pub use queue::{QueueDialect, QueueEvent, QueueOutput};
pub use socket::{FramedSocket, SocketCloser, SocketOptions};
pub use tchannel::{ChannelDialect, ChannelEvent, ChannelMessage};

use std::fmt;

/// Wire envelope and event decoding for one socket protocol
pub trait Dialect: Send + Sync + 'static {
    /// Typed event produced from inbound payloads
    type Event: fmt::Debug + Send + 'static;

    /// Short name used in log lines
    fn name(&self) -> &'static str;

    /// Raw frames sent right after the connection opens, before caller frames
    fn handshake(&self) -> Vec<String> {
        Vec::new()
    }

    /// Wrap a JSON value in the dialect envelope
    fn encode(&self, value: &serde_json::Value) -> String;

    /// Decode one inbound payload into zero or more events
    ///
    /// Frames that cannot be parsed are dropped here, never surfaced as errors.
    fn decode(&self, payload: &str) -> Vec<Self::Event>;

    /// Frame sent back immediately when `event` is a ping-type frame
    fn reply_to(&self, _event: &Self::Event) -> Option<String> {
        None
    }

    /// Liveness frame sent on every heartbeat boundary
    fn heartbeat(&self) -> Option<String> {
        None
    }
}
