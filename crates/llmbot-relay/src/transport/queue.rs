//! Gradio queue dialect: one JSON object per message, tagged by `msg`

use super::Dialect;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

/// Output block of a generating or completed frame
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct QueueOutput {
    /// One entry per output component
    #[serde(default)]
    pub data: Vec<Value>,
    /// Server-side failure description
    #[serde(default)]
    pub error: Option<String>,
}

/// Queue frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum QueueEvent {
    /// Server asks which function and session the socket belongs to
    SendHash,
    /// Server is ready for the input payload
    SendData,
    /// Position in the queue
    Estimation {
        /// Zero-based rank
        #[serde(default)]
        rank: Option<i64>,
        /// Queue length
        #[serde(default)]
        queue_size: Option<i64>,
        /// Expected wait in seconds
        #[serde(default)]
        rank_eta: Option<f64>,
    },
    /// The job left the queue
    ProcessStarts,
    /// Intermediate output
    ProcessGenerating {
        /// Output so far
        #[serde(default)]
        output: QueueOutput,
        /// Whether the step succeeded
        #[serde(default)]
        success: Option<bool>,
    },
    /// Final output
    ProcessCompleted {
        /// Final output
        #[serde(default)]
        output: QueueOutput,
        /// Whether the job succeeded
        #[serde(default)]
        success: Option<bool>,
    },
    /// Queue rejected the job
    QueueFull,
    /// Any frame kind not listed above
    #[serde(other)]
    Other,
}

/// JSON-per-message dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDialect;

impl Dialect for QueueDialect {
    type Event = QueueEvent;

    fn name(&self) -> &'static str {
        "queue"
    }

    fn encode(&self, value: &Value) -> String {
        value.to_string()
    }

    fn decode(&self, payload: &str) -> Vec<QueueEvent> {
        match serde_json::from_str(payload) {
            Ok(event) => vec![event],
            Err(e) => {
                debug!(error = %e, "dropping malformed queue frame");
                Vec::new()
            }
        }
    }
}
