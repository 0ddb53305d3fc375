//! Shared fixtures for relay integration tests

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use llmbot_relay::Observer;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Record separator terminating hub frames
pub const RS: char = '\u{1e}';

/// Scripted WebSocket server
///
/// Serves one connection per script. When `marker` is set, the server first
/// reads client frames until one contains it, then sends the script and
/// closes. Resolves to every text frame the clients sent.
pub async fn socket_server(
    marker: Option<&'static str>,
    scripts: Vec<Vec<String>>,
) -> (String, JoinHandle<Vec<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let mut received = Vec::new();
        for frames in scripts {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            if let Some(marker) = marker {
                while let Some(Ok(message)) = ws.next().await {
                    if let Message::Text(text) = message {
                        let text = text.as_str().to_string();
                        let found = text.contains(marker);
                        received.push(text);
                        if found {
                            break;
                        }
                    }
                }
            }

            for frame in frames {
                ws.send(Message::Text(frame.into())).await.unwrap();
            }
            let _ = ws.close(None).await;
            let _ = tokio::time::timeout(Duration::from_secs(5), async {
                while let Some(Ok(_)) = ws.next().await {}
            })
            .await;
        }
        received
    });

    (url, handle)
}

/// Observer that records every text it is handed
pub fn recording_observer() -> (Observer, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer: Observer = Arc::new(move |text: &str| sink.lock().unwrap().push(text.to_string()));
    (observer, seen)
}

/// Hub update frame carrying one bot message
pub fn hub_update(text: &str) -> String {
    let frame = serde_json::json!({
        "type": 1,
        "target": "update",
        "arguments": [{ "messages": [{ "text": text, "author": "bot" }] }]
    });
    format!("{frame}{RS}")
}

/// Hub completion frame with usage counters
pub fn hub_completion(prompt: &str, answer: &str, used: u32, allowed: u32) -> String {
    let frame = serde_json::json!({
        "type": 2,
        "invocationId": "0",
        "item": {
            "messages": [
                { "text": prompt, "author": "user" },
                { "text": answer, "author": "bot" }
            ],
            "throttling": {
                "numUserMessagesInConversation": used,
                "maxNumUserMessagesInConversation": allowed
            },
            "result": { "value": "Success" }
        }
    });
    format!("{frame}{RS}")
}

/// Hub end-of-stream frame
pub fn hub_end() -> String {
    format!("{}{RS}", serde_json::json!({ "type": 3, "invocationId": "0" }))
}

/// Successful Bing conversation-create body
pub fn conversation_created(id: &str) -> serde_json::Value {
    serde_json::json!({
        "conversationId": id,
        "clientId": "client-1",
        "conversationSignature": "signature-1",
        "result": { "value": "Success", "message": null }
    })
}
