//! GPT-4 through a liaobots-style proxy
//!
//! The proxy hands out an auth code with a usage quota, then streams plain
//! text for each chat call. The conversation lives client side, so the
//! adapter keeps a bounded history and replays it on every turn.

use super::{ChatBackend, ChatRequest, NetworkSettings};
use crate::bootstrap::status_error;
use crate::error::{RelayError, Result};
use crate::reconciler::{ChatExchange, Fragment, Reconciler};
use async_trait::async_trait;
use futures::StreamExt;
use llmbot_config::Gpt4Config;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

/// Returned in place of an answer when the proxy rejects the chat call
pub const RETRY_TEXT: &str = "Request failed, please retry";

const SYSTEM_PROMPT: &str =
    "You are GPT4, a large language model trained by OpenAI. Follow the user's instructions carefully.";

/// One turn of replayed history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// `user` or `assistant`
    pub role: String,
    /// Turn text
    pub content: String,
}

impl HistoryEntry {
    fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserGrant {
    #[serde(default)]
    amount: Option<f64>,
    #[serde(default)]
    auth_code: Option<String>,
}

/// Longest prefix of `bytes` that is complete UTF-8
fn complete_utf8(bytes: &[u8]) -> &str {
    match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => std::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default(),
    }
}

/// GPT-4 backend
pub struct Gpt4Backend {
    client: reqwest::Client,
    base_url: String,
    auth_code: Option<String>,
    history: Vec<HistoryEntry>,
    history_limit: usize,
}

impl Gpt4Backend {
    /// Backend for the configured proxy
    pub fn new(config: &Gpt4Config, network: &NetworkSettings) -> Result<Self> {
        Ok(Self {
            client: network.http_client()?,
            base_url: config.base_url().trim_end_matches('/').to_string(),
            auth_code: config.auth_code.clone().filter(|code| !code.is_empty()),
            history: Vec::new(),
            history_limit: config.history_limit(),
        })
    }

    /// Replayed history, oldest first
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    async fn auth_code(&mut self) -> Result<String> {
        if let Some(code) = &self.auth_code {
            return Ok(code.clone());
        }

        let response = self
            .client
            .post(format!("{}/api/user", self.base_url))
            .json(&json!({ "authcode": "" }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), "gpt4 auth code"));
        }
        let grant: UserGrant = response.json().await?;

        let code = grant
            .auth_code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| RelayError::Auth("gpt4 proxy issued no auth code".to_string()))?;
        if grant.amount.unwrap_or(0.0) <= 0.0 {
            return Err(RelayError::BackendUnavailable(
                "gpt4 proxy quota is exhausted".to_string(),
            ));
        }
        info!(amount = ?grant.amount, "obtained gpt4 auth code");
        self.auth_code = Some(code.clone());
        Ok(code)
    }

    fn remember(&mut self, prompt: &str, answer: &str) {
        self.history.push(HistoryEntry::user(prompt));
        self.history.push(HistoryEntry::assistant(answer));
        let excess = self.history.len().saturating_sub(self.history_limit);
        self.history.drain(..excess);
    }
}

#[async_trait]
impl ChatBackend for Gpt4Backend {
    fn name(&self) -> &str {
        "gpt4"
    }

    async fn send(&mut self, request: ChatRequest) -> Result<ChatExchange> {
        let code = self.auth_code().await?;

        let mut messages = self.history.clone();
        messages.push(HistoryEntry::user(&request.prompt));
        let body = json!({
            "conversationId": "",
            "model": {
                "id": "gpt-4-0613",
                "name": "GPT-4",
                "maxLength": 24000,
                "tokenLimit": 8000
            },
            "messages": messages,
            "key": "",
            "prompt": SYSTEM_PROMPT
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .header("x-auth-code", &code)
            .header("Referer", format!("{}/zh", self.base_url))
            .json(&body)
            .send()
            .await?;
        if response.status() != reqwest::StatusCode::OK {
            warn!(status = %response.status(), "gpt4 chat rejected, dropping auth code");
            self.auth_code = None;
            return Ok(ChatExchange::finished(&request.prompt, RETRY_TEXT));
        }

        let mut reconciler = Reconciler::new(ChatExchange::new(&request.prompt), request.observer.clone());
        let mut buffer: Vec<u8> = Vec::new();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = request.cancel.cancelled() => {
                    return Err(RelayError::Cancelled("request aborted".to_string()));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            buffer.extend_from_slice(&chunk?);
            reconciler.apply(Fragment::partial(complete_utf8(&buffer)));
        }

        let text = String::from_utf8_lossy(&buffer).into_owned();
        debug!(chars = text.len(), "gpt4 stream ended");
        reconciler.apply(Fragment::complete(Some(text)));
        let exchange = reconciler.finish();
        if exchange.error.is_none() {
            self.remember(&request.prompt, &exchange.text);
        }
        Ok(exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn backend(server: &MockServer, history_limit: usize) -> Gpt4Backend {
        let config = Gpt4Config {
            base_url: Some(server.uri()),
            history_limit: Some(history_limit),
            ..Default::default()
        };
        Gpt4Backend::new(&config, &NetworkSettings::default()).unwrap()
    }

    #[test]
    fn test_complete_utf8_stops_at_split_char() {
        let bytes = "héllo".as_bytes();
        assert_eq!(complete_utf8(&bytes[..2]), "h");
        assert_eq!(complete_utf8(bytes), "héllo");
    }

    #[tokio::test]
    async fn test_chat_streams_and_keeps_history() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/user"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"amount": 5, "authCode": "abc"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(header("x-auth-code", "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Hello there"))
            .mount(&server)
            .await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut gpt4 = backend(&server, 2);
        let request = ChatRequest::new("hi", "gpt4")
            .with_observer(Some(Arc::new(move |text: &str| sink.lock().unwrap().push(text.to_string()))));

        let exchange = gpt4.send(request).await.unwrap();
        assert_eq!(exchange.text, "Hello there");
        assert_eq!(seen.lock().unwrap().last().map(String::as_str), Some("Hello there"));

        gpt4.send(ChatRequest::new("again", "gpt4")).await.unwrap();
        let history = gpt4.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0], HistoryEntry::user("again"));
    }

    #[tokio::test]
    async fn test_rejected_chat_clears_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(402))
            .mount(&server)
            .await;

        let mut gpt4 = backend(&server, 6);
        gpt4.auth_code = Some("stale".to_string());
        let exchange = gpt4.send(ChatRequest::new("hi", "gpt4")).await.unwrap();
        assert_eq!(exchange.text, RETRY_TEXT);
        assert!(gpt4.auth_code.is_none());
        assert!(gpt4.history().is_empty());
    }

    #[tokio::test]
    async fn test_empty_quota_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/user"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"amount": 0, "authCode": "abc"})),
            )
            .mount(&server)
            .await;

        let mut gpt4 = backend(&server, 6);
        let err = gpt4.send(ChatRequest::new("hi", "gpt4")).await.unwrap_err();
        assert!(matches!(err, RelayError::BackendUnavailable(_)));
    }
}
