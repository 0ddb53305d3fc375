//! Bing adapter against a mocked conversation endpoint and a scripted hub
//!
//! Conversation creation is served by wiremock, the ChatHub socket by an
//! in-process tokio-tungstenite server.

mod common;

use common::{
    conversation_created, hub_completion, hub_end, hub_update, recording_observer, socket_server,
};
use llmbot_config::BingConfig;
use llmbot_relay::backends::bing::CONVERSATION_CLOSED_NOTE;
use llmbot_relay::backends::BingBackend;
use llmbot_relay::bootstrap::RetryPolicy;
use llmbot_relay::{ChatBackend, ChatRequest, NetworkSettings, RelayError, NO_RESPONSE};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Helper Functions
// ============================================================================

fn network() -> NetworkSettings {
    NetworkSettings {
        retry: RetryPolicy {
            backoff: Duration::from_millis(10),
            max_attempts: Some(5),
        },
        ..Default::default()
    }
}

fn backend(server: &MockServer, hub_url: &str) -> BingBackend {
    let config = BingConfig {
        conversation_url: Some(format!("{}/conversation/create", server.uri())),
        chathub_url: Some(hub_url.to_string()),
        ..Default::default()
    };
    BingBackend::new(&config, &network(), None).unwrap()
}

async fn conversation_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/conversation/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(conversation_created("conv-1")))
        .expect(1)
        .mount(&server)
        .await;
    server
}

fn invocations(received: &[String]) -> Vec<&String> {
    received
        .iter()
        .filter(|frame| frame.contains("\"target\":\"chat\""))
        .collect()
}

// ============================================================================
// TEST: Streaming and session reuse
// ============================================================================

#[tokio::test]
async fn test_hello_streams_and_reuses_conversation() {
    let server = conversation_server().await;
    let (hub_url, hub) = socket_server(
        Some("\"target\":\"chat\""),
        vec![
            vec![
                hub_update("Hel"),
                hub_update("Hello there"),
                hub_completion("hello", "Hello there!", 1, 20),
                hub_end(),
            ],
            vec![hub_completion("again", "Still here.", 2, 20), hub_end()],
        ],
    )
    .await;
    let mut bing = backend(&server, &hub_url);

    let (observer, seen) = recording_observer();
    let exchange = bing
        .send(ChatRequest::new("hello", "bing").with_observer(Some(observer)))
        .await
        .unwrap();

    assert_eq!(exchange.text, "Hello there!");
    assert!(exchange.terminal);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["Hel", "Hello there", "Hello there!"]
    );
    let session = bing.session().expect("conversation kept");
    assert_eq!(session.conversation_id, "conv-1");
    assert_eq!(session.turn_counter, 1);

    let exchange = bing.send(ChatRequest::new("again", "bing")).await.unwrap();
    assert_eq!(exchange.text, "Still here.");

    let received = hub.await.unwrap();
    let sent = invocations(&received);
    assert_eq!(sent.len(), 2);
    assert!(sent[0].contains("\"isStartOfSession\":true"));
    assert!(sent[0].contains("\"invocationId\":\"0\""));
    assert!(sent[1].contains("\"isStartOfSession\":false"));
    assert!(sent[1].contains("\"invocationId\":\"1\""));
    assert!(received[0].starts_with("{\"protocol\":\"json\",\"version\":1}"));
}

// ============================================================================
// TEST: Conversation end
// ============================================================================

#[tokio::test]
async fn test_quota_exhaustion_clears_session() {
    let server = conversation_server().await;
    let (hub_url, _hub) = socket_server(
        Some("\"target\":\"chat\""),
        vec![vec![hub_completion("hello", "Last answer", 20, 20), hub_end()]],
    )
    .await;
    let mut bing = backend(&server, &hub_url);

    let exchange = bing.send(ChatRequest::new("hello", "bing")).await.unwrap();

    assert!(exchange.conversation_ended);
    assert_eq!(exchange.text, format!("Last answer{CONVERSATION_CLOSED_NOTE}"));
    assert!(exchange.conversation.is_none());
    assert!(bing.session().is_none());
}

#[tokio::test]
async fn test_closed_stream_without_content_is_no_response() {
    let server = conversation_server().await;
    let (hub_url, _hub) = socket_server(Some("\"target\":\"chat\""), vec![vec![]]).await;
    let mut bing = backend(&server, &hub_url);

    let exchange = bing.send(ChatRequest::new("hello", "bing")).await.unwrap();

    assert_eq!(exchange.text, format!("{NO_RESPONSE}{CONVERSATION_CLOSED_NOTE}"));
    assert!(exchange.conversation.is_none());
    assert!(bing.session().is_none());
}

#[tokio::test]
async fn test_zero_allotment_ends_conversation() {
    let server = conversation_server().await;
    let (hub_url, _hub) = socket_server(
        Some("\"target\":\"chat\""),
        vec![vec![hub_completion("hello", "Out of turns", 0, 0), hub_end()]],
    )
    .await;
    let mut bing = backend(&server, &hub_url);

    let exchange = bing.send(ChatRequest::new("hello", "bing")).await.unwrap();

    assert!(exchange.conversation_ended);
    assert_eq!(exchange.text, format!("Out of turns{CONVERSATION_CLOSED_NOTE}"));
    assert!(bing.session().is_none());
}

// ============================================================================
// TEST: Bootstrap
// ============================================================================

#[tokio::test]
async fn test_transient_bootstrap_failure_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/conversation/create"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/conversation/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(conversation_created("conv-2")))
        .expect(1)
        .mount(&server)
        .await;
    let (hub_url, _hub) = socket_server(
        Some("\"target\":\"chat\""),
        vec![vec![hub_completion("hello", "Recovered", 1, 20), hub_end()]],
    )
    .await;
    let mut bing = backend(&server, &hub_url);

    let exchange = bing.send(ChatRequest::new("hello", "bing")).await.unwrap();

    assert_eq!(exchange.text, "Recovered");
    assert_eq!(bing.session().unwrap().conversation_id, "conv-2");
}

#[tokio::test]
async fn test_unauthorized_bootstrap_fails_fast() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/conversation/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": { "value": "UnauthorizedRequest", "message": "Sorry, you need to login first" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    let mut bing = backend(&server, "ws://127.0.0.1:9");

    let err = bing
        .send(ChatRequest::new("hello", "bing"))
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::Auth(_)), "{err:?}");
}
