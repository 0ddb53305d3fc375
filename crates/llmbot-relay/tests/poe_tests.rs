//! Poe adapter against mocked settings/GraphQL endpoints and a scripted
//! update channel

mod common;

use common::{recording_observer, socket_server};
use llmbot_config::PoeConfig;
use llmbot_relay::backends::PoeBackend;
use llmbot_relay::{ChatBackend, ChatRequest, NetworkSettings, NO_RESPONSE};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Helper Functions
// ============================================================================

/// Prompt send time in microseconds
const SENT_AT: i64 = 1_700_000_000_000_000;

async fn poe_server(send_response: serde_json::Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/settings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "formkey": "fk-1",
            "tchannelData": {
                "channel": "poe-chan",
                "boxName": "box1",
                "minSeq": 42,
                "channelHash": "hash-1"
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/gql_POST"))
        .and(body_string_contains("subscriptionsMutation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": {} })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/gql_POST"))
        .and(body_string_contains("ChatViewQuery"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": { "chatOfBot": { "chatId": 7 } } })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/gql_POST"))
        .and(body_string_contains("sendMessageMutation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(send_response))
        .mount(&server)
        .await;
    server
}

fn accepted() -> serde_json::Value {
    json!({
        "data": {
            "messageEdgeCreate": {
                "message": {
                    "node": {
                        "messageId": 100,
                        "author": "human",
                        "creationTime": SENT_AT,
                        "state": "complete",
                        "text": "hello"
                    }
                },
                "status": "success"
            }
        }
    })
}

fn message_added(text: &str, state: &str, author: &str, creation_time: i64) -> String {
    let inner = json!({
        "message_type": "subscriptionUpdate",
        "payload": {
            "subscription_name": "messageAdded",
            "data": {
                "messageAdded": {
                    "messageId": 101,
                    "text": text,
                    "state": state,
                    "author": author,
                    "creationTime": creation_time
                }
            }
        }
    });
    json!({ "messages": [inner.to_string()], "min_seq": 43 }).to_string()
}

fn backend(server: &MockServer, socket_url: &str) -> PoeBackend {
    let config = PoeConfig {
        base_url: Some(server.uri()),
        socket_url: Some(socket_url.to_string()),
        ..Default::default()
    };
    PoeBackend::new("cookie-value", &config, &NetworkSettings::default()).unwrap()
}

// ============================================================================
// TEST: Exchange
// ============================================================================

#[tokio::test]
async fn test_send_streams_bot_reply_and_ignores_noise() {
    let server = poe_server(accepted()).await;
    let (socket_url, _channel) = socket_server(
        None,
        vec![vec![
            message_added("stale answer from before", "complete", "chinchilla", SENT_AT - 5_000_000),
            message_added("hello", "complete", "human", SENT_AT),
            message_added("Hi", "incomplete", "chinchilla", SENT_AT + 1_000),
            message_added("Hi there", "complete", "chinchilla", SENT_AT + 2_000),
        ]],
    )
    .await;
    let mut poe = backend(&server, &socket_url);

    let (observer, seen) = recording_observer();
    let exchange = poe
        .send(ChatRequest::new("hello", "chatgpt").with_observer(Some(observer)))
        .await
        .unwrap();

    assert!(poe.is_started());
    assert_eq!(exchange.text, "Hi there");
    assert_eq!(*seen.lock().unwrap(), vec!["Hi", "Hi there"]);
}

#[tokio::test]
async fn test_missing_message_reports_rate_limit() {
    let server = poe_server(json!({ "data": { "messageEdgeCreate": { "message": null } } })).await;
    let (socket_url, _channel) = socket_server(None, vec![vec![]]).await;
    let mut poe = backend(&server, &socket_url);

    let exchange = poe.send(ChatRequest::new("hello", "claude")).await.unwrap();

    assert_eq!(exchange.text, "claude Rate limit exceeded.");
}

#[tokio::test]
async fn test_channel_closing_without_reply_is_no_response() {
    let server = poe_server(accepted()).await;
    let (socket_url, _channel) = socket_server(None, vec![vec![]]).await;
    let mut poe = backend(&server, &socket_url);

    let exchange = poe.send(ChatRequest::new("hello", "sage")).await.unwrap();

    assert_eq!(exchange.text, NO_RESPONSE);
}
