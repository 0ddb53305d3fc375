//! Slack adapter over a scripted workspace client
//!
//! Polling runs on paused time, so the 2 s interval and 60 s budget elapse
//! instantly.

mod common;

use async_trait::async_trait;
use common::recording_observer;
use llmbot_config::SlackConfig;
use llmbot_relay::backends::{SlackBackend, SlackUser, ThreadMessage, WorkspaceClient};
use llmbot_relay::{ChatBackend, ChatRequest, RelayError, Result, NO_RESPONSE};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

// ============================================================================
// Helper Functions
// ============================================================================

#[derive(Default)]
struct Workspace {
    posts: Mutex<Vec<(String, Option<String>)>>,
    polls: Mutex<VecDeque<Result<Vec<ThreadMessage>>>>,
    next_ts: Mutex<u32>,
}

/// Fake client; the last scripted poll repeats once the script runs out
#[derive(Clone, Default)]
struct FakeWorkspace(Arc<Workspace>);

impl FakeWorkspace {
    fn script(&self, polls: Vec<Result<Vec<ThreadMessage>>>) {
        self.0.polls.lock().unwrap().extend(polls);
    }

    fn posts(&self) -> Vec<(String, Option<String>)> {
        self.0.posts.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkspaceClient for FakeWorkspace {
    async fn post_message(
        &self,
        _channel: &str,
        text: &str,
        thread_ts: Option<&str>,
    ) -> Result<String> {
        self.0
            .posts
            .lock()
            .unwrap()
            .push((text.to_string(), thread_ts.map(str::to_string)));
        let mut next = self.0.next_ts.lock().unwrap();
        *next += 100;
        Ok(format!("{}.000001", *next))
    }

    async fn replies(&self, _channel: &str, _thread_ts: &str) -> Result<Vec<ThreadMessage>> {
        let mut polls = self.0.polls.lock().unwrap();
        if polls.len() > 1 {
            return polls.pop_front().unwrap();
        }
        match polls.front() {
            Some(Ok(messages)) => Ok(messages.clone()),
            Some(Err(_)) => Err(RelayError::BackendUnavailable("scripted".into())),
            None => Ok(Vec::new()),
        }
    }

    async fn list_users(&self) -> Result<Vec<SlackUser>> {
        Ok(vec![
            SlackUser {
                id: "U1".into(),
                real_name: Some("Alice".into()),
                is_bot: false,
            },
            SlackUser {
                id: "U2".into(),
                real_name: Some("Claude".into()),
                is_bot: true,
            },
            SlackUser {
                id: "U3".into(),
                real_name: Some("Other bot".into()),
                is_bot: true,
            },
        ])
    }
}

fn message(text: &str, ts: &str, edited: bool) -> ThreadMessage {
    ThreadMessage {
        text: text.into(),
        ts: Some(ts.into()),
        edited: edited.then(|| serde_json::json!({ "user": "U2", "ts": ts })),
    }
}

fn backend(workspace: &FakeWorkspace) -> SlackBackend {
    let config = SlackConfig {
        channel: Some("C0123".into()),
        chatbot_name: Some("Claude".into()),
        ..Default::default()
    };
    SlackBackend::with_client(Box::new(workspace.clone()), &config).unwrap()
}

// ============================================================================
// TEST: Polling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reply_is_followed_until_typing_suffix_drops() {
    let workspace = FakeWorkspace::default();
    let root = message("<@U2> hello", "100.000001", false);
    workspace.script(vec![
        Ok(vec![root.clone()]),
        Ok(vec![root.clone(), message("Hel _Typing…_", "100.500000", true)]),
        Ok(vec![root.clone(), message("Hello world", "100.500000", true)]),
    ]);
    let mut slack = backend(&workspace);

    let (observer, seen) = recording_observer();
    let exchange = slack
        .send(ChatRequest::new("hello", "slack").with_observer(Some(observer)))
        .await
        .unwrap();

    assert_eq!(exchange.text, "Hello world");
    assert!(exchange.error.is_none());
    assert_eq!(*seen.lock().unwrap(), vec!["Hel", "Hello world"]);
    assert_eq!(slack.thread(), Some("100.000001"));
    assert_eq!(workspace.posts()[0], ("<@U2> hello".to_string(), None));
}

#[tokio::test(start_paused = true)]
async fn test_follow_up_posts_in_thread_and_skips_old_replies() {
    let workspace = FakeWorkspace::default();
    let old_reply = message("Hello world", "100.500000", true);
    workspace.script(vec![Ok(vec![old_reply.clone()])]);
    let mut slack = backend(&workspace);
    slack.send(ChatRequest::new("hello", "slack")).await.unwrap();

    workspace.0.polls.lock().unwrap().clear();
    workspace.script(vec![
        Ok(vec![old_reply.clone()]),
        Err(RelayError::BackendUnavailable("ratelimited".into())),
        Ok(vec![old_reply.clone(), message("Second answer", "200.500000", true)]),
    ]);
    let exchange = slack.send(ChatRequest::new("more", "slack")).await.unwrap();

    assert_eq!(exchange.text, "Second answer");
    let posts = workspace.posts();
    assert_eq!(posts[1], ("<@U2> more".to_string(), Some("100.000001".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_unfinished_reply_times_out() {
    let workspace = FakeWorkspace::default();
    workspace.script(vec![Ok(vec![])]);
    let mut slack = backend(&workspace);

    let exchange = slack.send(ChatRequest::new("hello", "slack")).await.unwrap();

    assert_eq!(exchange.text, NO_RESPONSE);
    assert!(exchange.error.is_some());
}
