//! Backend adapters
//!
//! One adapter per service. Each adapter owns its session state and is
//! driven exclusively by the dispatcher while the dispatcher holds the turn,
//! so `send` takes `&mut self`.

pub mod bing;
pub mod gpt4;
pub mod gradio;
pub mod poe;
pub mod slack;

pub use bing::BingBackend;
pub use gpt4::Gpt4Backend;
pub use gradio::GradioBackend;
pub use poe::{PoeBackend, POE_MODELS};
pub use slack::{SlackBackend, SlackWebClient, SlackUser, ThreadMessage, WorkspaceClient};

use crate::bootstrap::RetryPolicy;
use crate::error::{RelayError, Result};
use crate::reconciler::{ChatExchange, Observer};
use crate::transport::SocketOptions;
use async_trait::async_trait;
use llmbot_config::DispatcherConfig;
use tokio_util::sync::CancellationToken;

/// Browser user agent presented to every service
pub const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36 Edg/114.0.1823.43";

/// One prompt routed to a backend
#[derive(Clone)]
pub struct ChatRequest {
    /// Prompt text
    pub prompt: String,
    /// User-facing model name the request was routed by
    pub model: String,
    /// Backend-specific parameter (the Gradio space)
    pub param: Option<String>,
    /// Receives the full text on every change
    pub observer: Option<Observer>,
    /// Aborts the exchange where the backend supports it
    pub cancel: CancellationToken,
}

impl ChatRequest {
    /// Request for `model` without observer or parameter
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            param: None,
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Set the backend parameter
    pub fn with_param(mut self, param: Option<String>) -> Self {
        self.param = param;
        self
    }

    /// Set the observer
    pub fn with_observer(mut self, observer: Option<Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Set the cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for ChatRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatRequest")
            .field("prompt", &self.prompt)
            .field("model", &self.model)
            .field("param", &self.param)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// A chat service the dispatcher can route prompts to
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Adapter key, used in logs
    fn name(&self) -> &str;

    /// Run one exchange to completion
    async fn send(&mut self, request: ChatRequest) -> Result<ChatExchange>;
}

/// Networking shared by every adapter
#[derive(Debug, Clone, Default)]
pub struct NetworkSettings {
    /// HTTP(S) proxy
    pub proxy: Option<String>,
    /// Socket handshake settings
    pub socket: SocketOptions,
    /// Bootstrap retry policy
    pub retry: RetryPolicy,
}

impl NetworkSettings {
    /// Settings described by the dispatcher section
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            proxy: config.proxy.clone(),
            socket: SocketOptions {
                connect_timeout: config.connect_timeout(),
                proxy: config.proxy.clone(),
            },
            retry: RetryPolicy::from_config(config),
        }
    }

    /// HTTP client following redirects
    pub fn http_client(&self) -> Result<reqwest::Client> {
        self.builder()?.build().map_err(RelayError::from)
    }

    /// HTTP client exposing redirect responses to the caller
    pub fn http_client_without_redirects(&self) -> Result<reqwest::Client> {
        self.builder()?
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(RelayError::from)
    }

    fn builder(&self) -> Result<reqwest::ClientBuilder> {
        let builder = reqwest::Client::builder().user_agent(USER_AGENT);
        // HTTP_PROXY already reached us through the config overlay
        match &self.proxy {
            Some(proxy) => {
                let proxy = reqwest::Proxy::all(proxy)
                    .map_err(|e| RelayError::Config(format!("invalid proxy {proxy}: {e}")))?;
                Ok(builder.proxy(proxy))
            }
            None => Ok(builder.no_proxy()),
        }
    }
}
