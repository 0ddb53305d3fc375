//! Single entry point of the relay
//!
//! [`Dispatcher::chat`] serializes every call through one [`TurnGate`],
//! answers slash commands itself and routes everything else to the adapter
//! of the selected model. It never fails: errors come back as text.

use crate::backends::ChatRequest;
use crate::command::SlashCommand;
use crate::context::RelayContext;
use crate::error::Result;
use crate::reconciler::{Observer, NO_RESPONSE};
use crate::registry::{self, BackendRegistry, MODELS};
use crate::turn::TurnGate;
use llmbot_config::RelayConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Reply to an empty prompt
pub const PRESENCE: &str = "I'm here";
/// Reply to a gradio selection without a space
pub const GRADIO_NEEDS_SPACE: &str = "Gradio requires a space address";
/// Reply to a malformed command
pub const INVALID_COMMAND: &str = "Invalid command";

/// Per-call options
#[derive(Clone, Default)]
pub struct ChatOptions {
    /// Model for this call only
    pub model: Option<String>,
    /// Receives the full text on every change
    pub on_message: Option<Observer>,
    /// Aborts the call on backends that support it
    pub abort: Option<CancellationToken>,
}

impl ChatOptions {
    /// Route this call to `model`
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Stream updates to `observer`
    pub fn on_message(mut self, observer: Observer) -> Self {
        self.on_message = Some(observer);
        self
    }

    /// Abort through `token`
    pub fn abort(mut self, token: CancellationToken) -> Self {
        self.abort = Some(token);
        self
    }
}

/// State owned by the turn
#[derive(Debug)]
pub struct RelayState {
    /// Current selection
    pub context: RelayContext,
    /// Adapters
    pub registry: BackendRegistry,
}

/// Serializing router over the configured backends
pub struct Dispatcher {
    gate: TurnGate<RelayState>,
    spaces: Vec<String>,
}

impl Dispatcher {
    /// Dispatcher with every adapter the configuration allows
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let registry = BackendRegistry::from_config(config)?;
        Ok(Self::with_registry(registry, config))
    }

    /// Dispatcher over a prepared registry
    pub fn with_registry(registry: BackendRegistry, config: &RelayConfig) -> Self {
        let mut model = config.dispatcher.default_model();
        if !registry::is_model(&model) {
            warn!(%model, "unknown default model, falling back to bing");
            model = "bing".to_string();
        }
        let state = RelayState {
            context: RelayContext::new(model),
            registry,
        };
        Self {
            gate: TurnGate::new(state, config.dispatcher.turn_timeout()),
            spaces: config.gradio.spaces(),
        }
    }

    /// Current selection
    pub async fn context(&self) -> RelayContext {
        self.gate.acquire().await.context.clone()
    }

    /// Answer `prompt`
    pub async fn chat(&self, prompt: &str, options: ChatOptions) -> String {
        if prompt.trim().is_empty() {
            return PRESENCE.to_string();
        }
        if let Some(model) = options.model.as_deref() {
            if !registry::is_model(model) {
                return format!("No such model: {model}");
            }
        }

        let mut turn = self.gate.acquire().await;

        if let Some(command) = SlashCommand::parse(prompt, registry::is_model) {
            info!(?command, "slash command");
            return self.command(&mut turn, command).await;
        }

        let state = &mut *turn;
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| state.context.current_model.clone());
        let param = if model == "gradio" {
            match &state.context.current_space {
                Some(space) => Some(space.clone()),
                None => return GRADIO_NEEDS_SPACE.to_string(),
            }
        } else {
            None
        };

        let backend = match state.registry.backend_mut(&model) {
            Ok(backend) => backend,
            Err(e) => {
                error!(%model, error = %e, "no backend for model");
                return e.to_string();
            }
        };

        let request = ChatRequest::new(prompt, &model)
            .with_param(param)
            .with_observer(options.on_message.clone())
            .with_cancel(options.abort.clone().unwrap_or_default());
        info!(%model, backend = backend.name(), "routing prompt");

        let outcome = match self.gate.limit() {
            Some(limit) => match tokio::time::timeout(limit, backend.send(request)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(%model, ?limit, "backend held the turn too long, abandoning call");
                    return format!("Timed out after {}s waiting for {model}", limit.as_secs());
                }
            },
            None => backend.send(request).await,
        };

        match outcome {
            Ok(exchange) => match exchange.error {
                Some(reason) if exchange.text == NO_RESPONSE => {
                    warn!(%model, %reason, "exchange failed without text");
                    reason
                }
                Some(reason) => {
                    warn!(%model, %reason, "exchange ended with an error");
                    exchange.text
                }
                None => exchange.text,
            },
            Err(e) => {
                error!(%model, error = %e, "chat failed");
                e.to_string()
            }
        }
    }

    async fn command(&self, state: &mut RelayState, command: SlashCommand) -> String {
        match command {
            SlashCommand::List => {
                let commands: Vec<String> =
                    MODELS.iter().map(|(name, _)| format!("/use {name}")).collect();
                format!("Available AI commands:\n\n{}", commands.join("\n"))
            }
            SlashCommand::Current => format!("Currently using {}", state.context.describe()),
            SlashCommand::Cookie(cookie) => match state.registry.renew_poe(&cookie).await {
                Ok(()) => "Cookie updated".to_string(),
                Err(e) => {
                    error!(error = %e, "cookie update failed");
                    e.to_string()
                }
            },
            SlashCommand::Use { model, param } => {
                if !registry::is_model(&model) {
                    return format!(
                        "No AI named {model}; the current AI is {}",
                        state.context.current_model
                    );
                }
                if model == "gradio" {
                    let Some(space) = param
                        .map(|space| self.resolve_space(space))
                        .or_else(|| state.context.current_space.clone())
                    else {
                        return GRADIO_NEEDS_SPACE.to_string();
                    };
                    state.context.current_space = Some(space);
                }
                state.context.select(&model);
                format!("Switched AI to {}", state.context.describe())
            }
            SlashCommand::Invalid => INVALID_COMMAND.to_string(),
        }
    }

    /// Configured space for a numeric parameter, else the parameter itself
    fn resolve_space(&self, space: String) -> String {
        space
            .parse::<usize>()
            .ok()
            .and_then(|index| self.spaces.get(index).cloned())
            .unwrap_or(space)
    }
}
