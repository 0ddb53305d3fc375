//! Model names and the adapters serving them

use crate::backends::{
    BingBackend, ChatBackend, Gpt4Backend, GradioBackend, NetworkSettings, PoeBackend,
    SlackBackend, POE_MODELS,
};
use crate::error::{RelayError, Result};
use crate::imaging;
use llmbot_config::{PoeConfig, RelayConfig};
use std::collections::HashMap;
use tracing::{info, warn};

/// User-facing model names in listing order, with the adapter serving each
pub const MODELS: &[(&str, &str)] = &[
    ("bing", "bing"),
    ("slack", "slack"),
    ("chatgpt", "poe"),
    ("sage", "poe"),
    ("claude", "poe"),
    ("claude+", "poe"),
    ("qianlong", "poe"),
    ("midjourney", "poe"),
    ("gpt4", "gpt4"),
    ("gradio", "gradio"),
];

/// Adapter key for a model name
pub fn adapter_key(model: &str) -> Option<&'static str> {
    MODELS
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, key)| *key)
}

/// Whether `model` is a known model name
pub fn is_model(model: &str) -> bool {
    adapter_key(model).is_some()
}

enum Slot {
    Ready(Box<dyn ChatBackend>),
    Unconfigured(String),
}

/// Adapter instances keyed by adapter
///
/// Adapters that could not be built from configuration keep the reason, which
/// is reported when a prompt is routed to them.
pub struct BackendRegistry {
    slots: HashMap<&'static str, Slot>,
    poe: PoeConfig,
    network: NetworkSettings,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

impl BackendRegistry {
    /// Registry with every adapter unconfigured
    pub fn empty() -> Self {
        Self {
            slots: HashMap::new(),
            poe: PoeConfig::default(),
            network: NetworkSettings::default(),
        }
    }

    /// Install `backend` for adapter `key`
    pub fn with_backend(mut self, key: &'static str, backend: Box<dyn ChatBackend>) -> Self {
        self.slots.insert(key, Slot::Ready(backend));
        self
    }

    /// Every adapter the configuration allows
    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let network = NetworkSettings::from_config(&config.dispatcher);
        let mut registry = Self {
            slots: HashMap::new(),
            poe: config.poe.clone(),
            network: network.clone(),
        };

        let images = imaging::creator_for(config, &network)?;
        registry.install("bing", BingBackend::new(&config.bing, &network, images));
        registry.install("slack", SlackBackend::new(&config.slack, &network));
        match config.poe.cookie.as_deref() {
            Some(cookie) => {
                registry.install("poe", PoeBackend::new(cookie, &config.poe, &network));
            }
            None => {
                registry.slots.insert(
                    "poe",
                    Slot::Unconfigured("POE_COOKIE is not set; use /cookie <value>".to_string()),
                );
            }
        }
        registry.install("gpt4", Gpt4Backend::new(&config.gpt4, &network));
        registry.install("gradio", GradioBackend::new(&config.gradio, &network));

        Ok(registry)
    }

    fn install<B>(&mut self, key: &'static str, backend: Result<B>)
    where
        B: ChatBackend + 'static,
    {
        let slot = match backend {
            Ok(backend) => Slot::Ready(Box::new(backend)),
            Err(e) => {
                warn!(backend = key, error = %e, "backend unavailable");
                Slot::Unconfigured(e.to_string())
            }
        };
        self.slots.insert(key, slot);
    }

    /// Whether the adapter serving `model` is ready
    pub fn is_ready(&self, model: &str) -> bool {
        adapter_key(model)
            .and_then(|key| self.slots.get(key))
            .is_some_and(|slot| matches!(slot, Slot::Ready(_)))
    }

    /// Adapter serving `model`
    pub fn backend_mut(&mut self, model: &str) -> Result<&mut dyn ChatBackend> {
        let key = adapter_key(model)
            .ok_or_else(|| RelayError::Config(format!("No such model: {model}")))?;
        match self.slots.get_mut(key) {
            Some(Slot::Ready(backend)) => Ok(backend.as_mut()),
            Some(Slot::Unconfigured(reason)) => Err(RelayError::Config(reason.clone())),
            None => Err(RelayError::Config(format!("{model} is not configured"))),
        }
    }

    /// Replace the Poe adapter with one using `cookie` and bootstrap it
    pub async fn renew_poe(&mut self, cookie: &str) -> Result<()> {
        let mut poe = PoeBackend::new(cookie, &self.poe, &self.network)?;
        poe.start().await?;
        info!("poe adapter re-initialized with a new cookie");
        self.slots.insert("poe", Slot::Ready(Box::new(poe)));
        Ok(())
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.slots.keys().collect();
        keys.sort();
        f.debug_struct("BackendRegistry").field("slots", &keys).finish()
    }
}
