//! Per-dispatcher selection state

/// Selected model and its parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayContext {
    /// Model prompts are routed to when no override is given
    pub current_model: String,
    /// Gradio space, kept across switches to other models
    pub current_space: Option<String>,
}

impl RelayContext {
    /// Context starting on `model`
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            current_model: model.into(),
            current_space: None,
        }
    }

    /// Switch to `model`
    pub fn select(&mut self, model: &str) {
        self.current_model = model.to_string();
    }

    /// Human-readable selection, with the space for gradio
    pub fn describe(&self) -> String {
        match (&*self.current_model, &self.current_space) {
            ("gradio", Some(space)) => format!("gradio ({space})"),
            (model, _) => model.to_string(),
        }
    }
}

impl Default for RelayContext {
    fn default() -> Self {
        Self::new("bing")
    }
}
