//! Hosted Gradio demos driven through their queue socket
//!
//! A space is resolved to its Gradio endpoint, the app config is read to find
//! the function behind the chat submit button, and the prompt is pushed
//! through `queue/join`.

use super::{ChatBackend, ChatRequest, NetworkSettings};
use crate::error::{RelayError, Result};
use crate::html;
use crate::reconciler::{ChatExchange, Fragment, Observer, Reconciler};
use crate::transport::{FramedSocket, QueueDialect, QueueEvent, SocketOptions};
use async_trait::async_trait;
use llmbot_config::GradioConfig;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

static MODELSCOPE_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/studios/([^/]+)/([^/]+)/").unwrap());
static HUGGINGFACE_PATH: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/spaces/([^/]+)/([^/]+)").unwrap());
static IFRAME_SRC: Lazy<Regex> = Lazy::new(|| Regex::new(r#"<iframe src="([^"]+)""#).unwrap());

/// UI component from the app config
#[derive(Debug, Clone, Deserialize)]
pub struct Component {
    /// Component id
    pub id: i64,
    /// `textbox`, `chatbot`, `button`, ...
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Component properties (`value`, `visible`, ...)
    #[serde(default)]
    pub props: Value,
    /// Set on components that accept example input
    #[serde(default)]
    pub example_input: Option<Value>,
}

impl Component {
    fn default_value(&self) -> Value {
        self.props.get("value").cloned().unwrap_or(Value::Null)
    }
}

/// Event wiring from the app config
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Dependency {
    /// Components whose events trigger the function; plain ids or `[id, event]`
    #[serde(default)]
    pub targets: Vec<Value>,
    /// `submit`, `click`, `then`, ...
    #[serde(default)]
    pub trigger: Option<String>,
    /// Input component ids
    #[serde(default)]
    pub inputs: Vec<i64>,
    /// Output component ids
    #[serde(default)]
    pub outputs: Vec<i64>,
    /// Runs Python on the server
    #[serde(default)]
    pub backend_fn: bool,
}

impl Dependency {
    fn target_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.targets.iter().filter_map(|target| match target {
            Value::Number(id) => id.as_i64(),
            Value::Array(pair) => pair.first().and_then(Value::as_i64),
            _ => None,
        })
    }

    fn targets_component(&self, id: i64) -> bool {
        self.target_ids().any(|target| target == id)
    }
}

/// The parts of `/config` the relay needs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Components
    #[serde(default)]
    pub components: Vec<Component>,
    /// Event wiring, indexed by `fn_index`
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// Function bound to the `Submit` button, else the first backend function
/// fired by `trigger`
pub fn find_submit_by_trigger(config: &AppConfig, trigger: &str) -> Option<usize> {
    let submit_button = config
        .components
        .iter()
        .find(|c| c.kind == "button" && c.props.get("value").and_then(Value::as_str) == Some("Submit"))
        .map(|c| c.id);
    if let Some(index) = submit_button
        .and_then(|id| config.dependencies.iter().position(|dep| dep.targets_component(id)))
    {
        return Some(index);
    }
    config.dependencies.iter().position(|dep| {
        !dep.inputs.is_empty()
            && !dep.outputs.is_empty()
            && dep.backend_fn
            && dep.trigger.as_deref() == Some(trigger)
    })
}

/// Function bound to the first button
pub fn find_submit_by_button(config: &AppConfig) -> Option<usize> {
    let button = config.components.iter().find(|c| c.kind == "button")?;
    config
        .dependencies
        .iter()
        .position(|dep| dep.targets_component(button.id))
}

/// Function to call for a chat prompt
pub fn find_submit(config: &AppConfig) -> Option<usize> {
    find_submit_by_trigger(config, "submit").or_else(|| {
        find_submit_by_button(config)
            .into_iter()
            .chain(find_submit_by_trigger(config, "click"))
            .max()
    })
}

/// Input payload for one queued call
#[derive(Debug, Clone, PartialEq)]
pub struct JobInputs {
    /// One value per input component
    pub data: Vec<Value>,
    /// Where the prompt goes
    pub text_index: usize,
    /// Output slot holding the chatbot, when known
    pub output_index: Option<usize>,
}

/// Default inputs for `fn_index`, with the chat history reset
pub fn parse_inputs(config: &AppConfig, fn_index: usize, skip_text: bool) -> Result<JobInputs> {
    let dependency = config
        .dependencies
        .get(fn_index)
        .ok_or_else(|| RelayError::Protocol(format!("no function {fn_index} in space config")))?;
    let component = |id: i64| config.components.iter().find(|c| c.id == id);
    let chatbot = config.components.iter().find(|c| {
        c.kind == "chatbot" && c.props.get("visible").and_then(Value::as_bool).unwrap_or(true)
    });

    let mut data: Vec<Value> = dependency
        .inputs
        .iter()
        .map(|id| component(*id).map(Component::default_value).unwrap_or(Value::Null))
        .collect();
    let output_index = chatbot.and_then(|bot| dependency.outputs.iter().position(|id| *id == bot.id));

    let text_index = if skip_text {
        Some(0)
    } else {
        dependency
            .target_ids()
            .next()
            .and_then(|target| dependency.inputs.iter().position(|id| *id == target))
            .or_else(|| {
                dependency.inputs.iter().position(|id| {
                    component(*id).is_some_and(|c| c.kind == "textbox" || c.example_input.is_some())
                })
            })
    };
    let text_index =
        text_index.ok_or_else(|| RelayError::Protocol("space has no text input".to_string()))?;

    if let Some(history) =
        chatbot.and_then(|bot| dependency.inputs.iter().position(|id| *id == bot.id))
    {
        data[history] = json!([]);
    }

    Ok(JobInputs {
        data,
        text_index,
        output_index,
    })
}

fn last_leaf(value: &Value) -> &Value {
    match value {
        Value::Array(items) => items.last().map(last_leaf).unwrap_or(value),
        other => other,
    }
}

/// Chat text inside a job's output data
pub fn extract_message(data: &[Value], output_index: Option<usize>) -> String {
    let index = output_index
        .or_else(|| data.iter().position(|row| row.to_string().contains('<')))
        .unwrap_or_else(|| data.len().saturating_sub(1));
    match data.get(index).map(last_leaf) {
        Some(Value::String(text)) => html::to_text(text),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn socket_url(endpoint: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("wss://{base}")
    };
    format!("{base}/queue/join")
}

/// Gradio backend
pub struct GradioBackend {
    client: reqwest::Client,
    spaces: Vec<String>,
    session_hash: String,
    socket: SocketOptions,
}

impl GradioBackend {
    /// Backend with the configured space list
    pub fn new(config: &GradioConfig, network: &NetworkSettings) -> Result<Self> {
        let session_hash = config
            .session_hash
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..11].to_string());
        Ok(Self {
            client: network.http_client()?,
            spaces: config.spaces(),
            session_hash,
            socket: network.socket.clone(),
        })
    }

    /// Space URL for a parameter that may be an index into the space list
    pub fn space_url(&self, space: &str) -> Result<String> {
        match space.parse::<usize>() {
            Ok(index) => self
                .spaces
                .get(index)
                .cloned()
                .ok_or_else(|| RelayError::Config(format!("no configured space #{index}"))),
            Err(_) => Ok(space.to_string()),
        }
    }

    /// Gradio endpoint behind a space page URL
    pub async fn resolve_endpoint(&self, url: &str) -> Result<String> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| RelayError::Config(format!("invalid space url {url}: {e}")))?;
        match parsed.host_str() {
            Some("modelscope.cn") => {
                let caps = MODELSCOPE_PATH.captures(parsed.path()).ok_or_else(|| {
                    RelayError::Config(format!("not a modelscope space link: {url}"))
                })?;
                Ok(format!(
                    "https://modelscope.cn/api/v1/studio/{}/{}/gradio",
                    &caps[1], &caps[2]
                ))
            }
            Some("huggingface.co") => {
                if !HUGGINGFACE_PATH.is_match(parsed.path()) {
                    return Err(RelayError::Config(format!(
                        "not a huggingface space link: {url}"
                    )));
                }
                debug!(%url, "fetching huggingface space page");
                let page = self.client.get(url).send().await?.error_for_status()?.text().await?;
                let src = IFRAME_SRC
                    .captures(&page)
                    .map(|caps| caps[1].to_string())
                    .ok_or_else(|| RelayError::Protocol("space page has no app iframe".to_string()))?;
                let mut app = reqwest::Url::parse(&src)
                    .map_err(|e| RelayError::Protocol(format!("bad iframe src {src}: {e}")))?;
                app.set_query(None);
                match app.host_str() {
                    Some(host) if host.ends_with(".hf.space") => Ok(format!("https://{host}")),
                    _ => Ok(app.to_string().trim_end_matches('/').to_string()),
                }
            }
            _ => Ok(url.trim_end_matches('/').to_string()),
        }
    }

    async fn fetch_config(&self, endpoint: &str) -> Result<AppConfig> {
        let response = self
            .client
            .get(format!("{endpoint}/config"))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(RelayError::BackendUnavailable(format!(
                "space config returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_job(
        &self,
        endpoint: &str,
        fn_index: usize,
        data: &[Value],
        output_index: Option<usize>,
        prompt: &str,
        observer: Option<Observer>,
        cancel: &CancellationToken,
    ) -> Result<ChatExchange> {
        let mut socket =
            FramedSocket::open(&socket_url(endpoint), &[], QueueDialect, &self.socket).await?;
        let mut reconciler = Reconciler::new(ChatExchange::new(prompt), observer);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(fn_index, "gradio job cancelled");
                    socket.close();
                    return Err(RelayError::Cancelled("request aborted".to_string()));
                }
                event = socket.next_event() => event,
            };
            let Some(event) = event else {
                break;
            };

            match event {
                QueueEvent::SendHash => {
                    socket.send(&json!({ "fn_index": fn_index, "session_hash": self.session_hash }))?;
                }
                QueueEvent::SendData => {
                    socket.send(&json!({
                        "data": data,
                        "event_data": null,
                        "fn_index": fn_index,
                        "session_hash": self.session_hash
                    }))?;
                }
                QueueEvent::Estimation { rank, queue_size, rank_eta } => {
                    debug!(?rank, ?queue_size, ?rank_eta, "queued");
                }
                QueueEvent::ProcessStarts => debug!(fn_index, "processing"),
                QueueEvent::ProcessGenerating { output, .. } => {
                    reconciler.apply(Fragment::partial(extract_message(&output.data, output_index)));
                }
                QueueEvent::ProcessCompleted { output, success } => {
                    if success == Some(false) || output.error.is_some() {
                        socket.close();
                        let reason = output.error.unwrap_or_else(|| "error".to_string());
                        return Err(RelayError::BackendUnavailable(reason));
                    }
                    let text = extract_message(&output.data, output_index);
                    reconciler.apply(Fragment::complete(Some(text)));
                }
                QueueEvent::QueueFull => {
                    socket.close();
                    return Err(RelayError::BackendUnavailable("space queue is full".to_string()));
                }
                QueueEvent::Other => {}
            }

            if reconciler.is_terminal() {
                break;
            }
        }
        socket.close();

        Ok(reconciler.finish())
    }
}

#[async_trait]
impl ChatBackend for GradioBackend {
    fn name(&self) -> &str {
        "gradio"
    }

    async fn send(&mut self, request: ChatRequest) -> Result<ChatExchange> {
        if request.cancel.is_cancelled() {
            return Err(RelayError::Cancelled("request aborted".to_string()));
        }
        let space = request
            .param
            .as_deref()
            .filter(|space| !space.trim().is_empty())
            .ok_or_else(|| RelayError::Config("Gradio requires a space address".to_string()))?;
        let url = self.space_url(space)?;
        let endpoint = self.resolve_endpoint(&url).await?;
        debug!(%endpoint, "gradio endpoint");

        let config = self.fetch_config(&endpoint).await?;
        let fn_index = find_submit(&config)
            .ok_or_else(|| RelayError::Protocol("could not find the chat function".to_string()))?;

        let mut inputs = parse_inputs(&config, fn_index, false)?;
        inputs.data[inputs.text_index] = Value::String(request.prompt.clone());

        let mut jobs = vec![(fn_index, inputs)];
        let mut next = fn_index + 1;
        while config
            .dependencies
            .get(next)
            .is_some_and(|dep| dep.trigger.as_deref() == Some("then"))
        {
            jobs.push((next, parse_inputs(&config, next, true)?));
            next += 1;
        }

        let last = jobs.len() - 1;
        let mut exchange = None;
        for (position, (index, job)) in jobs.into_iter().enumerate() {
            let observer = (position == last).then(|| request.observer.clone()).flatten();
            debug!(fn_index = index, "running gradio job");
            exchange = Some(
                self.run_job(
                    &endpoint,
                    index,
                    &job.data,
                    job.output_index,
                    &request.prompt,
                    observer,
                    &request.cancel,
                )
                .await?,
            );
        }
        exchange.ok_or_else(|| RelayError::Protocol("no gradio job ran".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_config() -> AppConfig {
        serde_json::from_value(json!({
            "components": [
                {"id": 1, "type": "chatbot", "props": {"visible": true, "value": [["old", "history"]]}},
                {"id": 2, "type": "textbox", "props": {"value": ""}},
                {"id": 3, "type": "button", "props": {"value": "Submit"}},
                {"id": 4, "type": "slider", "props": {"value": 0.7}}
            ],
            "dependencies": [
                {"targets": [3], "trigger": "click", "inputs": [2, 1, 4], "outputs": [2, 1], "backend_fn": true},
                {"targets": [3], "trigger": "then", "inputs": [1], "outputs": [1], "backend_fn": true}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_submit_button_wins() {
        assert_eq!(find_submit(&chat_config()), Some(0));
    }

    #[test]
    fn test_inputs_reset_history_and_locate_textbox() {
        let inputs = parse_inputs(&chat_config(), 0, false).unwrap();
        assert_eq!(inputs.data, vec![json!(""), json!([]), json!(0.7)]);
        assert_eq!(inputs.text_index, 0);
        assert_eq!(inputs.output_index, Some(1));
    }

    #[test]
    fn test_submit_trigger_without_button() {
        let config: AppConfig = serde_json::from_value(json!({
            "components": [{"id": 7, "type": "textbox", "props": {}}],
            "dependencies": [
                {"targets": [[7, "change"]], "trigger": "change", "inputs": [7], "outputs": [7], "backend_fn": true},
                {"targets": [[7, "submit"]], "trigger": "submit", "inputs": [7], "outputs": [7], "backend_fn": true}
            ]
        }))
        .unwrap();
        assert_eq!(find_submit(&config), Some(1));
    }

    #[test]
    fn test_extract_message_takes_last_chat_turn() {
        let data = vec![
            json!(""),
            json!([["hi", "<p>first</p>"], ["again", "<p>second &amp; last</p>"]]),
        ];
        assert_eq!(extract_message(&data, Some(1)), "second & last");
        assert_eq!(extract_message(&data, None), "second & last");
    }

    #[test]
    fn test_socket_url_scheme() {
        assert_eq!(
            socket_url("https://x-y.hf.space/"),
            "wss://x-y.hf.space/queue/join"
        );
        assert_eq!(socket_url("http://127.0.0.1:7860"), "ws://127.0.0.1:7860/queue/join");
    }

    #[tokio::test]
    async fn test_resolve_modelscope_and_plain_endpoints() {
        let backend = GradioBackend::new(&GradioConfig::default(), &NetworkSettings::default()).unwrap();
        assert_eq!(
            backend
                .resolve_endpoint("https://modelscope.cn/studios/AI-ModelScope/ChatGLM6B-unofficial/summary")
                .await
                .unwrap(),
            "https://modelscope.cn/api/v1/studio/AI-ModelScope/ChatGLM6B-unofficial/gradio"
        );
        assert_eq!(
            backend.resolve_endpoint("https://example.com/space/").await.unwrap(),
            "https://example.com/space"
        );
    }

    #[test]
    fn test_numeric_space_indexes_list() {
        let backend = GradioBackend::new(&GradioConfig::default(), &NetworkSettings::default()).unwrap();
        assert!(backend.space_url("2").unwrap().contains("huggingface.co"));
        assert!(matches!(backend.space_url("9"), Err(RelayError::Config(_))));
    }
}
