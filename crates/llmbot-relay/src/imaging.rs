//! Image generation for backend image directives
//!
//! Both services work the same way: submit a prompt, get a job id back, then
//! poll until result URLs show up or the attempt budget runs out.

use crate::backends::NetworkSettings;
use crate::error::{RelayError, Result};
use async_trait::async_trait;
use llmbot_config::{BingConfig, ImageCreatorKind, MidjourneyConfig, RelayConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

static JOB_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"[?&]id=([^&]+)").expect("valid regex"));
static IMAGE_SRC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<img[^>]*\ssrc="(https?://[^"?]+)"#).expect("valid regex"));

/// Turns an image prompt into image URLs
#[async_trait]
pub trait ImageCreator: Send + Sync {
    /// Service name, used in logs
    fn name(&self) -> &str;

    /// Generate images for `prompt`
    async fn create(&self, prompt: &str) -> Result<Vec<String>>;
}

/// Probe up to `attempts` times, sleeping `delay` before each probe
///
/// Probe errors count as "not ready yet". Returns `None` when the budget is
/// spent without a result.
pub async fn poll_until<T, F, Fut>(attempts: u32, delay: Duration, mut probe: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    for attempt in 1..=attempts {
        tokio::time::sleep(delay).await;
        match probe().await {
            Ok(Some(value)) => return Some(value),
            Ok(None) => debug!(attempt, "result not ready"),
            Err(e) => debug!(attempt, error = %e, "poll failed"),
        }
    }
    None
}

/// Image creator selected by configuration, if it has what it needs
pub fn creator_for(
    config: &RelayConfig,
    network: &NetworkSettings,
) -> Result<Option<Box<dyn ImageCreator>>> {
    match config.bing.image_creator {
        ImageCreatorKind::Bing => match config.bing.cookie.as_deref() {
            Some(cookie) => Ok(Some(Box::new(BingImageCreator::new(
                &config.bing,
                cookie,
                network,
            )?))),
            None => Ok(None),
        },
        ImageCreatorKind::Midjourney => match config.midjourney.uuid.as_deref() {
            Some(uuid) => Ok(Some(Box::new(MidjourneyCreator::new(
                &config.midjourney,
                uuid,
                network,
            )?))),
            None => {
                warn!("midjourney image creator selected but MJ_UUID is not set");
                Ok(None)
            }
        },
    }
}

/// Cookie header for the Bing `_U` value or a full cookie string
pub(crate) fn bing_cookie_header(cookie: &str) -> String {
    if cookie.contains(';') {
        cookie.to_string()
    } else {
        format!("_U={cookie}")
    }
}

/// Bing Image Creator
pub struct BingImageCreator {
    client: reqwest::Client,
    base_url: String,
    cookie: String,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl BingImageCreator {
    /// Creator authenticated with the Bing cookie
    pub fn new(config: &BingConfig, cookie: &str, network: &NetworkSettings) -> Result<Self> {
        Ok(Self {
            client: network.http_client_without_redirects()?,
            base_url: config.images_url(),
            cookie: bing_cookie_header(cookie),
            poll_interval: config.image_poll_interval(),
            poll_attempts: config.image_poll_attempts(),
        })
    }

    async fn submit(&self, prompt: &str) -> Result<String> {
        let url = format!(
            "{}/images/create?q={}&rt=4&FORM=GENCRE",
            self.base_url,
            urlencoding::encode(prompt)
        );
        let response = self
            .client
            .post(&url)
            .header("cookie", &self.cookie)
            .send()
            .await?;

        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                RelayError::BackendUnavailable(format!(
                    "image request was not accepted ({})",
                    response.status()
                ))
            })?;

        JOB_ID
            .captures(location)
            .and_then(|caps| caps.get(1))
            .map(|id| id.as_str().to_string())
            .ok_or_else(|| RelayError::Protocol(format!("no job id in redirect {location}")))
    }

    async fn fetch_results(&self, id: &str, prompt: &str) -> Result<Option<Vec<String>>> {
        let url = format!(
            "{}/images/create/async/results/{}?q={}",
            self.base_url,
            id,
            urlencoding::encode(prompt)
        );
        let body = self
            .client
            .get(&url)
            .header("cookie", &self.cookie)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let images: Vec<String> = IMAGE_SRC
            .captures_iter(&body)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .collect();
        Ok((!images.is_empty()).then_some(images))
    }
}

#[async_trait]
impl ImageCreator for BingImageCreator {
    fn name(&self) -> &str {
        "bing-images"
    }

    async fn create(&self, prompt: &str) -> Result<Vec<String>> {
        let id = self.submit(prompt).await?;
        info!(%id, "image job submitted");
        poll_until(self.poll_attempts, self.poll_interval, || {
            self.fetch_results(&id, prompt)
        })
        .await
        .ok_or_else(|| RelayError::Timeout("image results never arrived".to_string()))
    }
}

/// Midjourney bridge
pub struct MidjourneyCreator {
    client: reqwest::Client,
    base_url: String,
    uuid: String,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl MidjourneyCreator {
    /// Creator for the bridge account `uuid`
    pub fn new(config: &MidjourneyConfig, uuid: &str, network: &NetworkSettings) -> Result<Self> {
        if uuid.trim().is_empty() {
            return Err(RelayError::Config("MJ_UUID must not be empty".to_string()));
        }
        Ok(Self {
            client: network.http_client()?,
            base_url: config.base_url(),
            uuid: uuid.to_string(),
            poll_interval: config.poll_interval(),
            poll_attempts: config.poll_attempts(),
        })
    }

    async fn call(&self, function: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/func2api/{}", self.base_url, function))
            .header("UUID", &self.uuid)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn fetch_result(&self, image_id: &str) -> Result<Option<String>> {
        let response = self
            .call("GetPicByImgID", json!({ "imgId": image_id }))
            .await?;
        Ok(response
            .pointer("/data/mjSrcUrl")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .map(str::to_string))
    }
}

#[async_trait]
impl ImageCreator for MidjourneyCreator {
    fn name(&self) -> &str {
        "midjourney"
    }

    async fn create(&self, prompt: &str) -> Result<Vec<String>> {
        let response = self
            .call("Imagine", json!({ "type": "P", "prompt": prompt }))
            .await?;
        let image_id = match response.pointer("/data/imgId") {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(RelayError::BackendUnavailable(
                    "image generation was refused".to_string(),
                ))
            }
        };
        info!(%image_id, "midjourney job submitted");

        poll_until(self.poll_attempts, self.poll_interval, || {
            self.fetch_result(&image_id)
        })
        .await
        .map(|url| vec![url])
        .ok_or_else(|| RelayError::Timeout("image link never arrived".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_stops_at_first_result() {
        let probes = Arc::new(AtomicU32::new(0));
        let counter = probes.clone();

        let result = poll_until(10, Duration::from_secs(6), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                match n {
                    0 => Err(RelayError::Protocol("flaky".into())),
                    1 => Ok(None),
                    _ => Ok(Some(n)),
                }
            }
        })
        .await;

        assert_eq!(result, Some(2));
        assert_eq!(probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_gives_up() {
        let result: Option<()> = poll_until(3, Duration::from_secs(1), || async { Ok(None) }).await;
        assert!(result.is_none());
    }

    #[test]
    fn test_cookie_header_forms() {
        assert_eq!(bing_cookie_header("abc"), "_U=abc");
        assert_eq!(bing_cookie_header("_U=abc; SRCHHPGUSR=x"), "_U=abc; SRCHHPGUSR=x");
    }

    #[tokio::test]
    async fn test_bing_images_follow_job_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/images/create"))
            .and(header("cookie", "_U=cookie"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("Location", "/images/create/async?q=cat&id=job42"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/images/create/async/results/job42"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<div><img class="mimg" src="https://tse1.mm.bing.net/th/id/OIG.a?w=270&h=270" /><img src="https://tse2.mm.bing.net/th/id/OIG.b" /></div>"#,
            ))
            .mount(&server)
            .await;

        let config = BingConfig {
            images_url: Some(server.uri()),
            image_poll_secs: Some(0),
            ..Default::default()
        };
        let creator = BingImageCreator::new(&config, "cookie", &NetworkSettings::default()).unwrap();
        let images = creator.create("cat").await.unwrap();

        assert_eq!(
            images,
            vec![
                "https://tse1.mm.bing.net/th/id/OIG.a".to_string(),
                "https://tse2.mm.bing.net/th/id/OIG.b".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_midjourney_polls_for_link() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/func2api/Imagine"))
            .and(header("UUID", "acct"))
            .and(body_json(json!({"type": "P", "prompt": "a fox"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"imgId": "img-1"}})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/func2api/GetPicByImgID"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"data": {"mjSrcUrl": "https://cdn.example/fox.png"}})),
            )
            .mount(&server)
            .await;

        let config = MidjourneyConfig {
            base_url: Some(server.uri()),
            poll_interval_secs: Some(0),
            ..Default::default()
        };
        let creator = MidjourneyCreator::new(&config, "acct", &NetworkSettings::default()).unwrap();
        let images = creator.create("a fox").await.unwrap();
        assert_eq!(images, vec!["https://cdn.example/fox.png".to_string()]);
    }

    #[tokio::test]
    async fn test_midjourney_refusal_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/func2api/Imagine"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .mount(&server)
            .await;

        let config = MidjourneyConfig {
            base_url: Some(server.uri()),
            ..Default::default()
        };
        let creator = MidjourneyCreator::new(&config, "acct", &NetworkSettings::default()).unwrap();
        assert!(matches!(
            creator.create("a fox").await,
            Err(RelayError::BackendUnavailable(_))
        ));
    }
}
