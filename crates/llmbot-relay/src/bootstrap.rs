//! Session bootstrap helpers: retry policy, status classification, signing

use crate::error::{RelayError, Result};
use llmbot_config::DispatcherConfig;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Salt appended to every signed GraphQL body
const TAG_SALT: &str = "WpuLMiXEKKE98j56k";

/// How bootstrap operations are retried after transient failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Sleep between attempts
    pub backoff: Duration,
    /// Attempt cap; `None` retries until something other than a transient
    /// error comes back
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(1500),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Policy described by the dispatcher section
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            backoff: config.bootstrap_backoff(),
            max_attempts: config.bootstrap_max_attempts,
        }
    }
}

/// Run `op` until it succeeds or fails with a non-transient error
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(%label, attempt, "bootstrap succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() => {
                if policy.max_attempts.is_some_and(|max| attempt >= max) {
                    warn!(%label, attempt, error = %e, "bootstrap attempts exhausted");
                    return Err(e);
                }
                debug!(%label, attempt, error = %e, "bootstrap failed, retrying");
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Map a non-success bootstrap status to the matching error
pub fn status_error(status: StatusCode, context: &str) -> RelayError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            RelayError::Auth(format!("{context} rejected credentials ({status})"))
        }
        _ => RelayError::Transient(format!("{context} returned {status}")),
    }
}

/// `poe-tag-id` header value for a serialized request body
pub fn sign_payload(body: &str, formkey: &str) -> String {
    format!("{:x}", md5::compute(format!("{body}{formkey}{TAG_SALT}")))
}
