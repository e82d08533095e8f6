//! Upstream retry and timeout policy
//!
//! Local backends get generous timeouts: prompt processing on a laptop GPU
//! can sit quiet for minutes before the first token. Cloud backends retry
//! 429s (honouring Retry-After) and transient socket failures; everything
//! else surfaces as a structured error immediately.

use crate::registry::ProviderSpec;
use claudish_core::GatewayError;
use std::time::Duration;
use tracing::{info, warn};

/// Hard wrap on every upstream call.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(600);

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Exponential backoff for a 429, clamped; an explicit Retry-After wins.
fn rate_limit_backoff(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    match retry_after_secs {
        Some(secs) => Duration::from_secs(secs).min(BACKOFF_CAP),
        None => Duration::from_secs(1u64 << attempt.min(5)).min(BACKOFF_CAP),
    }
}

/// Linear backoff for transient socket errors.
fn transient_backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * attempt as u64)
}

/// Connection-level failures worth retrying (refused mid-flight, reset,
/// timed out). A request that failed to build is not.
fn is_transient(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request() && err.status().is_none()
}

/// Send a request, retrying per policy. `build` must produce an equivalent
/// request each attempt. Returns the response as soon as the status is
/// anything other than 429; callers map remaining non-2xx statuses.
pub async fn send_with_retry<F>(
    provider: &ProviderSpec,
    build: F,
) -> Result<reqwest::Response, GatewayError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = build().timeout(UPSTREAM_TIMEOUT).send().await;

        match result {
            Ok(resp) if resp.status().as_u16() == 429 => {
                if provider.local || attempt >= MAX_ATTEMPTS {
                    return Err(GatewayError::RateLimit {
                        attempts: attempt,
                        message: format!("{} rate limit persisted", provider.name),
                    });
                }
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse().ok());
                let wait = rate_limit_backoff(attempt, retry_after);
                info!(
                    "{} returned 429 (attempt {}), backing off {:?}",
                    provider.name, attempt, wait
                );
                tokio::time::sleep(wait).await;
            }
            Ok(resp) => return Ok(resp),
            Err(e) if is_transient(&e) && !provider.local && attempt < MAX_ATTEMPTS => {
                let wait = transient_backoff(attempt);
                warn!(
                    "transient error talking to {} (attempt {}): {}; retrying in {:?}",
                    provider.name, attempt, e, wait
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                return Err(GatewayError::Connection {
                    url: provider.base_url.clone(),
                    message: connection_advice(provider, &e),
                });
            }
        }
    }
}

fn connection_advice(provider: &ProviderSpec, err: &reqwest::Error) -> String {
    if provider.local {
        format!(
            "{}. Is the {} server running at {}?",
            err, provider.name, provider.base_url
        )
    } else {
        err.to_string()
    }
}

/// Map an upstream non-2xx into the gateway error taxonomy.
pub fn classify_error_response(
    provider: &ProviderSpec,
    model: &str,
    status: u16,
    body: &str,
) -> GatewayError {
    let body_lower = body.to_lowercase();
    let model_missing = status == 404
        || (body_lower.contains("model") && body_lower.contains("not found"))
        || body_lower.contains("no such model");

    if model_missing {
        let hint = match provider.name.as_str() {
            "ollama" => format!(" Try: ollama pull {}", model),
            "lmstudio" => " Load the model in LM Studio first.".to_string(),
            _ => String::new(),
        };
        return GatewayError::ModelNotFound {
            message: format!("{} does not serve '{}'.{}", provider.name, model, hint),
        };
    }

    GatewayError::Api {
        status,
        message: format!("{}: {}", provider.name, truncate(body, 500)),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::registry::Registry;

    fn ollama_spec() -> ProviderSpec {
        Registry::from_env(&Settings::default())
            .resolve("ollama/qwen3")
            .provider
    }

    #[test]
    fn test_rate_limit_backoff_respects_retry_after() {
        assert_eq!(rate_limit_backoff(1, Some(7)), Duration::from_secs(7));
        // capped
        assert_eq!(rate_limit_backoff(1, Some(300)), BACKOFF_CAP);
    }

    #[test]
    fn test_rate_limit_backoff_exponential_and_capped() {
        assert_eq!(rate_limit_backoff(1, None), Duration::from_secs(2));
        assert_eq!(rate_limit_backoff(2, None), Duration::from_secs(4));
        assert_eq!(rate_limit_backoff(10, None), BACKOFF_CAP);
    }

    #[test]
    fn test_transient_backoff_linear() {
        assert_eq!(transient_backoff(1), Duration::from_millis(500));
        assert_eq!(transient_backoff(4), Duration::from_millis(2000));
    }

    #[test]
    fn test_classify_model_not_found_has_pull_hint() {
        let spec = ollama_spec();
        let err = classify_error_response(&spec, "qwen3:8b", 404, "model 'qwen3:8b' not found");
        match err {
            GatewayError::ModelNotFound { message } => {
                assert!(message.contains("ollama pull qwen3:8b"));
            }
            other => panic!("expected ModelNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_other_errors_keep_status() {
        let spec = ollama_spec();
        let err = classify_error_response(&spec, "m", 500, "boom");
        match err {
            GatewayError::Api { status, .. } => assert_eq!(status, 500),
            other => panic!("expected Api, got {:?}", other),
        }
    }
}
