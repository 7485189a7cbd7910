//! Shared request/response plumbing for the JSON wire families.

use std::time::{Duration, Instant};

use reqwest::RequestBuilder;
use serde_json::Value;
use tracing::debug;

use super::ProviderError;

/// Send a prepared request and return the decoded JSON body.
///
/// Non-success statuses are classified through [`ProviderError::from_status`].
pub(crate) async fn send_json(
    provider: &str,
    builder: RequestBuilder,
    timeout: Duration,
) -> Result<Value, ProviderError> {
    let start = Instant::now();
    let response = builder
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ProviderError::from_reqwest(provider, &e, start.elapsed()))?;

    let status = response.status();
    if !status.is_success() {
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(
            provider,
            status.as_u16(),
            &body,
            retry_after,
        ));
    }

    let body: Value = response
        .json()
        .await
        .map_err(|e| ProviderError::malformed(provider, e.to_string()))?;

    debug!(
        provider,
        status = status.as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Provider responded"
    );
    Ok(body)
}

/// Pull non-empty text out of a JSON body at a fixed pointer.
pub(crate) fn extract_text(provider: &str, body: &Value, pointer: &str) -> Result<String, ProviderError> {
    match body.pointer(pointer).and_then(Value::as_str) {
        Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
        Some(_) => Err(ProviderError::malformed(provider, "empty completion text")),
        None => Err(ProviderError::malformed(
            provider,
            format!("missing {pointer} in response"),
        )),
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Join a base address and a path without doubling slashes.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
