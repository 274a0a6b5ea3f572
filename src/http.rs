//! HTTP Client Core (spec.md 4.2): a retryable, rate-limit-aware GET used
//! by every provider adapter's pagination loop, plus the POST-with-DPoP-
//! nonce-handshake helper used once at token acquisition.
//!
//! Retry decisions are exposed as a pure function (`retry_decision`) so
//! they're unit-testable without a server, the same way
//! `idp-sync/src/okta.rs`'s `extract_next_link` is a small pure helper
//! next to the I/O-performing method that calls it.

use crate::error::IdpSyncError;
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;

/// What to do after receiving a response, before the caller has read the
/// body (spec.md 4.2 retry policy table).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    Accept,
    RetryAfter(Duration),
    Fail
}

const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Implements the retry table in spec.md 4.2: 429 uses
/// `X-Rate-Limit-Reset` (absolute unix seconds, Okta) or `Retry-After`
/// (seconds), else a 1s backoff; 408/500/502/503/504 retry only for
/// GET/HEAD with the default backoff; every other 4xx fails without
/// retry; transport errors are handled by the caller (they never reach
/// this function, since there is no response to inspect).
pub fn retry_decision(status: StatusCode, headers: &reqwest::header::HeaderMap, method: &Method) -> RetryDecision {
    if status.is_success() {
        return RetryDecision::Accept;
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return RetryDecision::RetryAfter(rate_limit_delay(headers));
    }

    let safe_method = *method == Method::GET || *method == Method::HEAD;
    let retryable_status = matches!(
        status.as_u16(),
        408 | 500 | 502 | 503 | 504
    );

    if safe_method && retryable_status {
        return RetryDecision::RetryAfter(DEFAULT_BACKOFF);
    }

    RetryDecision::Fail
}

fn rate_limit_delay(headers: &reqwest::header::HeaderMap) -> Duration {
    if let Some(reset) = headers
        .get("x-rate-limit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
    {
        let now = chrono::Utc::now().timestamp();
        let secs = (reset - now).max(0) as u64;
        return Duration::from_secs(secs);
    }

    if let Some(retry_after) = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
    {
        return Duration::from_secs(retry_after);
    }

    DEFAULT_BACKOFF
}

/// Performs `GET url` with headers freshly minted by `headers_fn` for
/// every attempt (including the first), retrying per `retry_decision` up
/// to `max_retries` times, and returns the final response for the caller
/// to read (status already known-successful, or the caller has exhausted
/// retries and should classify the failure).
///
/// `headers_fn` is called once per attempt rather than once up front so
/// callers whose auth header is a per-request proof (Okta's DPoP, whose
/// `jti`/`iat`/`ath` must be fresh on every attempt, spec.md 4.2) don't
/// replay a stale proof on retry.
pub async fn get_with_retry(
    client: &Client,
    url: &str,
    query: &[(&str, &str)],
    headers_fn: impl Fn() -> Result<Vec<(String, String)>, IdpSyncError>,
    max_retries: u32
) -> Result<reqwest::Response, IdpSyncError> {
    let mut attempt = 0u32;
    loop {
        let headers = headers_fn()?;
        let mut req = client.get(url).query(query);
        for (name, value) in &headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let response = req.send().await?;
        let status = response.status();

        match retry_decision(status, response.headers(), &Method::GET) {
            RetryDecision::Accept => return Ok(response),
            RetryDecision::Fail => return Ok(response),
            RetryDecision::RetryAfter(delay) if attempt < max_retries => {
                attempt += 1;
                tracing::debug!(url = %url, attempt, delay_ms = delay.as_millis() as u64, "retrying request");
                tokio::time::sleep(delay).await;
            }
            RetryDecision::RetryAfter(_) => return Ok(response)
        }
    }
}

/// POSTs a `application/x-www-form-urlencoded` body, exactly once, no
/// idempotent-method retry (POST is not safe). Used for OAuth token
/// requests.
pub async fn post_form(
    client: &Client,
    url: &str,
    form: &[(&str, &str)],
    extra_headers: Vec<(String, String)>
) -> Result<reqwest::Response, IdpSyncError> {
    let mut req = client.post(url).form(form);
    for (name, value) in extra_headers {
        req = req.header(name, value);
    }
    Ok(req.send().await?)
}

/// Okta's DPoP nonce handshake (spec.md 4.2, scenario 4): on
/// `400 {"error":"use_dpop_nonce"}` with a `DPoP-Nonce` response header,
/// reissue the POST exactly once with that nonce embedded in the next
/// proof. No further retries regardless of the second response's
/// outcome.
pub async fn post_form_with_dpop_nonce_retry(
    client: &Client,
    url: &str,
    form: &[(&str, &str)],
    make_dpop_header: impl Fn(Option<&str>) -> Result<String, IdpSyncError>
) -> Result<reqwest::Response, IdpSyncError> {
    let proof = make_dpop_header(None)?;
    let response = post_form(
        client,
        url,
        form,
        vec![("DPoP".to_string(), proof)]
    )
    .await?;

    if response.status() != StatusCode::BAD_REQUEST {
        return Ok(response);
    }

    let nonce = response
        .headers()
        .get("dpop-nonce")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(nonce) = nonce else {
        return Ok(response);
    };

    let body: serde_json::Value = response.json().await.unwrap_or_default();
    if body.get("error").and_then(|v| v.as_str()) != Some("use_dpop_nonce") {
        return Ok(response);
    }

    let proof = make_dpop_header(Some(&nonce))?;
    post_form(client, url, form, vec![("DPoP".to_string(), proof)]).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;

    #[test]
    fn success_is_accepted() {
        let headers = HeaderMap::new();
        assert_eq!(
            retry_decision(StatusCode::OK, &headers, &Method::GET),
            RetryDecision::Accept
        );
    }

    #[test]
    fn rate_limit_uses_retry_after_seconds_when_no_reset_header() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "45".parse().unwrap());
        match retry_decision(StatusCode::TOO_MANY_REQUESTS, &headers, &Method::GET) {
            RetryDecision::RetryAfter(d) => assert_eq!(d, Duration::from_secs(45)),
            other => panic!("expected retry-after, got {other:?}")
        }
    }

    #[test]
    fn rate_limit_falls_back_to_default_with_no_headers() {
        let headers = HeaderMap::new();
        match retry_decision(StatusCode::TOO_MANY_REQUESTS, &headers, &Method::GET) {
            RetryDecision::RetryAfter(d) => assert_eq!(d, DEFAULT_BACKOFF),
            other => panic!("expected retry-after, got {other:?}")
        }
    }

    #[test]
    fn server_errors_retry_only_for_safe_methods() {
        let headers = HeaderMap::new();
        assert!(matches!(
            retry_decision(StatusCode::SERVICE_UNAVAILABLE, &headers, &Method::GET),
            RetryDecision::RetryAfter(_)
        ));
        assert_eq!(
            retry_decision(StatusCode::SERVICE_UNAVAILABLE, &headers, &Method::POST),
            RetryDecision::Fail
        );
    }

    #[test]
    fn other_4xx_never_retries() {
        let headers = HeaderMap::new();
        assert_eq!(
            retry_decision(StatusCode::FORBIDDEN, &headers, &Method::GET),
            RetryDecision::Fail
        );
        assert_eq!(
            retry_decision(StatusCode::NOT_FOUND, &headers, &Method::GET),
            RetryDecision::Fail
        );
    }
}
