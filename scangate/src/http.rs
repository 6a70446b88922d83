use std::time::Duration;

use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Result, ScanError};
use crate::token::TokenCache;

const USER_AGENT: &str = concat!("scangate/", env!("CARGO_PKG_VERSION"));

/// Longest slice of an error body carried into an error message.
const ERROR_BODY_LIMIT: usize = 512;

/// Build the HTTP client shared by a vendor adapter and its token cache.
pub fn build_client(
    proxy: Option<&str>,
    timeout: Duration,
    insecure_tls: bool,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout);

    if let Some(proxy) = proxy.filter(|p| !p.trim().is_empty()) {
        let proxy = reqwest::Proxy::https(proxy)
            .map_err(|e| ScanError::Config(format!("invalid proxy {proxy}: {e}")))?;
        builder = builder.proxy(proxy);
    }
    if insecure_tls {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| ScanError::Config(format!("failed to build HTTP client: {e}")))
}

/// Send a request and turn any non-2xx answer into a classified error.
pub(crate) async fn send(request: RequestBuilder, what: &str) -> Result<Response> {
    let response = request
        .send()
        .await
        .map_err(|e| ScanError::from_transport(e, what))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let body = truncate(body.trim(), ERROR_BODY_LIMIT);
    let detail = if body.is_empty() {
        format!("{what} returned HTTP {status}")
    } else {
        format!("{what} returned HTTP {status}: {body}")
    };
    Err(ScanError::from_status(status, detail))
}

/// Send a bearer-authenticated request for `scope`.
///
/// A cached credential the server no longer accepts is dropped and the call
/// is repeated once with a freshly acquired one.
pub(crate) async fn send_authorized<F>(
    tokens: &TokenCache,
    scope: &str,
    what: &str,
    build: F,
) -> Result<Response>
where
    F: Fn(&str) -> Result<RequestBuilder>,
{
    let credential = tokens.acquire(scope).await?;
    match send(build(credential.token())?, what).await {
        Err(ScanError::Auth(reason)) => {
            debug!(scope, %reason, "credential rejected; acquiring a new one");
            tokens.invalidate(scope);
            let credential = tokens.acquire(scope).await?;
            send(build(credential.token())?, what).await
        }
        other => other,
    }
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ScanError::from_transport(e, what))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ScanError::Protocol(format!("failed to parse JSON from {what}: {e}")))
}

pub(crate) async fn read_bytes(response: Response, what: &str) -> Result<Vec<u8>> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ScanError::from_transport(e, what))?;
    Ok(bytes.to_vec())
}

fn truncate(s: &str, limit: usize) -> &str {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
