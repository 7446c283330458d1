//! HTTP plumbing shared by the stream and zone providers.

use futures::StreamExt;
use reqwest::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use super::error::{RemoteError, RemoteResult};

/// Upper bound on any response body.
const MAX_RESPONSE_SIZE: usize = 16 * 1024 * 1024; // 16MB

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error body returned by the service on non-2xx responses.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Authenticated JSON client rooted at a base URL.
#[derive(Clone)]
pub(crate) struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    token: Option<SecretString>,
    timeout: Duration,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ApiClient {
    pub(crate) fn new(
        http: reqwest::Client,
        base_url: Url,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            base_url,
            token,
            timeout,
        }
    }

    /// Resolve `path` (with or without a leading slash) against the base URL.
    pub(crate) fn url(&self, path: &str) -> RemoteResult<Url> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let with_slash = format!("{}/", base.path());
            base.set_path(&with_slash);
        }
        base.join(path.trim_start_matches('/'))
            .map_err(|e| RemoteError::Decode(format!("invalid request path {path:?}: {e}")))
    }

    /// Send a request with an optional JSON body and return the raw response body.
    pub(crate) async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> RemoteResult<Vec<u8>> {
        let mut request = self.http.request(method.clone(), url.clone());
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        if let Some(body) = body {
            let json = serde_json::to_vec(body).map_err(|e| RemoteError::Decode(e.to_string()))?;
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(json);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| RemoteError::Timeout)?
            .map_err(RemoteError::Network)?;

        let status = response.status();
        if status.is_success() {
            return read_limited_bytes(response, MAX_RESPONSE_SIZE).await;
        }

        let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
        // The error body is informational; a failure reading it must not mask the status.
        let body = read_limited_bytes(response, 64 * 1024).await.unwrap_or_default();
        let error_body: ErrorBody = serde_json::from_slice(&body).unwrap_or_default();
        let error = map_status(status, retry_after, error_body);
        tracing::debug!(
            method = %method,
            url = %url,
            status = status.as_u16(),
            error = %error,
            "Remote request failed"
        );
        Err(error)
    }

    /// Send and decode a JSON response.
    pub(crate) async fn send_json<B, T>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> RemoteResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = self.send(method, url, body).await?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

fn parse_retry_after(value: Option<&HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn map_status(status: StatusCode, retry_after: Option<Duration>, body: ErrorBody) -> RemoteError {
    let code = body.code.as_deref().unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            RemoteError::RateLimited { retry_after }
        }
        StatusCode::CONFLICT if code == "zone_busy" => RemoteError::ZoneBusy { retry_after },
        StatusCode::NOT_FOUND if code == "zone_not_found" => RemoteError::ZoneNotFound,
        StatusCode::GONE if code == "user_deleted_zone" => RemoteError::UserDeletedZone,
        StatusCode::GONE if code == "change_token_expired" => RemoteError::ChangeTokenExpired,
        StatusCode::PAYLOAD_TOO_LARGE => RemoteError::LimitExceeded,
        s if s.is_server_error() => RemoteError::ServiceUnavailable {
            status: s.as_u16(),
            retry_after,
        },
        s => RemoteError::Http {
            status: s.as_u16(),
            message: body
                .message
                .unwrap_or_else(|| s.canonical_reason().unwrap_or("unknown").to_string()),
        },
    }
}

async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> RemoteResult<Vec<u8>> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(RemoteError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(RemoteError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(RemoteError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}
