//! OpenAI-compatible chat-completions oracle client.
//!
//! Speaks the `/chat/completions` wire format directly over [`reqwest`] with
//! bearer authentication.  A single shared HTTP client keeps TLS sessions and
//! DNS lookups warm across the many concurrent requests a phase fan-out
//! issues.

use crate::evoforge::oracle::{OracleClient, OracleError, OracleErrorKind};
use async_trait::async_trait;
use lazy_static::lazy_static;
use std::time::Duration;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Default API base for the OpenAI-compatible surface.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// An [`OracleClient`] backed by any OpenAI-compatible HTTP endpoint.
///
/// # Example
///
/// ```rust,no_run
/// use evoforge::clients::OpenAiCompatClient;
///
/// let client = OpenAiCompatClient::new(std::env::var("ORACLE_API_KEY").unwrap())
///     .with_base_url("https://api.openai.com/v1");
/// ```
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiCompatClient {
    /// Create a client against [`DEFAULT_BASE_URL`] using the shared
    /// connection pool.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            http: get_shared_http_client().clone(),
        }
    }

    /// Point the client at a different OpenAI-compatible base URL
    /// (builder pattern).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl OracleClient for OpenAiCompatClient {
    async fn ask(&self, model: &str, prompt: &str) -> Result<String, OracleError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            if log::log_enabled!(log::Level::Error) {
                log::error!("oracle HTTP {} from {}: {}", status, url, text);
            }
            return Err(classify_status(status, &text));
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| OracleError::new(OracleErrorKind::JsonParse, e.to_string()))?;

        parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| {
                OracleError::new(
                    OracleErrorKind::Server,
                    "no choices[0].message.content in provider response",
                )
            })
    }
}

fn classify_transport(err: reqwest::Error) -> OracleError {
    OracleError::new(OracleErrorKind::Transport, err.to_string())
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> OracleError {
    let kind = if status.as_u16() == 429 {
        OracleErrorKind::RateLimited
    } else if status.is_server_error() {
        OracleErrorKind::Server
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        OracleErrorKind::Auth
    } else {
        OracleErrorKind::BadRequest
    };
    OracleError::new(kind, format!("HTTP {}: {}", status, truncate(body, 200)))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let too_many = reqwest::StatusCode::from_u16(429).unwrap();
        assert_eq!(
            classify_status(too_many, "slow down").kind(),
            OracleErrorKind::RateLimited
        );
        let bad_gateway = reqwest::StatusCode::from_u16(502).unwrap();
        assert_eq!(
            classify_status(bad_gateway, "").kind(),
            OracleErrorKind::Server
        );
        let unauthorized = reqwest::StatusCode::from_u16(401).unwrap();
        assert_eq!(
            classify_status(unauthorized, "").kind(),
            OracleErrorKind::Auth
        );
        assert!(!classify_status(unauthorized, "").is_retryable());
        let unprocessable = reqwest::StatusCode::from_u16(422).unwrap();
        assert_eq!(
            classify_status(unprocessable, "").kind(),
            OracleErrorKind::BadRequest
        );
    }
}
