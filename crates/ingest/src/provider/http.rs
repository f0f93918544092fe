//! Shared HTTP plumbing for provider clients.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::errors::SourceFailure;
use crate::models::PriceSource;

/// Default per-request timeout for provider HTTP clients.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_ERROR_BODY: usize = 200;

/// A base URL, an optional API key and a reqwest client.
pub(crate) struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    source: PriceSource,
}

impl HttpTransport {
    pub fn new(
        source: PriceSource,
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            source,
        }
    }

    /// GET `path` with query parameters and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, SourceFailure> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url).query(params);
        if let Some(key) = &self.api_key {
            request = request.header("X-API-Key", key);
        }

        debug!("{} request: {} with {} params", self.source, path, params.len());

        let response = request.send().await.map_err(map_request_error)?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| parse_retry_after(value, Utc::now()));
            let body = response.text().await.unwrap_or_default();
            let message = if body.trim().is_empty() {
                status.canonical_reason().unwrap_or("no reason").to_string()
            } else {
                body.chars().take(MAX_ERROR_BODY).collect()
            };

            return Err(SourceFailure::Http {
                status: status.as_u16(),
                retry_after,
                message,
            });
        }

        let body = response.text().await.map_err(map_request_error)?;
        serde_json::from_str(&body).map_err(|e| SourceFailure::Decode(e.to_string()))
    }
}

/// Map a transport-level reqwest error to a source failure.
pub(crate) fn map_request_error(error: reqwest::Error) -> SourceFailure {
    if error.is_timeout() {
        SourceFailure::Timeout
    } else if error.is_connect() || error.is_request() {
        SourceFailure::Connection(error.to_string())
    } else if error.is_decode() || error.is_body() {
        SourceFailure::Decode(error.to_string())
    } else {
        SourceFailure::Other(error.to_string())
    }
}

/// Parse a `Retry-After` header: delta seconds or an HTTP date.
pub(crate) fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}
