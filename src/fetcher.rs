use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_LANGUAGE, COOKIE, USER_AGENT};

use crate::config::HttpSettings;
use crate::error::{ConfigError, FetchError};

/// A fetched page body, dropped once extraction is done with it.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

impl RawDocument {
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        RawDocument {
            url: url.into(),
            body: body.into(),
            fetched_at: Utc::now(),
        }
    }
}

/// One outbound request per call. Implementations never retry.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<RawDocument, FetchError>;
}

/// Shared `reqwest` client carrying the configured headers and cookies.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(settings: &HttpSettings) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .default_headers(build_headers(settings)?)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .danger_accept_invalid_certs(!settings.verify_tls)
            .build()
            .map_err(|e| ConfigError::Http(e.to_string()))?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<RawDocument, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout { url: url.to_string() }
            } else {
                FetchError::BodyDecodeFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        Ok(RawDocument::new(url, body))
    }
}

fn classify(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout { url: url.to_string() }
    } else {
        FetchError::ConnectionFailed {
            url: url.to_string(),
            reason: e.to_string(),
        }
    }
}

fn build_headers(settings: &HttpSettings) -> Result<HeaderMap, ConfigError> {
    let value = |name: &str, v: &str| {
        HeaderValue::from_str(v).map_err(|_| ConfigError::Http(format!("bad value for header {}", name)))
    };

    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, value("user-agent", &settings.user_agent)?);
    headers.insert(ACCEPT_LANGUAGE, value("accept-language", &settings.accept_language)?);
    if let Some(cookies) = settings.cookie_header() {
        headers.insert(COOKIE, value("cookie", &cookies)?);
    }
    for (name, v) in &settings.headers {
        let key = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ConfigError::Http(format!("bad header name {:?}", name)))?;
        headers.insert(key, value(name, v)?);
    }
    Ok(headers)
}
