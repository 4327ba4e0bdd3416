//! Conditional HTTP fetch of feed documents
//!
//! This module provides the single-request fetch used by workers:
//! - `If-None-Match` / `If-Modified-Since` replayed from stored validators
//! - status classification into [`HttpClass`]
//! - response validators captured for the next cycle
//!
//! A fetch never retries. Retry and backoff belong to the scheduler, which
//! sees every outcome and records it on the channel.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{
    header::{
        HeaderMap, HeaderValue, ACCEPT, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    },
    Client,
};
use url::Url;

use crate::models::HttpClass;
use crate::utils::error::FetchError;

/// Placeholder replaced by the feed id in URL templates
pub const FEED_ID_PLACEHOLDER: &str = "{feed_id}";

/// Default feed location for channel ids
pub const DEFAULT_FEED_URL_TEMPLATE: &str =
    "https://www.youtube.com/feeds/videos.xml?channel_id={feed_id}";

const FEED_ACCEPT: &str =
    "application/atom+xml, application/rss+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5";

/// Response of one conditional fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
    pub status: u16,
    pub class: HttpClass,
    /// Payload, present only for 2xx
    pub body: Option<String>,
    /// `ETag` returned by the server
    pub etag: Option<String>,
    /// `Last-Modified` returned by the server
    pub last_modified: Option<String>,
}

impl FetchResponse {
    /// Response with a bare status and no payload or validators
    pub fn status_only(status: u16) -> Self {
        Self {
            status,
            class: HttpClass::from_status(status),
            body: None,
            etag: None,
            last_modified: None,
        }
    }
}

/// One network call per invocation, using stored validators as hints
///
/// `Err` means no response was obtained at all; every HTTP status, including
/// 4xx and 5xx, is an `Ok` response with its class.
#[async_trait]
pub trait ConditionalFetch: Send + Sync {
    async fn fetch(
        &self,
        feed_id: &str,
        freshness_token: Option<&str>,
        freshness_timestamp: Option<&str>,
    ) -> Result<FetchResponse, FetchError>;
}

/// reqwest-backed feed fetcher
pub struct HttpFetcher {
    /// HTTP client with configured timeout and compression
    client: Client,

    /// Location template containing `{feed_id}`
    url_template: String,
}

impl HttpFetcher {
    /// Create a fetcher for the default feed location
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Http` if the HTTP client cannot be created
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        Self::with_template(user_agent, timeout, DEFAULT_FEED_URL_TEMPLATE)
    }

    /// Create a fetcher with a custom URL template
    ///
    /// # Errors
    ///
    /// Returns `FetchError::InvalidUrl` if the template lacks `{feed_id}`,
    /// or `FetchError::Http` if the HTTP client cannot be created
    pub fn with_template(
        user_agent: &str,
        timeout: Duration,
        url_template: &str,
    ) -> Result<Self, FetchError> {
        if !url_template.contains(FEED_ID_PLACEHOLDER) {
            return Err(FetchError::InvalidUrl(format!(
                "template has no {FEED_ID_PLACEHOLDER} placeholder: {url_template}"
            )));
        }

        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .gzip(true)
            .build()?;

        Ok(Self {
            client,
            url_template: url_template.to_string(),
        })
    }

    /// Resolve the request URL for a feed id
    ///
    /// Feed ids that already are http(s) URLs are fetched as-is.
    pub fn feed_url(&self, feed_id: &str) -> Result<Url, FetchError> {
        let raw = if feed_id.starts_with("http://") || feed_id.starts_with("https://") {
            feed_id.to_string()
        } else {
            self.url_template.replace(FEED_ID_PLACEHOLDER, feed_id)
        };
        Url::parse(&raw).map_err(|e| FetchError::InvalidUrl(format!("{raw}: {e}")))
    }

    /// Build request headers from stored validators
    fn build_headers(
        freshness_token: Option<&str>,
        freshness_timestamp: Option<&str>,
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(FEED_ACCEPT));

        // Validators are opaque; a value that is not a legal header is dropped
        if let Some(value) = freshness_token.and_then(|t| HeaderValue::from_str(t).ok()) {
            headers.insert(IF_NONE_MATCH, value);
        }
        if let Some(value) = freshness_timestamp.and_then(|t| HeaderValue::from_str(t).ok()) {
            headers.insert(IF_MODIFIED_SINCE, value);
        }

        headers
    }
}

#[async_trait]
impl ConditionalFetch for HttpFetcher {
    async fn fetch(
        &self,
        feed_id: &str,
        freshness_token: Option<&str>,
        freshness_timestamp: Option<&str>,
    ) -> Result<FetchResponse, FetchError> {
        let url = self.feed_url(feed_id)?;
        let headers = Self::build_headers(freshness_token, freshness_timestamp);

        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Http(e)
                }
            })?;

        let status = response.status().as_u16();
        let class = HttpClass::from_status(status);
        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v: &HeaderValue| v.to_str().ok())
                .map(str::to_string)
        };
        let etag = header(ETAG);
        let last_modified = header(LAST_MODIFIED);

        let body = if class == HttpClass::Success {
            let text = response.text().await.map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout
                } else {
                    FetchError::Body(e.to_string())
                }
            })?;
            Some(text)
        } else {
            None
        };

        Ok(FetchResponse {
            status,
            class,
            body,
            etag,
            last_modified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new("feedwatch-test", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_feed_url_from_template() {
        let url = fetcher().feed_url("UCabc123").unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.youtube.com/feeds/videos.xml?channel_id=UCabc123"
        );
    }

    #[test]
    fn test_feed_url_passthrough() {
        let url = fetcher().feed_url("https://example.com/feed.xml").unwrap();
        assert_eq!(url.as_str(), "https://example.com/feed.xml");
    }

    #[test]
    fn test_template_requires_placeholder() {
        let result =
            HttpFetcher::with_template("ua", Duration::from_secs(1), "https://example.com/feed");
        assert!(matches!(result, Err(FetchError::InvalidUrl(_))));
    }

    #[test]
    fn test_conditional_headers() {
        let headers = HttpFetcher::build_headers(Some("\"abc\""), Some("Wed, 01 May 2024 12:00:00 GMT"));
        assert_eq!(headers.get(IF_NONE_MATCH).unwrap(), "\"abc\"");
        assert_eq!(
            headers.get(IF_MODIFIED_SINCE).unwrap(),
            "Wed, 01 May 2024 12:00:00 GMT"
        );
        assert!(headers.contains_key(ACCEPT));

        let headers = HttpFetcher::build_headers(None, Some("bad\nvalue"));
        assert!(!headers.contains_key(IF_NONE_MATCH));
        assert!(!headers.contains_key(IF_MODIFIED_SINCE));
    }

    #[test]
    fn test_status_only_response() {
        let response = FetchResponse::status_only(404);
        assert_eq!(response.class, HttpClass::Gone);
        assert!(response.body.is_none());
    }
}
