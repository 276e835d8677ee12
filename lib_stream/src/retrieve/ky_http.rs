//! # HTTP Retrieval Utilities
//!
//! A `reqwest` client behind retry middleware, for idempotent lookups such as
//! oEmbed rendering. The sentiment scorer does not use it: a gate call is
//! bounded by its own timeout and never retried.

use std::time::Duration;

use reqwest::{Method, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::de::DeserializeOwned;

use crate::error::StreamResult;

/// Outcome of one lookup. A non-2xx answer is not an error: it comes back
/// with `data == None` and the body kept for diagnostics.
#[derive(Debug)]
pub struct ApiResponse<T> {
    pub status: u16,
    pub data: Option<T>,
    pub error_body: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Retrying JSON client rooted at a base URL.
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
}

impl ApiClient {
    /// `base_url` must be absolute, e.g. `https://publish.twitter.com/`.
    /// Transient failures (connect errors, 5xx, 429) are retried up to
    /// `max_retries` times with exponential backoff.
    pub fn new(base_url: &str, max_retries: u32) -> StreamResult<Self> {
        let base_url = Url::parse(base_url)?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("StreamHub/1.0")
            .build()?;

        let inner = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { inner, base_url })
    }

    /// Sends a body-less request to `path`, relative to the base URL, and
    /// decodes a successful answer as `T`.
    pub async fn request<T>(&self, method: Method, path: &str, query: &[(&str, &str)]) -> StreamResult<ApiResponse<T>>
    where
        T: DeserializeOwned,
    {
        let url = self.base_url.join(path)?;
        let response = self.inner.request(method, url).query(query).send().await?;
        let status = response.status().as_u16();

        if response.status().is_success() {
            let data = response.json::<T>().await?;
            return Ok(ApiResponse {
                status,
                data: Some(data),
                error_body: None,
            });
        }

        let error_body = response.text().await.ok();
        tracing::debug!(status, body = ?error_body, "Lookup answered with an error status");
        Ok(ApiResponse {
            status,
            data: None,
            error_body,
        })
    }
}
