//! Rendering of accepted tweets into their embeddable (oEmbed) form.

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;

use crate::core::model::Tweet;
use crate::error::StreamResult;
use crate::protocol::EmbedResult;
use crate::retrieve::ky_http::ApiClient;

/// oEmbed document as returned by the provider.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct OEmbed {
    pub author_name: String,
    pub author_url: String,
    pub cache_age: Option<String>,
    pub height: Option<u32>,
    pub html: String,
    pub provider_url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub version: String,
    pub width: Option<u32>,
}

impl OEmbed {
    /// Builds the wire result for this document.
    pub fn into_result(self, is_off_topic: bool) -> EmbedResult {
        EmbedResult {
            is_off_topic,
            author_name: self.author_name,
            author_url: self.author_url,
            cache_age: self.cache_age.unwrap_or_default(),
            height: self.height,
            html: self.html,
            provider_url: self.provider_url,
            r#type: self.kind,
            url: self.url,
            version: self.version,
            width: self.width,
        }
    }
}

/// Produces the embeddable form of a tweet. `Ok(None)` means the tweet is
/// simply not embeddable, which is not an error.
#[async_trait]
pub trait EmbedRenderer: Send + Sync {
    async fn render(&self, tweet: &Tweet) -> StreamResult<Option<OEmbed>>;
}

/// Renders through an oEmbed endpoint, e.g. `https://publish.twitter.com/oembed`.
pub struct OEmbedRenderer {
    client: ApiClient,
    path: String,
}

impl OEmbedRenderer {
    /// `endpoint` is the full oEmbed URL; the last path segment is kept as
    /// the request path so the base URL can be shared by the client.
    pub fn new(endpoint: &str) -> StreamResult<Self> {
        let parsed = url::Url::parse(endpoint)?;
        let path = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|segment| !segment.is_empty())
            .unwrap_or("oembed")
            .to_string();
        let base = parsed.join("./")?;
        Ok(Self {
            client: ApiClient::new(base.as_str(), 2)?,
            path,
        })
    }
}

#[async_trait]
impl EmbedRenderer for OEmbedRenderer {
    async fn render(&self, tweet: &Tweet) -> StreamResult<Option<OEmbed>> {
        let status_url = tweet.status_url();
        let response = self
            .client
            .request::<OEmbed>(
                Method::GET,
                &self.path,
                &[("url", status_url.as_str()), ("omit_script", "true")],
            )
            .await?;

        if !response.is_success() {
            tracing::debug!(status = response.status, tweet_id = %tweet.id, "Tweet is not embeddable");
            return Ok(None);
        }

        Ok(response.data.filter(|embed| !embed.html.is_empty()))
    }
}
