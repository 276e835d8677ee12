//! # Quality Gate
//!
//! Decides whether a tweet is good enough to be broadcast. Tweets the
//! upstream does not flag as possibly sensitive always pass without a scorer
//! call. Flagged tweets pass only when the sentiment scorer returns a
//! confidence of at least the threshold; every other outcome rejects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};

/// External sentiment scorer: text in, confidence percentage out.
#[async_trait]
pub trait SentimentScorer: Send + Sync {
    /// Returns a confidence in `[0, 100]`, or `None` when the scorer had no
    /// opinion.
    async fn score(&self, text: &str) -> StreamResult<Option<f32>>;
}

/// Gate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GateConfig {
    /// Minimum accepted score.
    pub threshold: f32,
    /// Upper bound for one scorer call.
    pub timeout_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            threshold: 50.0,
            timeout_ms: 2000,
        }
    }
}

pub struct QualityGate {
    scorer: Arc<dyn SentimentScorer>,
    config: GateConfig,
}

impl QualityGate {
    pub fn new(scorer: Arc<dyn SentimentScorer>, config: GateConfig) -> Self {
        Self { scorer, config }
    }

    /// Accept/reject decision for one tweet. Fails closed.
    pub async fn accept(&self, text: &str, suspected_low_quality: bool) -> bool {
        if !suspected_low_quality {
            return true;
        }

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, self.scorer.score(text)).await {
            Ok(Ok(Some(score))) if score.is_finite() && (0.0..=100.0).contains(&score) => {
                score >= self.config.threshold
            }
            Ok(Ok(Some(score))) => {
                tracing::warn!(score, "Sentiment score out of range, rejecting tweet");
                false
            }
            Ok(Ok(None)) => {
                tracing::debug!("Sentiment scorer returned no score, rejecting tweet");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Sentiment scorer failed, rejecting tweet");
                false
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.config.timeout_ms, "Sentiment scorer timed out, rejecting tweet");
                false
            }
        }
    }
}

/// Scorer used when none is configured: flagged tweets never pass.
pub struct NoScorer;

#[async_trait]
impl SentimentScorer for NoScorer {
    async fn score(&self, _text: &str) -> StreamResult<Option<f32>> {
        Ok(None)
    }
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct ScoreResponse {
    percentage: Option<f32>,
}

/// Scores text through an HTTP prediction endpoint.
///
/// Sends `{"text": "..."}` and reads `{"percentage": 87.5}`. No retries, the
/// gate bounds the call with its own timeout.
pub struct HttpSentimentScorer {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpSentimentScorer {
    pub fn new(endpoint: &str) -> StreamResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent("StreamHub/1.0")
            .build()?;
        Ok(Self {
            client,
            endpoint: url::Url::parse(endpoint)?,
        })
    }
}

#[async_trait]
impl SentimentScorer for HttpSentimentScorer {
    async fn score(&self, text: &str) -> StreamResult<Option<f32>> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&ScoreRequest { text })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StreamError::Upstream(format!(
                "scorer answered HTTP {}",
                response.status().as_u16()
            )));
        }

        // An unparseable body is "no score", not a transport failure.
        match response.json::<ScoreResponse>().await {
            Ok(body) => Ok(body.percentage),
            Err(e) => {
                tracing::debug!(error = %e, "Unparseable scorer response");
                Ok(None)
            }
        }
    }
}
