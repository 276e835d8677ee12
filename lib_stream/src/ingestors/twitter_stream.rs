//! # Twitter Filtered Stream Ingestor
//!
//! Opens the filtered statuses endpoint with the current tracks and turns the
//! newline-delimited JSON body into [`UpstreamMessage`]s.
//!
//! The handshake is the HTTP exchange itself: `connect` resolves once the
//! response headers arrived with a success status. From then on the body is
//! read lazily by whoever polls the returned stream; dropping the stream drops
//! the response and closes the connection.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use super::{UpstreamConnection, UpstreamSource};
use crate::core::model::{Tweet, UpstreamMessage};
use crate::error::{StreamError, StreamResult};

/// Configuration for the filtered stream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TwitterStreamConfig {
    pub url: String,
    pub bearer_token: Option<String>,
    pub connect_timeout_ms: u64,
}

impl Default for TwitterStreamConfig {
    fn default() -> Self {
        Self {
            url: "https://stream.twitter.com/1.1/statuses/filter.json".to_string(),
            bearer_token: None,
            connect_timeout_ms: 10_000,
        }
    }
}

pub struct TwitterStreamSource {
    config: TwitterStreamConfig,
    client: reqwest::Client,
}

impl TwitterStreamSource {
    pub fn new(config: TwitterStreamConfig) -> StreamResult<Self> {
        // No overall timeout: the response body is expected to stay open.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .user_agent("StreamHub/1.0")
            .build()?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl UpstreamSource for TwitterStreamSource {
    async fn connect(&self, tracks: &[String]) -> StreamResult<UpstreamConnection> {
        if tracks.is_empty() {
            return Err(StreamError::NoTracks);
        }

        let track_param = tracks.join(",");
        tracing::info!(url = %self.config.url, tracks = %track_param, "Connecting to filtered stream");

        let mut request = self
            .client
            .post(&self.config.url)
            .form(&[("track", track_param.as_str()), ("stall_warnings", "true")]);
        if let Some(token) = &self.config.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Connect(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body.trim()
            )));
        }

        tracing::info!("Filtered stream connected");
        let body: BoxStream<'static, reqwest::Result<Bytes>> = response.bytes_stream().boxed();
        Ok(decode_body(body))
    }
}

/// Splits an arbitrarily chunked body into complete lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    partial: Vec<u8>,
}

impl LineDecoder {
    /// Feeds a chunk and returns the lines it completed, without terminators.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

struct BodyState<S> {
    body: S,
    decoder: LineDecoder,
    ready: VecDeque<String>,
}

/// Turns a chunked newline-delimited JSON body into upstream messages.
pub(crate) fn decode_body<S, E>(body: S) -> UpstreamConnection
where
    S: futures_util::Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = BodyState {
        body,
        decoder: LineDecoder::default(),
        ready: VecDeque::new(),
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                match parse_line(&line) {
                    Some(message) => return Some((Ok(message), state)),
                    None => continue,
                }
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let lines = state.decoder.push(&chunk);
                    state.ready.extend(lines);
                }
                Some(Err(e)) => {
                    return Some((Err(StreamError::Upstream(e.to_string())), state));
                }
                None => return None,
            }
        }
    })
    .boxed()
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawUser {
    screen_name: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawExtendedTweet {
    full_text: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawWarning {
    code: Option<String>,
    message: Option<String>,
    percent_full: Option<u32>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawDisconnect {
    code: Option<u32>,
    stream_name: Option<String>,
    reason: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawMessage {
    id_str: Option<String>,
    text: Option<String>,
    full_text: Option<String>,
    extended_tweet: Option<RawExtendedTweet>,
    possibly_sensitive: Option<bool>,
    user: Option<RawUser>,
    warning: Option<RawWarning>,
    disconnect: Option<RawDisconnect>,
}

/// Parses one line of the stream. Keep-alive blank lines, control messages
/// the engine does not care about (limits, deletions) and malformed lines
/// yield `None`.
pub fn parse_line(line: &str) -> Option<UpstreamMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let raw: RawMessage = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::debug!(error = %e, "Skipping malformed stream line");
            return None;
        }
    };

    if let Some(disconnect) = raw.disconnect {
        let reason = disconnect.reason.unwrap_or_else(|| {
            format!(
                "code {} on {}",
                disconnect.code.unwrap_or_default(),
                disconnect.stream_name.unwrap_or_default()
            )
        });
        return Some(UpstreamMessage::Disconnect(reason));
    }

    if let Some(warning) = raw.warning {
        let message = match (warning.message, warning.percent_full) {
            (Some(message), _) => message,
            (None, Some(percent)) => format!("queue {}% full", percent),
            (None, None) => warning.code.unwrap_or_else(|| "unknown warning".to_string()),
        };
        return Some(UpstreamMessage::Warning(message));
    }

    let id = raw.id_str?;
    let text = raw
        .extended_tweet
        .and_then(|extended| extended.full_text)
        .or(raw.full_text)
        .or(raw.text)?;

    Some(UpstreamMessage::Tweet(Tweet {
        id,
        text,
        possibly_sensitive: raw.possibly_sensitive.unwrap_or(false),
        author_screen_name: raw.user.map(|user| user.screen_name).unwrap_or_default(),
    }))
}
