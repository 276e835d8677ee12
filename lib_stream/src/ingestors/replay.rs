//! Replays a captured filtered stream (newline-delimited JSON, same format as
//! the live endpoint) at a fixed pace. Each `connect` starts from the top of
//! the file; the connection ends when the file is exhausted.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};

use super::twitter_stream::parse_line;
use super::{UpstreamConnection, UpstreamSource};
use crate::core::model::{matches_any, UpstreamMessage};
use crate::error::StreamResult;

pub struct ReplaySource {
    path: PathBuf,
    interval: Duration,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }
}

#[async_trait]
impl UpstreamSource for ReplaySource {
    async fn connect(&self, tracks: &[String]) -> StreamResult<UpstreamConnection> {
        let content = tokio::fs::read_to_string(&self.path).await?;

        // Like the live endpoint, only tweets matching a track are delivered.
        let tracks = tracks.to_vec();
        let messages: Vec<UpstreamMessage> = content
            .lines()
            .filter_map(parse_line)
            .filter(|message| match message {
                UpstreamMessage::Tweet(tweet) => matches_any(&tracks, &tweet.text),
                _ => true,
            })
            .collect();

        tracing::info!(path = %self.path.display(), count = messages.len(), "Replaying captured stream");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let paced = stream::unfold(
            (messages.into_iter(), ticker),
            |(mut messages, mut ticker)| async move {
                let message = messages.next()?;
                ticker.tick().await;
                Some((Ok(message), (messages, ticker)))
            },
        );
        Ok(paced.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test(start_paused = true)]
    async fn replays_matching_tweets_and_control_messages() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"id_str":"1","text":"rust is great"}}"#).unwrap();
        writeln!(file, r#"{{"id_str":"2","text":"nothing here"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"warning":{{"code":"FALLING_BEHIND","message":"slow"}}}}"#).unwrap();

        let source = ReplaySource::new(file.path(), Duration::from_millis(10));
        let connection = source.connect(&["rust".to_string()]).await.unwrap();
        let messages: Vec<_> = connection.map(|m| m.unwrap()).collect().await;

        assert_eq!(messages.len(), 2);
        assert!(matches!(&messages[0], UpstreamMessage::Tweet(t) if t.id == "1"));
        assert_eq!(messages[1], UpstreamMessage::Warning("slow".to_string()));
    }

    #[tokio::test]
    async fn missing_file_fails_the_handshake() {
        let source = ReplaySource::new("/definitely/not/here.jsonl", Duration::from_millis(1));
        assert!(source.connect(&["x".to_string()]).await.is_err());
    }
}
