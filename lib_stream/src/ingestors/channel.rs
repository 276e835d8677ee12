//! In-process upstream driven by the caller. Every `connect` opens a fresh
//! channel; the caller pushes messages into the most recent one.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, watch};

use super::{UpstreamConnection, UpstreamSource};
use crate::core::model::{Tweet, UpstreamMessage};
use crate::error::{StreamError, StreamResult};

type Feed = mpsc::UnboundedSender<StreamResult<UpstreamMessage>>;

#[derive(Default)]
struct ChannelInner {
    current: Option<Feed>,
    calls: Vec<Vec<String>>,
    fail_next: Option<String>,
}

pub struct ChannelSource {
    inner: Mutex<ChannelInner>,
    connects: watch::Sender<usize>,
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSource {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ChannelInner::default()),
            connects: watch::channel(0).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pushes a message into the open connection. False when none is open.
    pub fn push(&self, message: UpstreamMessage) -> bool {
        self.lock()
            .current
            .as_ref()
            .is_some_and(|feed| feed.send(Ok(message)).is_ok())
    }

    pub fn push_tweet(&self, id: &str, author: &str, text: &str, possibly_sensitive: bool) -> bool {
        self.push(UpstreamMessage::Tweet(Tweet {
            id: id.to_string(),
            text: text.to_string(),
            possibly_sensitive,
            author_screen_name: author.to_string(),
        }))
    }

    /// Ends the open connection as if the remote side closed it.
    pub fn close_current(&self) {
        self.lock().current = None;
    }

    /// Ends the open connection with a read error.
    pub fn fail_current(&self, reason: &str) {
        if let Some(feed) = self.lock().current.take() {
            let _ = feed.send(Err(StreamError::Upstream(reason.to_string())));
        }
    }

    /// Makes the next `connect` fail with `reason`.
    pub fn fail_next_connect(&self, reason: &str) {
        self.lock().fail_next = Some(reason.to_string());
    }

    /// Tracks passed to every successful or failed `connect`, oldest first.
    pub fn connect_calls(&self) -> Vec<Vec<String>> {
        self.lock().calls.clone()
    }

    /// True while a connection handed out by this source is still being read.
    pub fn is_connected(&self) -> bool {
        self.lock().current.as_ref().is_some_and(|feed| !feed.is_closed())
    }

    /// Waits until `connect` has been called at least `count` times.
    pub async fn wait_for_connects(&self, count: usize) {
        let mut calls = self.connects.subscribe();
        let _ = calls.wait_for(|seen| *seen >= count).await;
    }
}

#[async_trait]
impl UpstreamSource for ChannelSource {
    async fn connect(&self, tracks: &[String]) -> StreamResult<UpstreamConnection> {
        let result = {
            let mut inner = self.lock();
            inner.calls.push(tracks.to_vec());
            match inner.fail_next.take() {
                Some(reason) => Err(StreamError::Connect(reason)),
                None => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    inner.current = Some(tx);
                    Ok(rx)
                }
            }
        };
        self.connects.send_modify(|seen| *seen += 1);

        let rx = result?;
        let connection = stream::unfold(rx, |mut rx| async move {
            let message = rx.recv().await?;
            Some((message, rx))
        });
        Ok(connection.boxed())
    }
}
