//! # Filtered Stream State Machine
//!
//! Owns the single upstream connection and the set of tracks it is filtered
//! on, and moves between `Stopped`, `Running` and `Paused`.
//!
//! Every operation takes the same async mutex, so transitions never
//! interleave. The state itself lives in a `watch` channel: it is updated
//! before handlers are notified, which lets a handler read the state the
//! transition just set.
//!
//! While a connection is open a reader task pulls messages from it. When the
//! connection ends on its own the reader moves the machine to `Stopped`,
//! unless the connection was already replaced or stopped (stale reader).

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::model::{matches_any, LifecycleKind, RawStreamItem, StreamState, UpstreamMessage};
use crate::error::{StreamError, StreamResult};
use crate::ingestors::{UpstreamConnection, UpstreamSource};

/// Callback registered with [`FilteredStream::on_event`].
pub type StreamHandler = Arc<dyn Fn(&RawStreamItem) + Send + Sync>;

/// State machine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamConfig {
    /// Upper bound for opening the upstream connection.
    pub handshake_timeout_ms: u64,
    /// Tracks the stream starts out with. Nothing connects until `start`.
    pub initial_tracks: Vec<String>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 15_000,
            initial_tracks: Vec::new(),
        }
    }
}

struct ReaderHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    tracks: Vec<String>,
    reader: Option<ReaderHandle>,
    /// Bumped whenever a connection is opened or dropped. A reader whose
    /// generation is behind is stale.
    generation: u64,
}

struct Shared {
    source: Arc<dyn UpstreamSource>,
    inner: Mutex<Inner>,
    state: watch::Sender<StreamState>,
    handlers: RwLock<Vec<StreamHandler>>,
    config: StreamConfig,
}

/// Cloneable handle to the filtered stream.
#[derive(Clone)]
pub struct FilteredStream {
    shared: Arc<Shared>,
}

impl FilteredStream {
    pub fn new(source: Arc<dyn UpstreamSource>, config: StreamConfig) -> Self {
        let (state, _) = watch::channel(StreamState::Stopped);
        let mut tracks: Vec<String> = Vec::new();
        for track in &config.initial_tracks {
            if !track.trim().is_empty() && !tracks.contains(track) {
                tracks.push(track.clone());
            }
        }
        Self {
            shared: Arc::new(Shared {
                source,
                inner: Mutex::new(Inner {
                    tracks,
                    ..Inner::default()
                }),
                state,
                handlers: RwLock::new(Vec::new()),
                config,
            }),
        }
    }

    /// Registers a handler. Handlers run synchronously, in registration
    /// order, on the task that caused the event; they must not block.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&RawStreamItem) + Send + Sync + 'static,
    {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    pub fn state(&self) -> StreamState {
        self.shared.current_state()
    }

    /// Observes state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state.subscribe()
    }

    /// Snapshot of the tracks, in insertion order.
    pub async fn tracks(&self) -> Vec<String> {
        self.shared.inner.lock().await.tracks.clone()
    }

    /// Adds tracks, restarting the connection so the upstream filter picks
    /// them up. Duplicates and blank entries are ignored.
    pub async fn add_tracks<I, S>(&self, tracks: I) -> StreamResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inner = self.shared.inner.lock().await;
        self.shared.stop_locked(&mut inner).await;

        for track in tracks {
            let track = track.into();
            if track.trim().is_empty() || inner.tracks.contains(&track) {
                continue;
            }
            tracing::info!(track = %track, "Track added");
            inner.tracks.push(track);
        }

        self.shared.restart_locked(&mut inner).await
    }

    /// Removes a track, restarting the connection when tracks remain.
    pub async fn remove_track(&self, track: &str) -> StreamResult<()> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.stop_locked(&mut inner).await;

        if let Some(pos) = inner.tracks.iter().position(|t| t == track) {
            inner.tracks.remove(pos);
            tracing::info!(track = %track, "Track removed");
        }

        self.shared.restart_locked(&mut inner).await
    }

    /// Opens the connection, or resumes delivery when paused.
    pub async fn start(&self) -> StreamResult<()> {
        let mut inner = self.shared.inner.lock().await;
        self.shared.start_locked(&mut inner).await
    }

    /// Stops delivering tweets while keeping the connection open.
    pub async fn pause(&self) {
        let _inner = self.shared.inner.lock().await;
        if self.shared.current_state() == StreamState::Running {
            self.shared.transition(StreamState::Paused, RawStreamItem::lifecycle(LifecycleKind::Paused));
        }
    }

    /// Closes the connection. Returns once the reader dropped it.
    pub async fn stop(&self) {
        let mut inner = self.shared.inner.lock().await;
        self.shared.stop_locked(&mut inner).await;
    }
}

impl Shared {
    fn current_state(&self) -> StreamState {
        *self.state.borrow()
    }

    fn emit(&self, item: &RawStreamItem) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(item);
        }
    }

    fn transition(&self, state: StreamState, item: RawStreamItem) {
        let previous = self.state.send_replace(state);
        tracing::info!(from = %previous, to = %state, "Filtered stream transition");
        self.emit(&item);
    }

    async fn restart_locked(self: &Arc<Self>, inner: &mut Inner) -> StreamResult<()> {
        if inner.tracks.is_empty() {
            return Ok(());
        }
        self.start_locked(inner).await
    }

    async fn start_locked(self: &Arc<Self>, inner: &mut Inner) -> StreamResult<()> {
        match self.current_state() {
            StreamState::Running => return Ok(()),
            StreamState::Paused => {
                self.transition(StreamState::Running, RawStreamItem::lifecycle(LifecycleKind::Resumed));
                return Ok(());
            }
            StreamState::Stopped => {}
        }

        let connection = match self.open(&inner.tracks).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(error = %e, "Filtered stream failed to start");
                self.emit(&RawStreamItem::Lifecycle {
                    kind: LifecycleKind::StartFailed,
                    detail: Some(e.to_string()),
                });
                return Err(e);
            }
        };

        inner.generation += 1;
        self.transition(StreamState::Running, RawStreamItem::lifecycle(LifecycleKind::Started));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(self).read(
            connection,
            inner.tracks.clone(),
            inner.generation,
            cancel.clone(),
        ));
        inner.reader = Some(ReaderHandle { cancel, task });
        Ok(())
    }

    async fn open(&self, tracks: &[String]) -> StreamResult<UpstreamConnection> {
        if tracks.is_empty() {
            return Err(StreamError::NoTracks);
        }
        let limit = Duration::from_millis(self.config.handshake_timeout_ms);
        match tokio::time::timeout(limit, self.source.connect(tracks)).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::HandshakeTimeout(self.config.handshake_timeout_ms)),
        }
    }

    async fn stop_locked(&self, inner: &mut Inner) {
        if let Some(reader) = inner.reader.take() {
            reader.cancel.cancel();
            if let Err(e) = reader.task.await {
                tracing::error!(error = %e, "Filtered stream reader ended abnormally");
            }
            inner.generation += 1;
        }

        if self.current_state() != StreamState::Stopped {
            self.transition(
                StreamState::Stopped,
                RawStreamItem::Lifecycle {
                    kind: LifecycleKind::Stopped,
                    detail: None,
                },
            );
        }
    }

    async fn read(
        self: Arc<Self>,
        mut connection: UpstreamConnection,
        tracks: Vec<String>,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let mut last_disconnect: Option<String> = None;

        let detail = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = connection.next() => next,
            };

            match next {
                Some(Ok(UpstreamMessage::Tweet(tweet))) => {
                    if self.current_state() != StreamState::Running {
                        continue;
                    }
                    let tweet = Arc::new(tweet);
                    let item = if matches_any(&tracks, &tweet.text) {
                        RawStreamItem::Matching(tweet)
                    } else {
                        RawStreamItem::NonMatching(tweet)
                    };
                    self.emit(&item);
                }
                Some(Ok(UpstreamMessage::Warning(message))) => {
                    self.emit(&RawStreamItem::Warning(message));
                }
                Some(Ok(UpstreamMessage::Disconnect(reason))) => {
                    self.emit(&RawStreamItem::Disconnect(reason.clone()));
                    last_disconnect = Some(reason);
                }
                Some(Err(e)) => break Some(e.to_string()),
                None => break last_disconnect,
            }
        };
        drop(connection);

        let mut inner = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            inner = self.inner.lock() => inner,
        };
        if inner.generation != generation {
            return;
        }

        tracing::warn!(detail = detail.as_deref().unwrap_or(""), "Filtered stream connection ended");
        inner.reader = None;
        inner.generation += 1;
        self.transition(
            StreamState::Stopped,
            RawStreamItem::Lifecycle {
                kind: LifecycleKind::Stopped,
                detail,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestors::ChannelSource;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn recorded(stream: &FilteredStream) -> mpsc::UnboundedReceiver<(RawStreamItem, StreamState)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let observed = stream.subscribe_state();
        stream.on_event(move |item| {
            let state = *observed.borrow();
            let _ = tx.send((item.clone(), state));
        });
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<(RawStreamItem, StreamState)>) -> Vec<RawStreamItem> {
        let mut items = Vec::new();
        while let Ok((item, _)) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    fn lifecycle(kind: LifecycleKind) -> RawStreamItem {
        RawStreamItem::lifecycle(kind)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<(RawStreamItem, StreamState)>) -> RawStreamItem {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event expected")
            .expect("channel open")
            .0
    }

    fn setup() -> (Arc<ChannelSource>, FilteredStream) {
        let source = Arc::new(ChannelSource::new());
        let stream = FilteredStream::new(source.clone(), StreamConfig::default());
        (source, stream)
    }

    #[tokio::test]
    async fn start_without_tracks_fails_and_stays_stopped() {
        let (source, stream) = setup();
        let mut rx = recorded(&stream);

        assert!(matches!(stream.start().await, Err(StreamError::NoTracks)));
        assert_eq!(stream.state(), StreamState::Stopped);
        assert!(source.connect_calls().is_empty());
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [RawStreamItem::Lifecycle { kind: LifecycleKind::StartFailed, .. }]
        ));
    }

    #[tokio::test]
    async fn repeated_operations_are_idempotent() {
        let (source, stream) = setup();
        stream.add_tracks(["rust"]).await.unwrap();
        let mut rx = recorded(&stream);

        stream.start().await.unwrap();
        assert_eq!(source.connect_calls().len(), 1);
        assert!(drain(&mut rx).is_empty());

        stream.pause().await;
        stream.pause().await;
        assert_eq!(drain(&mut rx), vec![lifecycle(LifecycleKind::Paused)]);

        stream.stop().await;
        stream.stop().await;
        stream.pause().await;
        assert_eq!(
            drain(&mut rx),
            vec![RawStreamItem::Lifecycle { kind: LifecycleKind::Stopped, detail: None }]
        );
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn mutation_closes_before_reopening() {
        let (source, stream) = setup();
        let mut rx = recorded(&stream);

        stream.add_tracks(["a"]).await.unwrap();
        stream.add_tracks(["x"]).await.unwrap();

        assert_eq!(
            drain(&mut rx),
            vec![
                lifecycle(LifecycleKind::Started),
                RawStreamItem::Lifecycle { kind: LifecycleKind::Stopped, detail: None },
                lifecycle(LifecycleKind::Started),
            ]
        );
        assert_eq!(
            source.connect_calls(),
            vec![vec!["a".to_string()], vec!["a".to_string(), "x".to_string()]]
        );
        assert_eq!(stream.state(), StreamState::Running);
    }

    #[tokio::test]
    async fn duplicate_tracks_still_restart() {
        let (source, stream) = setup();
        stream.add_tracks(["a", "a", " "]).await.unwrap();
        stream.add_tracks(Vec::<String>::new()).await.unwrap();

        assert_eq!(stream.tracks().await, vec!["a".to_string()]);
        assert_eq!(source.connect_calls().len(), 2);
    }

    #[tokio::test]
    async fn removing_last_track_leaves_stream_stopped() {
        let (source, stream) = setup();
        stream.add_tracks(["a"]).await.unwrap();
        stream.remove_track("a").await.unwrap();

        assert_eq!(stream.state(), StreamState::Stopped);
        assert!(stream.tracks().await.is_empty());
        assert_eq!(source.connect_calls().len(), 1);
    }

    #[tokio::test]
    async fn paused_stream_resumes_on_start_without_reconnecting() {
        let (source, stream) = setup();
        stream.add_tracks(["a"]).await.unwrap();
        stream.pause().await;
        let mut rx = recorded(&stream);

        stream.start().await.unwrap();
        assert_eq!(drain(&mut rx), vec![lifecycle(LifecycleKind::Resumed)]);
        assert_eq!(source.connect_calls().len(), 1);
    }

    #[tokio::test]
    async fn handlers_observe_the_new_state() {
        let (_source, stream) = setup();
        let mut rx = recorded(&stream);

        stream.add_tracks(["a"]).await.unwrap();
        stream.pause().await;
        stream.start().await.unwrap();
        stream.stop().await;

        let states: Vec<StreamState> = std::iter::from_fn(|| rx.try_recv().ok()).map(|(_, s)| s).collect();
        assert_eq!(
            states,
            vec![StreamState::Running, StreamState::Paused, StreamState::Running, StreamState::Stopped]
        );
    }

    #[tokio::test]
    async fn tweets_are_classified_and_dropped_while_paused() {
        let (source, stream) = setup();
        stream.add_tracks(["rust lang"]).await.unwrap();
        let mut rx = recorded(&stream);

        source.push_tweet("1", "X", "Rust is a LANG", false);
        source.push_tweet("2", "X", "just rust", false);
        assert!(matches!(next(&mut rx).await, RawStreamItem::Matching(t) if t.id == "1"));
        assert!(matches!(next(&mut rx).await, RawStreamItem::NonMatching(t) if t.id == "2"));

        stream.pause().await;
        assert_eq!(next(&mut rx).await, lifecycle(LifecycleKind::Paused));
        source.push_tweet("3", "X", "rust lang", false);
        source.push(UpstreamMessage::Warning("falling behind".into()));
        assert_eq!(next(&mut rx).await, RawStreamItem::Warning("falling behind".into()));
    }

    #[tokio::test]
    async fn remote_close_stops_with_the_disconnect_reason() {
        let (source, stream) = setup();
        stream.add_tracks(["a"]).await.unwrap();
        let mut rx = recorded(&stream);

        source.push(UpstreamMessage::Disconnect("admin logout".into()));
        source.close_current();

        assert_eq!(next(&mut rx).await, RawStreamItem::Disconnect("admin logout".into()));
        assert_eq!(
            next(&mut rx).await,
            RawStreamItem::Lifecycle {
                kind: LifecycleKind::Stopped,
                detail: Some("admin logout".into())
            }
        );
        assert_eq!(stream.state(), StreamState::Stopped);

        stream.start().await.unwrap();
        assert_eq!(source.connect_calls().len(), 2);
    }

    #[tokio::test]
    async fn read_error_stops_with_the_error_text() {
        let (source, stream) = setup();
        stream.add_tracks(["a"]).await.unwrap();
        let mut rx = recorded(&stream);

        source.fail_current("connection reset");
        match next(&mut rx).await {
            RawStreamItem::Lifecycle { kind: LifecycleKind::Stopped, detail: Some(detail) } => {
                assert!(detail.contains("connection reset"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_connect_keeps_state_and_reports() {
        let (source, stream) = setup();
        source.fail_next_connect("401 Unauthorized");
        let mut rx = recorded(&stream);

        assert!(stream.add_tracks(["a"]).await.is_err());
        assert_eq!(stream.state(), StreamState::Stopped);
        match drain(&mut rx).as_slice() {
            [RawStreamItem::Lifecycle { kind: LifecycleKind::StartFailed, detail: Some(detail) }] => {
                assert!(detail.contains("401 Unauthorized"));
            }
            other => panic!("unexpected {:?}", other),
        }

        stream.start().await.unwrap();
        assert_eq!(stream.state(), StreamState::Running);
    }

    #[tokio::test]
    async fn initial_tracks_wait_for_start() {
        let source = Arc::new(ChannelSource::new());
        let config = StreamConfig {
            initial_tracks: vec!["a".into(), "a".into(), "b".into()],
            ..StreamConfig::default()
        };
        let stream = FilteredStream::new(source.clone(), config);

        assert_eq!(stream.tracks().await, vec!["a".to_string(), "b".to_string()]);
        assert!(source.connect_calls().is_empty());

        stream.start().await.unwrap();
        assert_eq!(source.connect_calls(), vec![vec!["a".to_string(), "b".to_string()]]);
    }

    struct HangingSource;

    #[async_trait]
    impl UpstreamSource for HangingSource {
        async fn connect(&self, _tracks: &[String]) -> StreamResult<UpstreamConnection> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_is_bounded() {
        let stream = FilteredStream::new(
            Arc::new(HangingSource),
            StreamConfig {
                handshake_timeout_ms: 500,
                ..StreamConfig::default()
            },
        );
        let result = stream.add_tracks(["a"]).await;
        assert!(matches!(result, Err(StreamError::HandshakeTimeout(500))));
        assert_eq!(stream.state(), StreamState::Stopped);
    }
}
