//! # Broadcast Pipeline
//!
//! Connects the filtered stream to the fan-out sink. Tweets go through the
//! quality gate and the embed renderer on their own task; lifecycle changes,
//! warnings and disconnects become status updates.
//!
//! Status updates are built and published inside the stream callback, while
//! the state the transition set is still current, so subscribers see them
//! in transition order. Publishing only enqueues onto subscriber queues.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::watch;

use crate::core::dispatcher::FanOutSink;
use crate::core::embed::EmbedRenderer;
use crate::core::gate::QualityGate;
use crate::core::model::{LifecycleKind, RawStreamItem, StreamState, Tweet};
use crate::core::stream_machine::FilteredStream;
use crate::protocol::{HubEvent, StatusUpdate};

pub struct BroadcastPipeline {
    gate: QualityGate,
    renderer: Arc<dyn EmbedRenderer>,
    sink: Arc<dyn FanOutSink>,
}

impl BroadcastPipeline {
    /// Builds the pipeline and registers it as a handler of `stream`.
    pub fn attach(
        stream: &FilteredStream,
        gate: QualityGate,
        renderer: Arc<dyn EmbedRenderer>,
        sink: Arc<dyn FanOutSink>,
    ) -> Arc<Self> {
        let pipeline = Arc::new(Self { gate, renderer, sink });

        // A state receiver rather than a stream clone: the stream owns its
        // handlers, so holding the stream here would form a cycle.
        let state = stream.subscribe_state();
        let handler = Arc::clone(&pipeline);
        stream.on_event(move |item| handler.handle(item, &state));

        pipeline
    }

    fn handle(self: &Arc<Self>, item: &RawStreamItem, state: &watch::Receiver<StreamState>) {
        match item {
            RawStreamItem::Matching(tweet) => self.spawn_tweet(Arc::clone(tweet), false),
            RawStreamItem::NonMatching(tweet) => self.spawn_tweet(Arc::clone(tweet), true),
            other => {
                let Some(message) = status_message(other) else {
                    return;
                };
                let is_streaming = *state.borrow() == StreamState::Running;
                match other {
                    RawStreamItem::Disconnect(_)
                    | RawStreamItem::Lifecycle { kind: LifecycleKind::StartFailed, .. } => {
                        tracing::warn!(is_streaming, "{}", message)
                    }
                    _ => tracing::info!(is_streaming, "{}", message),
                }

                let event = HubEvent::StatusUpdated(StatusUpdate { is_streaming, message });
                let published = std::panic::catch_unwind(AssertUnwindSafe(|| self.sink.broadcast(event)));
                if let Err(panic) = published {
                    tracing::error!(unit = "status", panic = panic_text(panic.as_ref()), "Status broadcast panicked");
                }
            }
        }
    }

    fn spawn_tweet(self: &Arc<Self>, tweet: Arc<Tweet>, is_off_topic: bool) {
        let pipeline = Arc::clone(self);
        spawn_guarded("tweet", async move {
            pipeline.process_tweet(&tweet, is_off_topic).await;
        });
    }

    /// Gate, render, broadcast. Returns whether the tweet was broadcast.
    pub async fn process_tweet(&self, tweet: &Tweet, is_off_topic: bool) -> bool {
        if !self.gate.accept(&tweet.text, tweet.possibly_sensitive).await {
            tracing::debug!(tweet_id = %tweet.id, "Tweet rejected by quality gate");
            return false;
        }

        match self.renderer.render(tweet).await {
            Ok(Some(embed)) => {
                self.sink.broadcast(HubEvent::TweetReceived(embed.into_result(is_off_topic)));
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(tweet_id = %tweet.id, error = %e, "Failed to render tweet");
                false
            }
        }
    }
}

/// Subscriber facing status text for a non-tweet item.
pub fn status_message(item: &RawStreamItem) -> Option<String> {
    let message = match item {
        RawStreamItem::Matching(_) | RawStreamItem::NonMatching(_) => return None,
        RawStreamItem::Lifecycle { kind, detail } => {
            let detail = detail.as_deref().unwrap_or("");
            match kind {
                LifecycleKind::Started => "Twitter stream started...".to_string(),
                LifecycleKind::Resumed => "Twitter stream resumed...".to_string(),
                LifecycleKind::Paused => "Twitter stream paused...".to_string(),
                LifecycleKind::Stopped => format!("Twitter stream stopped {}...", detail),
                LifecycleKind::StartFailed => format!("Twitter stream failed to start, {}...", detail),
            }
        }
        RawStreamItem::Disconnect(reason) => format!("Twitter stream disconnected, {}...", reason),
        RawStreamItem::Warning(message) => format!("Twitter stream falling behind, {}...", message),
    };
    Some(message)
}

fn spawn_guarded<F>(unit: &'static str, work: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(work).catch_unwind().await {
            tracing::error!(unit, panic = panic_text(panic.as_ref()), "Pipeline task panicked");
        }
    });
}

fn panic_text(panic: &(dyn Any + Send)) -> &str {
    if let Some(text) = panic.downcast_ref::<&'static str>() {
        text
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.as_str()
    } else {
        "unknown panic"
    }
}
