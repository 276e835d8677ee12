//! # Hub Test Harness
//!
//! Boots a complete hub (filtered stream, broadcast pipeline, dispatcher and
//! HTTP endpoints) on an ephemeral local port, backed by an in-process
//! upstream that tests feed by hand.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use lib_stream::core::{
    BroadcastPipeline, Dispatcher, EmbedRenderer, FilteredStream, GateConfig, NoScorer, OEmbed, QualityGate,
    StreamConfig, Tweet,
};
use lib_stream::hub::{self, HubConfig, HubState, PollSessions};
use lib_stream::ingestors::ChannelSource;
use lib_stream::StreamResult;

/// Renders a tweet without any network access.
pub struct LocalRenderer;

#[async_trait]
impl EmbedRenderer for LocalRenderer {
    async fn render(&self, tweet: &Tweet) -> StreamResult<Option<OEmbed>> {
        Ok(Some(OEmbed {
            author_name: tweet.author_screen_name.clone(),
            author_url: format!("https://twitter.com/{}", tweet.author_screen_name),
            html: format!("<blockquote>{}</blockquote>", tweet.text),
            provider_url: "https://twitter.com".to_string(),
            kind: "rich".to_string(),
            url: tweet.status_url(),
            version: "1.0".to_string(),
            ..OEmbed::default()
        }))
    }
}

pub struct TestHub {
    pub base_url: String,
    pub source: Arc<ChannelSource>,
    pub stream: FilteredStream,
    pub dispatcher: Arc<Dispatcher>,
    pub polls: Arc<PollSessions>,
    _pipeline: Arc<BroadcastPipeline>,
    server: JoinHandle<()>,
}

impl TestHub {
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::spawn_with(HubConfig {
            poll_timeout_secs: 1,
            poll_linger_secs: 5,
        })
        .await
    }

    pub async fn spawn_with(config: HubConfig) -> anyhow::Result<Self> {
        Self::boot(config, true).await
    }

    /// A hub whose WebSocket endpoint answers 404, as behind a proxy that
    /// refuses upgrades. Only the long polling routes work.
    pub async fn spawn_without_websockets() -> anyhow::Result<Self> {
        Self::boot(
            HubConfig {
                poll_timeout_secs: 1,
                poll_linger_secs: 5,
            },
            false,
        )
        .await
    }

    async fn boot(config: HubConfig, websockets: bool) -> anyhow::Result<Self> {
        let source = Arc::new(ChannelSource::new());
        let stream = FilteredStream::new(source.clone(), StreamConfig::default());
        let dispatcher = Arc::new(Dispatcher::new());
        let pipeline = BroadcastPipeline::attach(
            &stream,
            QualityGate::new(Arc::new(NoScorer), GateConfig::default()),
            Arc::new(LocalRenderer),
            dispatcher.clone(),
        );

        let state = HubState::new(dispatcher.clone(), stream.clone(), &config);
        let polls = state.polls.clone();
        let mut router = hub::router(state);
        if !websockets {
            router = Router::new()
                .route("/streamHub", get(|| async { StatusCode::NOT_FOUND }))
                .fallback_service(router);
        }
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(Self {
            base_url: format!("http://{}", address),
            source,
            stream,
            dispatcher,
            polls,
            _pipeline: pipeline,
            server,
        })
    }

    /// Waits until exactly `count` subscribers are attached to the dispatcher.
    pub async fn wait_for_clients(&self, count: usize) -> bool {
        for _ in 0..200 {
            if self.dispatcher.client_count() == count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }
}

impl Drop for TestHub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Next value from `rx`, or `None` after five seconds.
pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .ok()
        .flatten()
}
