use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use lib_stream::core::{
    BroadcastPipeline, Dispatcher, FilteredStream, HttpSentimentScorer, NoScorer, OEmbedRenderer, QualityGate,
    SentimentScorer,
};
use lib_stream::hub::{self, HubState};
use lib_stream::ingestors::{ReplaySource, TwitterStreamSource, UpstreamSource};

use super::config::Config;

/// Everything the server process owns.
pub struct App {
    pub stream: FilteredStream,
    pub dispatcher: Arc<Dispatcher>,
    pub router: axum::Router,
    _pipeline: Arc<BroadcastPipeline>,
}

pub fn build(config: &Config) -> Result<App> {
    let source: Arc<dyn UpstreamSource> = match &config.replay_file {
        Some(path) => {
            let interval = Duration::from_millis(config.replay_interval_ms.unwrap_or(500));
            tracing::info!(file = %path.display(), "Using replay upstream");
            Arc::new(ReplaySource::new(path.clone(), interval))
        }
        None => {
            let twitter = config.twitter_config();
            if twitter.bearer_token.is_none() {
                tracing::warn!("No upstream bearer token configured, the filtered stream will likely refuse connections");
            }
            Arc::new(TwitterStreamSource::new(twitter)?)
        }
    };

    let scorer: Arc<dyn SentimentScorer> = match &config.scorer_url {
        Some(url) => Arc::new(HttpSentimentScorer::new(url)?),
        None => {
            tracing::warn!("No sentiment scorer configured, tweets flagged as possibly sensitive will be dropped");
            Arc::new(NoScorer)
        }
    };

    let oembed_url = config
        .oembed_url
        .as_deref()
        .unwrap_or("https://publish.twitter.com/oembed");
    let renderer = Arc::new(OEmbedRenderer::new(oembed_url)?);

    let stream = FilteredStream::new(source, config.stream_config());
    let dispatcher = Arc::new(Dispatcher::new());
    let pipeline = BroadcastPipeline::attach(
        &stream,
        QualityGate::new(scorer, config.gate_config()),
        renderer,
        dispatcher.clone(),
    );

    let state = HubState::new(dispatcher.clone(), stream.clone(), &config.hub_config());
    Ok(App {
        stream,
        dispatcher,
        router: hub::router(state),
        _pipeline: pipeline,
    })
}

/// Opens the stream at boot when tracks are configured and autostart is on.
/// A failure is logged and surfaced to subscribers; the hub keeps serving.
pub async fn autostart(app: &App, config: &Config) {
    if !config.autostart.unwrap_or(true) {
        return;
    }
    if app.stream.tracks().await.is_empty() {
        tracing::info!("No initial tracks, waiting for subscribers to add some");
        return;
    }
    if let Err(e) = app.stream.start().await {
        tracing::error!(error = %e, "Initial stream start failed");
    }
}
