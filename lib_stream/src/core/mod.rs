//! # Core Engine Module
//!
//! The stream engine proper: what a tweet goes through between the upstream
//! connection and the subscribers.
//!
//! ## Core Components:
//!
//! - **`stream_machine`**: `FilteredStream`, the state machine that owns the
//!   single upstream connection and its tracks (`Stopped`, `Running`,
//!   `Paused`).
//!
//! - **`gate`**: the quality gate. Tweets flagged as possibly sensitive must
//!   score high enough on the external sentiment scorer to pass.
//!
//! - **`embed`**: renders accepted tweets into their oEmbed form.
//!
//! - **`pipeline`**: wires the stream to the gate, the renderer and the
//!   fan-out sink, and turns lifecycle changes into status updates.
//!
//! - **`dispatcher`**: the fan-out sink. Encodes every event once and shares
//!   it across subscriber queues.

/// Domain types shared across the engine.
pub mod model;
/// Sentiment based quality gate.
pub mod gate;
/// oEmbed rendering of accepted tweets.
pub mod embed;
/// The filtered stream state machine.
pub mod stream_machine;
/// Stream to subscribers pipeline.
pub mod pipeline;
/// Fan-out of encoded hub frames to subscriber queues.
pub mod dispatcher;

pub use dispatcher::{Dispatcher, FanOutSink};
pub use embed::{EmbedRenderer, OEmbed, OEmbedRenderer};
pub use gate::{GateConfig, HttpSentimentScorer, NoScorer, QualityGate, SentimentScorer};
pub use model::{LifecycleKind, RawStreamItem, StreamState, Tweet, UpstreamMessage};
pub use pipeline::BroadcastPipeline;
pub use stream_machine::{FilteredStream, StreamConfig};
