//! # lib_stream
//!
//! Engine of the filtered tweet stream hub: one upstream filtered stream,
//! a quality gate, an embed renderer, and fan-out of accepted tweets and
//! status updates to every connected subscriber.
//!
//! ```text
//!  UpstreamSource ──> FilteredStream ──> BroadcastPipeline ──> Dispatcher ──> hub sessions
//!                         ^                 (gate, embed)                        │
//!                         └────────────── invocations (AddTracks, Start, ...) ◄──┘
//! ```
//!
//! The [`client`] module is the subscriber side of the same protocol.

/// Error types of the engine.
pub mod error;
/// Binary wire protocol shared by the hub and its clients.
pub mod protocol;
/// State machine, gate, rendering, pipeline and fan-out.
pub mod core;
/// Upstream sources.
pub mod ingestors;
/// Generic HTTP clients.
pub mod retrieve;
/// Subscriber facing endpoints.
pub mod hub;
/// Reconnecting subscriber session.
pub mod client;
/// `tracing` subscriber setup.
pub mod loggers;

pub use crate::client::{ClientError, ClientOptions, ConnectionState, ReconnectPolicy, StreamHubClient, Transport};
pub use crate::core::{
    BroadcastPipeline, Dispatcher, FanOutSink, FilteredStream, GateConfig, QualityGate, StreamConfig, StreamState,
};
pub use crate::error::{StreamError, StreamResult};
pub use crate::hub::{router, HubConfig, HubState};

#[cfg(test)]
mod test_http;
