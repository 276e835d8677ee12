//! # Upstream Ingestors
//!
//! Clients for the sources that feed the filtered stream. Each ingestor opens
//! one connection per `connect` call and yields [`UpstreamMessage`]s until the
//! remote side closes it or the caller drops the stream.
//!
//! ## Contained Modules:
//! - **`twitter_stream`**: the HTTP filtered stream client (newline-delimited
//!   JSON over a long-lived response body).
//! - **`replay`**: replays a captured stream from a file, for offline demos.
//! - **`channel`**: an in-process source driven by the caller (tests).

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::core::model::UpstreamMessage;
use crate::error::StreamResult;

/// The HTTP filtered stream client.
pub mod twitter_stream;
/// File replay source.
pub mod replay;
/// In-process source for tests.
#[cfg(any(test, feature = "testing"))]
pub mod channel;

pub use replay::ReplaySource;
pub use twitter_stream::{TwitterStreamConfig, TwitterStreamSource};
#[cfg(any(test, feature = "testing"))]
pub use channel::ChannelSource;

/// An open upstream connection. Dropping it closes the connection.
pub type UpstreamConnection = BoxStream<'static, StreamResult<UpstreamMessage>>;

/// A filtered stream provider.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Opens a connection filtered on `tracks`. Resolves once the handshake
    /// completed, so an `Ok` means the connection is live.
    async fn connect(&self, tracks: &[String]) -> StreamResult<UpstreamConnection>;
}
