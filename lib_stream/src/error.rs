//! # Error Types
//!
//! Errors raised by the stream engine. Per-item failures (scoring, rendering,
//! delivery) are logged and isolated where they happen; only connection level
//! failures travel back to callers of `FilteredStream`.

use thiserror::Error;

/// Failures surfaced by the upstream connection, the external collaborators
/// and the hub protocol.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream cannot be opened because no track is configured.
    #[error("no tracks configured, the filtered stream needs at least one track")]
    NoTracks,

    /// The upstream endpoint refused or failed the connection handshake.
    #[error("upstream connection failed: {0}")]
    Connect(String),

    /// The upstream handshake did not complete in time.
    #[error("upstream handshake timed out after {0} ms")]
    HandshakeTimeout(u64),

    /// The open upstream connection failed while reading.
    #[error("upstream read failed: {0}")]
    Upstream(String),

    /// Transport level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport level HTTP failure raised by the retry middleware.
    #[error("HTTP middleware error: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// A URL could not be parsed or joined.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// A local file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A hub frame or payload was not valid protobuf.
    #[error("protocol decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The hub received an invocation it does not know how to handle.
    #[error("invalid invocation: {0}")]
    Invocation(String),
}

/// Convenience alias used throughout the engine.
pub type StreamResult<T> = Result<T, StreamError>;
