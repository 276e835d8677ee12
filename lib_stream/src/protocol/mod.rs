//! # Hub Wire Protocol
//!
//! Compact binary frames exchanged between the hub and its subscribers. All
//! messages are Protocol Buffers, declared with `prost` derives so no schema
//! compilation step is needed.
//!
//! A WebSocket session carries one [`HubFrame`] per binary message. The long
//! polling transport carries the same frames, length-delimited and
//! concatenated in a single HTTP body.

use bytes::{Buf, Bytes};
use prost::Message;

use crate::error::StreamResult;

/// Event pushed for every accepted tweet.
pub const TWEET_RECEIVED: &str = "TweetReceived";
/// Event pushed for every lifecycle transition, warning and disconnect.
pub const STATUS_UPDATED: &str = "StatusUpdated";

/// Client invocable methods.
pub mod methods {
    /// `AddTracks(tracks...)`
    pub const ADD_TRACKS: &str = "AddTracks";
    /// `RemoveTrack(track)`
    pub const REMOVE_TRACK: &str = "RemoveTrack";
    /// `StartTweetStream()`
    pub const START: &str = "StartTweetStream";
    /// `PauseTweetStream()`
    pub const PAUSE: &str = "PauseTweetStream";
    /// `StopTweetStream()`
    pub const STOP: &str = "StopTweetStream";
}

/// Envelope for everything that travels over a hub session.
#[derive(Clone, PartialEq, Message)]
pub struct HubFrame {
    #[prost(oneof = "hub_frame::Kind", tags = "1, 2, 3, 4")]
    pub kind: Option<hub_frame::Kind>,
}

/// Variants of [`HubFrame`].
pub mod hub_frame {
    /// The frame body.
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "1")]
        Invocation(super::Invocation),
        #[prost(message, tag = "2")]
        Event(super::Event),
        #[prost(message, tag = "3")]
        Completion(super::Completion),
        #[prost(message, tag = "4")]
        Ping(super::Ping),
    }
}

/// Client to server method call.
#[derive(Clone, PartialEq, Message)]
pub struct Invocation {
    #[prost(uint64, tag = "1")]
    pub invocation_id: u64,
    #[prost(string, tag = "2")]
    pub target: String,
    #[prost(string, repeated, tag = "3")]
    pub arguments: Vec<String>,
}

/// Server to client broadcast.
#[derive(Clone, PartialEq, Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub target: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

/// Result of an [`Invocation`]; `error` is unset on success.
#[derive(Clone, PartialEq, Message)]
pub struct Completion {
    #[prost(uint64, tag = "1")]
    pub invocation_id: u64,
    #[prost(string, optional, tag = "2")]
    pub error: Option<String>,
}

/// Keep-alive.
#[derive(Clone, PartialEq, Message)]
pub struct Ping {}

/// Payload of [`TWEET_RECEIVED`]: an accepted tweet in embeddable form.
#[derive(Clone, PartialEq, Message)]
pub struct EmbedResult {
    #[prost(bool, tag = "1")]
    pub is_off_topic: bool,
    #[prost(string, tag = "2")]
    pub author_name: String,
    #[prost(string, tag = "3")]
    pub author_url: String,
    #[prost(string, tag = "4")]
    pub cache_age: String,
    #[prost(uint32, optional, tag = "5")]
    pub height: Option<u32>,
    #[prost(string, tag = "6")]
    pub html: String,
    #[prost(string, tag = "7")]
    pub provider_url: String,
    #[prost(string, tag = "8")]
    pub r#type: String,
    #[prost(string, tag = "9")]
    pub url: String,
    #[prost(string, tag = "10")]
    pub version: String,
    #[prost(uint32, optional, tag = "11")]
    pub width: Option<u32>,
}

/// Payload of [`STATUS_UPDATED`].
#[derive(Clone, PartialEq, Message)]
pub struct StatusUpdate {
    #[prost(bool, tag = "1")]
    pub is_streaming: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// A typed event ready to be fanned out.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    TweetReceived(EmbedResult),
    StatusUpdated(StatusUpdate),
}

impl HubEvent {
    /// The wire name of the event.
    pub fn target(&self) -> &'static str {
        match self {
            HubEvent::TweetReceived(_) => TWEET_RECEIVED,
            HubEvent::StatusUpdated(_) => STATUS_UPDATED,
        }
    }

    /// Wraps the event into a frame.
    pub fn into_frame(self) -> HubFrame {
        let target = self.target().to_string();
        let payload = match self {
            HubEvent::TweetReceived(embed) => embed.encode_to_vec(),
            HubEvent::StatusUpdated(status) => status.encode_to_vec(),
        };
        HubFrame::event(target, payload)
    }
}

impl HubFrame {
    pub fn invocation(invocation_id: u64, target: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            kind: Some(hub_frame::Kind::Invocation(Invocation {
                invocation_id,
                target: target.into(),
                arguments,
            })),
        }
    }

    pub fn event(target: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: Some(hub_frame::Kind::Event(Event {
                target: target.into(),
                payload,
            })),
        }
    }

    pub fn completion(invocation_id: u64, error: Option<String>) -> Self {
        Self {
            kind: Some(hub_frame::Kind::Completion(Completion { invocation_id, error })),
        }
    }

    pub fn ping() -> Self {
        Self {
            kind: Some(hub_frame::Kind::Ping(Ping {})),
        }
    }
}

/// Appends an already encoded frame to a long polling body.
pub fn append_delimited(body: &mut Vec<u8>, encoded: &[u8]) {
    prost::encoding::encode_varint(encoded.len() as u64, body);
    body.extend_from_slice(encoded);
}

/// Decodes a long polling body built with [`append_delimited`].
pub fn decode_batch(mut body: Bytes) -> StreamResult<Vec<HubFrame>> {
    let mut frames = Vec::new();
    while body.has_remaining() {
        frames.push(HubFrame::decode_length_delimited(&mut body)?);
    }
    Ok(frames)
}
