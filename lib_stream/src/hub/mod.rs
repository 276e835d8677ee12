//! # Stream Hub Endpoints
//!
//! The subscriber facing side of the service, as an axum router:
//!
//! | Route                         | Purpose                                   |
//! |-------------------------------|-------------------------------------------|
//! | `GET /streamHub`              | WebSocket session, binary frames          |
//! | `POST /streamHub/poll`        | open a long polling session               |
//! | `GET /streamHub/poll/{id}`    | wait for queued frames                    |
//! | `POST /streamHub/poll/{id}`   | send one frame (invocation)               |
//! | `DELETE /streamHub/poll/{id}` | close a long polling session              |
//! | `GET /health`                 | liveness                                  |
//!
//! Both transports register a queue with the [`Dispatcher`]. Invocations
//! are executed on their own task and answered with a completion frame
//! routed to the calling subscriber only.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use prost::Message as ProstMessage;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::core::dispatcher::Dispatcher;
use crate::core::stream_machine::FilteredStream;
use crate::error::StreamError;
use crate::protocol::{self, hub_frame, methods, HubFrame, Invocation};

pub mod poll;

pub use poll::PollSessions;

/// Hub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HubConfig {
    /// How long a poll request waits for frames before returning empty.
    pub poll_timeout_secs: u64,
    /// How long an idle long polling session is kept.
    pub poll_linger_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            poll_timeout_secs: 30,
            poll_linger_secs: 60,
        }
    }
}

#[derive(Clone)]
pub struct HubState {
    pub dispatcher: Arc<Dispatcher>,
    pub stream: FilteredStream,
    pub polls: Arc<PollSessions>,
    poll_timeout: Duration,
}

impl HubState {
    pub fn new(dispatcher: Arc<Dispatcher>, stream: FilteredStream, config: &HubConfig) -> Self {
        let polls = PollSessions::new(
            Arc::clone(&dispatcher),
            Duration::from_secs(config.poll_linger_secs),
        );
        Self {
            dispatcher,
            stream,
            polls: Arc::new(polls),
            poll_timeout: Duration::from_secs(config.poll_timeout_secs),
        }
    }

    /// Handles a frame received from subscriber `client_id`.
    fn handle_frame(&self, client_id: u64, frame: HubFrame) {
        match frame.kind {
            Some(hub_frame::Kind::Invocation(invocation)) => {
                let stream = self.stream.clone();
                let dispatcher = Arc::clone(&self.dispatcher);
                tokio::spawn(async move {
                    let completion = dispatch_invocation(&stream, invocation).await;
                    if !dispatcher.send_to(client_id, &completion) {
                        tracing::debug!(client_id, "Subscriber left before its completion was sent");
                    }
                });
            }
            Some(hub_frame::Kind::Ping(_)) => {
                self.dispatcher.send_to(client_id, &HubFrame::ping());
            }
            other => {
                tracing::debug!(client_id, frame = ?other, "Ignoring unexpected frame from subscriber");
            }
        }
    }
}

pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/streamHub", get(ws_handler))
        .route("/streamHub/poll", post(poll_open))
        .route(
            "/streamHub/poll/{id}",
            get(poll_receive).post(poll_send).delete(poll_close),
        )
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs one invocation against the stream and builds its completion.
pub async fn dispatch_invocation(stream: &FilteredStream, invocation: Invocation) -> HubFrame {
    let Invocation {
        invocation_id,
        target,
        arguments,
    } = invocation;
    tracing::info!(invocation_id, method = %target, args = ?arguments, "Invocation received");

    let result = match target.as_str() {
        methods::ADD_TRACKS => stream.add_tracks(arguments).await,
        methods::REMOVE_TRACK => match arguments.first() {
            Some(track) => stream.remove_track(track).await,
            None => Err(StreamError::Invocation(
                "RemoveTrack expects the track to remove".to_string(),
            )),
        },
        methods::START => stream.start().await,
        methods::PAUSE => {
            stream.pause().await;
            Ok(())
        }
        methods::STOP => {
            stream.stop().await;
            Ok(())
        }
        other => Err(StreamError::Invocation(format!("unknown method '{}'", other))),
    };

    let error = result.err().map(|e| {
        tracing::warn!(invocation_id, method = %target, error = %e, "Invocation failed");
        e.to_string()
    });
    HubFrame::completion(invocation_id, error)
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<HubState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: HubState) {
    let (client_id, mut queue) = state.dispatcher.add_client();
    tracing::info!(client_id, "WebSocket subscriber connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Binary(data))) => match HubFrame::decode(data) {
                    Ok(frame) => state.handle_frame(client_id, frame),
                    Err(e) => tracing::warn!(client_id, error = %e, "Undecodable frame from subscriber"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(client_id, error = %e, "WebSocket receive failed");
                    break;
                }
            },
            outgoing = queue.recv() => match outgoing {
                Some(frame) => {
                    if socket.send(Message::Binary(frame.as_ref().clone())).await.is_err() {
                        break;
                    }
                }
                // Queue dropped by the dispatcher, e.g. on shutdown.
                None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    state.dispatcher.remove_client(client_id);
    tracing::info!(client_id, "WebSocket subscriber disconnected");
}

async fn poll_open(State(state): State<HubState>) -> impl IntoResponse {
    (StatusCode::CREATED, state.polls.open())
}

async fn poll_receive(Path(id): Path<String>, State(state): State<HubState>) -> impl IntoResponse {
    let Some(lease) = state.polls.begin_poll(&id) else {
        return (StatusCode::NOT_FOUND, Vec::new());
    };

    let mut body = Vec::new();
    let mut closed = false;
    {
        let mut queue = lease.queue.lock().await;
        match tokio::time::timeout(state.poll_timeout, queue.recv()).await {
            Ok(Some(first)) => {
                protocol::append_delimited(&mut body, &first);
                while let Ok(frame) = queue.try_recv() {
                    protocol::append_delimited(&mut body, &frame);
                }
            }
            Ok(None) => closed = true,
            Err(_) => {}
        }
    }
    drop(lease);

    if closed {
        state.polls.close(&id);
        return (StatusCode::GONE, Vec::new());
    }
    (StatusCode::OK, body)
}

async fn poll_send(
    Path(id): Path<String>,
    State(state): State<HubState>,
    body: Bytes,
) -> impl IntoResponse {
    let Some(client_id) = state.polls.client_id(&id) else {
        return StatusCode::NOT_FOUND;
    };
    match HubFrame::decode(body) {
        Ok(frame) => {
            state.handle_frame(client_id, frame);
            StatusCode::ACCEPTED
        }
        Err(e) => {
            tracing::warn!(session = %id, error = %e, "Undecodable frame from long polling subscriber");
            StatusCode::BAD_REQUEST
        }
    }
}

async fn poll_close(Path(id): Path<String>, State(state): State<HubState>) -> impl IntoResponse {
    if state.polls.close(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stream_machine::StreamConfig;
    use crate::core::StreamState;
    use crate::ingestors::ChannelSource;

    fn invocation(id: u64, target: &str, args: &[&str]) -> Invocation {
        Invocation {
            invocation_id: id,
            target: target.to_string(),
            arguments: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    fn completion_error(frame: HubFrame) -> Option<String> {
        match frame.kind {
            Some(hub_frame::Kind::Completion(c)) => c.error,
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invocations_drive_the_stream() {
        let source = Arc::new(ChannelSource::new());
        let stream = FilteredStream::new(source.clone(), StreamConfig::default());

        let done = dispatch_invocation(&stream, invocation(1, methods::ADD_TRACKS, &["rust", "tokio"])).await;
        assert_eq!(completion_error(done), None);
        assert_eq!(stream.state(), StreamState::Running);
        assert_eq!(source.connect_calls(), vec![vec!["rust".to_string(), "tokio".to_string()]]);

        dispatch_invocation(&stream, invocation(2, methods::PAUSE, &[])).await;
        assert_eq!(stream.state(), StreamState::Paused);

        dispatch_invocation(&stream, invocation(3, methods::REMOVE_TRACK, &["rust"])).await;
        assert_eq!(stream.tracks().await, vec!["tokio".to_string()]);
        assert_eq!(stream.state(), StreamState::Running);

        dispatch_invocation(&stream, invocation(4, methods::STOP, &[])).await;
        assert_eq!(stream.state(), StreamState::Stopped);
    }

    #[tokio::test]
    async fn bad_invocations_complete_with_an_error() {
        let stream = FilteredStream::new(Arc::new(ChannelSource::new()), StreamConfig::default());

        let unknown = completion_error(dispatch_invocation(&stream, invocation(1, "Explode", &[])).await);
        assert!(unknown.unwrap().contains("Explode"));

        let missing = completion_error(dispatch_invocation(&stream, invocation(2, methods::REMOVE_TRACK, &[])).await);
        assert!(missing.is_some());

        let no_tracks = completion_error(dispatch_invocation(&stream, invocation(3, methods::START, &[])).await);
        assert!(no_tracks.unwrap().contains("no tracks"));
    }

    #[tokio::test]
    async fn completion_is_routed_to_the_caller_only() {
        let dispatcher = Arc::new(Dispatcher::new());
        let stream = FilteredStream::new(Arc::new(ChannelSource::new()), StreamConfig::default());
        let state = HubState::new(Arc::clone(&dispatcher), stream, &HubConfig::default());

        let (caller, mut caller_rx) = dispatcher.add_client();
        let (_, mut other_rx) = dispatcher.add_client();
        state.handle_frame(caller, HubFrame::invocation(9, methods::STOP, vec![]));

        let frame = tokio::time::timeout(Duration::from_secs(2), caller_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let frame = HubFrame::decode(frame.as_ref().clone()).unwrap();
        assert_eq!(frame, HubFrame::completion(9, None));
        assert!(other_rx.try_recv().is_err());
    }
}
