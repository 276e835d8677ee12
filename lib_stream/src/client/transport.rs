//! Transport connections of the client session.
//!
//! Whatever the transport, an open connection is exposed the same way: an
//! outgoing frame queue, an incoming frame queue that closes when the
//! connection is lost, and a token that tears the connection down.

use std::str::FromStr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use prost::Message as ProstMessage;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::ClientError;
use crate::protocol::{self, HubFrame};

/// Transport used to reach the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    WebSockets,
    LongPolling,
    /// WebSockets, falling back to long polling.
    #[default]
    Auto,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websockets" | "websocket" | "ws" => Ok(Transport::WebSockets),
            "longpolling" | "long-polling" | "poll" => Ok(Transport::LongPolling),
            "auto" => Ok(Transport::Auto),
            other => Err(format!("unknown transport '{}'", other)),
        }
    }
}

pub(crate) struct Connection {
    pub outgoing: mpsc::UnboundedSender<HubFrame>,
    pub incoming: mpsc::UnboundedReceiver<HubFrame>,
    pub cancel: CancellationToken,
    pub transport: Transport,
}

/// Resolves a hub path against the base URL, switching to a WebSocket
/// scheme when `websocket` is set.
pub(crate) fn hub_url(base: &str, path: &str, websocket: bool) -> Result<Url, ClientError> {
    let mut base = Url::parse(base)?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    let mut url = base.join(path)?;
    if websocket {
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Transport(format!("cannot use {} for a WebSocket", url)))?;
    }
    Ok(url)
}

pub(crate) async fn open(base: &str, transport: Transport, http: &reqwest::Client) -> Result<Connection, ClientError> {
    match transport {
        Transport::WebSockets => open_websocket(base).await,
        Transport::LongPolling => open_long_polling(base, http).await,
        Transport::Auto => match open_websocket(base).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket unavailable, falling back to long polling");
                open_long_polling(base, http).await
            }
        },
    }
}

async fn open_websocket(base: &str) -> Result<Connection, ClientError> {
    let url = hub_url(base, "streamHub", true)?;
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;
    tracing::info!(url = %url, "Connected to hub over WebSocket");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<HubFrame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let (mut sink, mut stream) = socket.split();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                Some(frame) = out_rx.recv() => {
                    if let Err(e) = sink.send(Message::Binary(frame.encode_to_vec().into())).await {
                        tracing::debug!(error = %e, "WebSocket send failed");
                        break;
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Binary(data))) => match HubFrame::decode(data) {
                        Ok(frame) => {
                            if in_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Undecodable frame from hub"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "WebSocket receive failed");
                        break;
                    }
                },
            }
        }
        token.cancel();
    });

    Ok(Connection {
        outgoing: out_tx,
        incoming: in_rx,
        cancel,
        transport: Transport::WebSockets,
    })
}

async fn open_long_polling(base: &str, http: &reqwest::Client) -> Result<Connection, ClientError> {
    let open_url = hub_url(base, "streamHub/poll", false)?;
    let response = http
        .post(open_url.as_str())
        .send()
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;
    if !response.status().is_success() {
        return Err(ClientError::Transport(format!(
            "long polling session refused: HTTP {}",
            response.status().as_u16()
        )));
    }
    let session = response
        .text()
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;
    let session_url = hub_url(base, &format!("streamHub/poll/{}", session.trim()), false)?;
    tracing::info!(url = %session_url, "Connected to hub over long polling");

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<HubFrame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    // Receive loop. Ends the connection when the session is gone.
    let token = cancel.clone();
    let client = http.clone();
    let url = session_url.clone();
    tokio::spawn(async move {
        loop {
            let response = tokio::select! {
                _ = token.cancelled() => break,
                response = client.get(url.as_str()).send() => response,
            };
            let body = match response {
                Ok(r) if r.status() == reqwest::StatusCode::OK => match r.bytes().await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::debug!(error = %e, "Long polling read failed");
                        break;
                    }
                },
                Ok(r) => {
                    tracing::debug!(status = r.status().as_u16(), "Long polling session ended");
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Long polling request failed");
                    break;
                }
            };
            match protocol::decode_batch(body) {
                Ok(frames) => {
                    if frames.into_iter().any(|frame| in_tx.send(frame).is_err()) {
                        break;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Undecodable long polling batch"),
            }
        }
        token.cancel();
    });

    // Send loop. Closes the session on the way out.
    let token = cancel.clone();
    let client = http.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = out_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let sent = client
                .post(session_url.as_str())
                .body(frame.encode_to_vec())
                .send()
                .await;
            match sent {
                Ok(r) if r.status().is_success() => {}
                Ok(r) => {
                    tracing::debug!(status = r.status().as_u16(), "Long polling send refused");
                    break;
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Long polling send failed");
                    break;
                }
            }
        }
        token.cancel();
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            client.delete(session_url.as_str()).send(),
        )
        .await;
    });

    Ok(Connection {
        outgoing: out_tx,
        incoming: in_rx,
        cancel,
        transport: Transport::LongPolling,
    })
}
