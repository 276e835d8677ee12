//! # Stream Hub Client
//!
//! A reconnecting subscriber session. [`StreamHubClient::connect`] returns
//! immediately; a supervisor task opens the transport, keeps it open, and
//! when it drops reconnects with exponential backoff until it succeeds, the
//! attempt budget is exhausted (terminal `GaveUp`), or [`close`] is called.
//!
//! Event handlers are registered on the session, not on a connection, so
//! they survive reconnects. Events are handled one at a time, in the order
//! they were received. Invocations wait for a live connection before they
//! are sent.
//!
//! [`close`]: StreamHubClient::close

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use prost::Message as ProstMessage;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::protocol::{hub_frame, methods, EmbedResult, HubFrame, StatusUpdate, STATUS_UPDATED, TWEET_RECEIVED};

mod transport;

pub use transport::Transport;
use transport::Connection;

/// Client session failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    /// The session stopped reconnecting.
    #[error("gave up reconnecting: {0}")]
    GaveUp(String),

    /// The session was closed by its owner.
    #[error("client session is closed")]
    Closed,

    /// The connection dropped before the completion arrived.
    #[error("connection lost before the invocation completed")]
    ConnectionLost,

    /// No completion within the configured invoke timeout.
    #[error("invocation timed out")]
    Timeout,

    /// The hub reported the invocation as failed.
    #[error("hub error: {0}")]
    Remote(String),

    /// The transport could not be opened.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid hub URL: {0}")]
    Url(#[from] url::ParseError),
}

/// Connection lifecycle of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    GaveUp { reason: String },
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::GaveUp { .. } | ConnectionState::Closed)
    }
}

/// Backoff between reconnection attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up. `None`
    /// retries forever.
    pub max_attempts: Option<u32>,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based): doubles every attempt up to
    /// `max_delay`; with jitter, uniformly drawn from the upper half.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let full = delay.as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(full / 2..=full))
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Hub base URL, e.g. `http://localhost:5000`.
    pub base_url: String,
    pub transport: Transport,
    pub reconnect: ReconnectPolicy,
    /// Bound on waiting for a completion, connection wait excluded.
    pub invoke_timeout: Option<Duration>,
}

impl ClientOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            transport: Transport::default(),
            reconnect: ReconnectPolicy::default(),
            invoke_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Raw event handler: receives the event payload.
pub type EventHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

type Completion = Result<(), ClientError>;

#[derive(Clone)]
struct Link {
    outgoing: mpsc::UnboundedSender<HubFrame>,
    generation: u64,
}

struct ClientInner {
    options: ClientOptions,
    http: reqwest::Client,
    state: watch::Sender<ConnectionState>,
    link: watch::Sender<Option<Link>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Completion>>>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    events: mpsc::UnboundedSender<(String, Vec<u8>)>,
    next_invocation: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct StreamHubClient {
    inner: Arc<ClientInner>,
}

impl StreamHubClient {
    /// Starts the session. Connection happens in the background; observe it
    /// with [`state_changes`](Self::state_changes).
    pub fn connect(options: ClientOptions) -> Result<Self, ClientError> {
        // Validate early, the supervisor would only fail later.
        transport::hub_url(&options.base_url, "streamHub", false)?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (events, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            options,
            http,
            state: watch::channel(ConnectionState::Connecting).0,
            link: watch::channel(None).0,
            pending: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            events,
            next_invocation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Arc::clone(&inner).dispatch_events(events_rx));
        tokio::spawn(Arc::clone(&inner).supervise());
        Ok(Self { inner })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Registers a raw handler for the event named `event`.
    pub fn subscribe(&self, event: &str, handler: EventHandler) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    pub fn on_tweet_received<F, Fut>(&self, handler: F)
    where
        F: Fn(EmbedResult) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(TWEET_RECEIVED, typed_handler(handler));
    }

    pub fn on_status_updated<F, Fut>(&self, handler: F)
    where
        F: Fn(StatusUpdate) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe(STATUS_UPDATED, typed_handler(handler));
    }

    /// Calls a hub method and waits for its completion.
    pub async fn invoke(&self, method: &str, arguments: Vec<String>) -> Result<(), ClientError> {
        let link = self.inner.wait_for_link().await?;
        let id = self.inner.next_invocation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(id, tx);

        // The supervisor clears the link before failing pending calls, so a
        // call registered after that sweep sees a different link here.
        let current = self.inner.link.borrow().as_ref().map(|l| l.generation);
        if current != Some(link.generation)
            || link.outgoing.send(HubFrame::invocation(id, method, arguments)).is_err()
        {
            self.inner.pending().remove(&id);
            return Err(ClientError::ConnectionLost);
        }

        let completion = match self.inner.options.invoke_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(completion) => completion,
                Err(_) => {
                    self.inner.pending().remove(&id);
                    return Err(ClientError::Timeout);
                }
            },
            None => rx.await,
        };
        completion.unwrap_or(Err(ClientError::ConnectionLost))
    }

    pub async fn add_tracks(&self, tracks: &[String]) -> Result<(), ClientError> {
        self.invoke(methods::ADD_TRACKS, tracks.to_vec()).await
    }

    pub async fn remove_track(&self, track: &str) -> Result<(), ClientError> {
        self.invoke(methods::REMOVE_TRACK, vec![track.to_string()]).await
    }

    pub async fn start(&self) -> Result<(), ClientError> {
        self.invoke(methods::START, Vec::new()).await
    }

    pub async fn pause(&self) -> Result<(), ClientError> {
        self.invoke(methods::PAUSE, Vec::new()).await
    }

    pub async fn stop(&self) -> Result<(), ClientError> {
        self.invoke(methods::STOP, Vec::new()).await
    }

    /// Stops the session for good and waits until it is torn down.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let mut states = self.inner.state.subscribe();
        let _ = states.wait_for(ConnectionState::is_terminal).await;
    }
}

fn typed_handler<M, F, Fut>(handler: F) -> EventHandler
where
    M: ProstMessage + Default + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |payload: Vec<u8>| match M::decode(payload.as_slice()) {
        Ok(message) => handler(message).boxed(),
        Err(e) => {
            tracing::warn!(error = %e, "Undecodable event payload");
            futures_util::future::ready(()).boxed()
        }
    })
}

impl ClientInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Completion>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        tracing::info!(state = ?state, "Hub connection state");
        self.state.send_replace(state);
    }

    fn fail_pending(&self, error: ClientError) {
        for (_, waiter) in self.pending().drain() {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    async fn wait_for_link(&self) -> Result<Link, ClientError> {
        let mut links = self.link.subscribe();
        let mut states = self.state.subscribe();
        loop {
            if let Some(link) = links.borrow_and_update().clone() {
                return Ok(link);
            }
            match &*states.borrow_and_update() {
                ConnectionState::GaveUp { reason } => return Err(ClientError::GaveUp(reason.clone())),
                ConnectionState::Closed => return Err(ClientError::Closed),
                _ => {}
            }
            tokio::select! {
                _ = links.changed() => {}
                _ = states.changed() => {}
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        let policy = self.options.reconnect.clone();
        let mut attempt: u32 = 0;
        let mut generation: u64 = 0;
        let mut last_error = String::from("connection lost");

        loop {
            if attempt > 0 {
                self.set_state(ConnectionState::Reconnecting { attempt });
            }

            let opened = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                opened = transport::open(&self.options.base_url, self.options.transport, &self.http) => opened,
            };

            match opened {
                Ok(connection) => {
                    attempt = 0;
                    generation += 1;
                    last_error = self.run_connection(connection, generation).await;
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    tracing::warn!(reason = %last_error, "Hub connection lost");
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "Hub connection attempt failed");
                    last_error = e.to_string();
                }
            }

            attempt += 1;
            if policy.max_attempts.is_some_and(|max| attempt > max) {
                self.fail_pending(ClientError::GaveUp(last_error.clone()));
                self.set_state(ConnectionState::GaveUp { reason: last_error });
                self.shutdown.cancel();
                return;
            }

            let delay = policy.delay(attempt);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to hub");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.fail_pending(ClientError::Closed);
        self.set_state(ConnectionState::Closed);
    }

    /// Pumps one connection until it drops. Returns why it ended.
    async fn run_connection(&self, mut connection: Connection, generation: u64) -> String {
        self.link.send_replace(Some(Link {
            outgoing: connection.outgoing.clone(),
            generation,
        }));
        tracing::info!(transport = ?connection.transport, "Hub session established");
        self.set_state(ConnectionState::Connected);

        let reason = loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break "closed".to_string(),
                frame = connection.incoming.recv() => frame,
            };
            let Some(frame) = frame else {
                break "connection closed by hub".to_string();
            };
            match frame.kind {
                Some(hub_frame::Kind::Event(event)) => {
                    let _ = self.events.send((event.target, event.payload));
                }
                Some(hub_frame::Kind::Completion(completion)) => {
                    let waiter = self.pending().remove(&completion.invocation_id);
                    if let Some(waiter) = waiter {
                        let result = match completion.error {
                            Some(error) => Err(ClientError::Remote(error)),
                            None => Ok(()),
                        };
                        let _ = waiter.send(result);
                    }
                }
                Some(hub_frame::Kind::Ping(_)) => {}
                other => tracing::debug!(frame = ?other, "Ignoring unexpected frame from hub"),
            }
        };

        self.link.send_replace(None);
        self.fail_pending(ClientError::ConnectionLost);
        connection.cancel.cancel();
        reason
    }

    async fn dispatch_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<(String, Vec<u8>)>) {
        loop {
            // Queued events win over shutdown, so the ones received before
            // the session ended are still delivered.
            let event = tokio::select! {
                biased;
                event = events.recv() => event,
                _ = self.shutdown.cancelled() => events.try_recv().ok(),
            };
            let Some((target, payload)) = event else {
                break;
            };
            let handlers = self
                .handlers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&target)
                .cloned()
                .unwrap_or_default();
            for handler in handlers {
                if AssertUnwindSafe(handler(payload.clone())).catch_unwind().await.is_err() {
                    tracing::error!(event = %target, "Event handler panicked");
                }
            }
        }
    }
}
