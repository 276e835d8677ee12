//! # Long Polling Sessions
//!
//! A long polling subscriber has no socket whose closing would tell the hub
//! it went away. Each session owns a dispatcher queue and a linger timer:
//! while a poll request is in flight the timer is disarmed, once the last
//! request completes it is re-armed, and when it fires the session and its
//! queue are dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::dispatcher::{ClientReceiver, Dispatcher};

struct PollSession {
    client_id: u64,
    queue: Arc<tokio::sync::Mutex<ClientReceiver>>,
    /// Poll requests currently waiting on the queue.
    active: u32,
    linger: CancellationToken,
}

/// An in-flight poll request. Dropping it, whether the request completed or
/// the subscriber went away mid-poll, re-arms the linger timer once no other
/// request is waiting on the session.
pub struct PollLease {
    pub queue: Arc<tokio::sync::Mutex<ClientReceiver>>,
    id: String,
    inner: Arc<PollInner>,
}

impl Drop for PollLease {
    fn drop(&mut self) {
        self.inner.end_poll(&self.id);
    }
}

type SessionMap = HashMap<String, PollSession>;

struct PollInner {
    sessions: Mutex<SessionMap>,
    dispatcher: Arc<Dispatcher>,
    linger: Duration,
}

pub struct PollSessions {
    inner: Arc<PollInner>,
}

impl PollSessions {
    pub fn new(dispatcher: Arc<Dispatcher>, linger: Duration) -> Self {
        Self {
            inner: Arc::new(PollInner {
                sessions: Mutex::new(HashMap::new()),
                dispatcher,
                linger,
            }),
        }
    }

    /// Opens a session and returns its id.
    pub fn open(&self) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let (client_id, queue) = self.inner.dispatcher.add_client();
        let linger = CancellationToken::new();

        self.inner.lock().insert(
            id.clone(),
            PollSession {
                client_id,
                queue: Arc::new(tokio::sync::Mutex::new(queue)),
                active: 0,
                linger: linger.clone(),
            },
        );
        self.inner.arm_linger(&id, linger);
        tracing::info!(session = %id, client_id, "Long polling session opened");
        id
    }

    /// Subscriber id of a session, for routing invocation completions.
    pub fn client_id(&self, id: &str) -> Option<u64> {
        self.inner.lock().get(id).map(|s| s.client_id)
    }

    /// Marks a poll request as in flight until the lease is dropped. `None`
    /// when the session is unknown or already reaped.
    pub fn begin_poll(&self, id: &str) -> Option<PollLease> {
        let mut sessions = self.inner.lock();
        let session = sessions.get_mut(id)?;
        session.active += 1;
        if session.active == 1 {
            session.linger.cancel();
            session.linger = CancellationToken::new();
        }
        Some(PollLease {
            queue: Arc::clone(&session.queue),
            id: id.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Closes a session. False when it did not exist.
    pub fn close(&self, id: &str) -> bool {
        let removed = self.inner.lock().remove(id);
        match removed {
            Some(session) => {
                session.linger.cancel();
                self.inner.dispatcher.remove_client(session.client_id);
                tracing::info!(session = %id, "Long polling session closed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PollInner {
    fn lock(&self) -> MutexGuard<'_, SessionMap> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn end_poll(self: &Arc<Self>, id: &str) {
        let token = {
            let mut sessions = self.lock();
            let Some(session) = sessions.get_mut(id) else {
                return;
            };
            session.active = session.active.saturating_sub(1);
            if session.active > 0 {
                return;
            }
            session.linger.clone()
        };
        self.arm_linger(id, token);
    }

    fn arm_linger(self: &Arc<Self>, id: &str, token: CancellationToken) {
        // Leases can be dropped while the runtime shuts down.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(self);
        let id = id.to_string();

        runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!(session = %id, "Linger cancelled");
                }
                _ = tokio::time::sleep(inner.linger) => {
                    let mut sessions = inner.lock();
                    let expired = sessions.get(&id).is_some_and(|s| s.active == 0);
                    if expired {
                        if let Some(session) = sessions.remove(&id) {
                            inner.dispatcher.remove_client(session.client_id);
                            tracing::info!(session = %id, "Long polling session expired");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sessions() -> (Arc<Dispatcher>, PollSessions) {
        let dispatcher = Arc::new(Dispatcher::new());
        let polls = PollSessions::new(Arc::clone(&dispatcher), Duration::from_secs(10));
        (dispatcher, polls)
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_expires_after_linger() {
        let (dispatcher, polls) = sessions();
        let id = polls.open();
        assert_eq!(dispatcher.client_count(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(polls.client_id(&id).is_none());
        assert_eq!(dispatcher.client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_poll_keeps_session_alive() {
        let (_dispatcher, polls) = sessions();
        let id = polls.open();

        let lease = polls.begin_poll(&id).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(polls.client_id(&id).is_some());

        drop(lease);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(polls.client_id(&id).is_some());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(polls.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_poll_still_expires() {
        let (dispatcher, polls) = sessions();
        let id = polls.open();

        // A request future dropped mid-wait, as hyper does when the
        // subscriber disconnects.
        let waiting = tokio::spawn({
            let lease = polls.begin_poll(&id).unwrap();
            async move {
                let _held = lease;
                std::future::pending::<()>().await;
            }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        waiting.abort();
        let _ = waiting.await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(polls.is_empty());
        assert_eq!(dispatcher.client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_polls_rearm_only_after_the_last() {
        let (_dispatcher, polls) = sessions();
        let id = polls.open();
        let first = polls.begin_poll(&id).unwrap();
        let second = polls.begin_poll(&id).unwrap();

        drop(first);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(polls.client_id(&id).is_some());

        drop(second);
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(polls.is_empty());
    }

    #[tokio::test]
    async fn close_removes_the_subscriber() {
        let (dispatcher, polls) = sessions();
        let id = polls.open();
        assert!(polls.close(&id));
        assert!(!polls.close(&id));
        assert!(polls.begin_poll(&id).is_none());
        assert_eq!(dispatcher.client_count(), 0);
    }
}
