//! End-to-end checks: a real hub on a local port, real client sessions over
//! both transports, and an upstream fed by hand.

use std::time::Duration;

use tokio::sync::mpsc;

use lib_stream::hub::HubConfig;
use lib_stream::protocol::{EmbedResult, StatusUpdate};
use lib_stream::{ClientError, ClientOptions, ConnectionState, StreamHubClient, StreamState, Transport};
use project_tests::{recv_within, TestHub};

fn options(hub: &TestHub, transport: Transport) -> ClientOptions {
    let mut options = ClientOptions::new(hub.base_url.clone());
    options.transport = transport;
    options.reconnect.base_delay = Duration::from_millis(50);
    options.reconnect.max_delay = Duration::from_millis(400);
    options.invoke_timeout = Some(Duration::from_secs(5));
    options
}

struct Subscriber {
    client: StreamHubClient,
    tweets: mpsc::UnboundedReceiver<EmbedResult>,
    statuses: mpsc::UnboundedReceiver<StatusUpdate>,
}

fn subscribe(hub: &TestHub, transport: Transport) -> Subscriber {
    let client = StreamHubClient::connect(options(hub, transport)).unwrap();

    let (tweet_tx, tweets) = mpsc::unbounded_channel();
    client.on_tweet_received(move |embed| {
        let tx = tweet_tx.clone();
        async move {
            let _ = tx.send(embed);
        }
    });
    let (status_tx, statuses) = mpsc::unbounded_channel();
    client.on_status_updated(move |status| {
        let tx = status_tx.clone();
        async move {
            let _ = tx.send(status);
        }
    });

    Subscriber {
        client,
        tweets,
        statuses,
    }
}

/// Skips status updates until one starts with `prefix`.
async fn status_starting_with(rx: &mut mpsc::UnboundedReceiver<StatusUpdate>, prefix: &str) -> StatusUpdate {
    loop {
        let status = recv_within(rx)
            .await
            .unwrap_or_else(|| panic!("no status starting with {:?}", prefix));
        if status.message.starts_with(prefix) {
            return status;
        }
    }
}

#[tokio::test]
async fn websocket_subscriber_receives_matching_tweet() {
    let hub = TestHub::spawn().await.unwrap();
    let mut sub = subscribe(&hub, Transport::WebSockets);

    sub.client.add_tracks(&["rust".to_string()]).await.unwrap();
    assert_eq!(hub.source.connect_calls(), vec![vec!["rust".to_string()]]);
    assert_eq!(hub.stream.state(), StreamState::Running);
    assert!(hub.source.is_connected());

    assert!(hub.source.push_tweet("1", "X", "Learning Rust today", false));
    let embed = recv_within(&mut sub.tweets).await.unwrap();
    assert_eq!(embed.author_name, "X");
    assert!(!embed.is_off_topic);
    assert_eq!(embed.url, "https://twitter.com/X/status/1");

    sub.client.close().await;
}

#[tokio::test]
async fn long_polling_subscriber_receives_tweets() {
    let hub = TestHub::spawn().await.unwrap();
    let mut sub = subscribe(&hub, Transport::LongPolling);

    sub.client.add_tracks(&["tokio".to_string()]).await.unwrap();
    assert!(hub.source.push_tweet("7", "runtime", "nothing on topic here", false));

    let embed = recv_within(&mut sub.tweets).await.unwrap();
    assert_eq!(embed.author_name, "runtime");
    assert!(embed.is_off_topic);

    sub.client.close().await;
    assert_eq!(sub.client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn auto_transport_falls_back_to_long_polling() {
    let hub = TestHub::spawn_without_websockets().await.unwrap();
    let refused = reqwest::get(format!("{}/streamHub", hub.base_url)).await.unwrap();
    assert_eq!(refused.status(), reqwest::StatusCode::NOT_FOUND);

    let mut sub = subscribe(&hub, Transport::Auto);
    sub.client.add_tracks(&["rust".to_string()]).await.unwrap();
    assert!(hub.wait_for_clients(1).await);
    assert_eq!(hub.polls.len(), 1);

    hub.source.push_tweet("5", "fallback", "rust over plain HTTP", false);
    let embed = recv_within(&mut sub.tweets).await.unwrap();
    assert_eq!(embed.author_name, "fallback");

    sub.client.close().await;
}

#[tokio::test]
async fn abandoned_poll_request_releases_its_session() {
    let hub = TestHub::spawn_with(HubConfig {
        poll_timeout_secs: 3,
        poll_linger_secs: 1,
    })
    .await
    .unwrap();
    let http = reqwest::Client::new();

    let opened = http
        .post(format!("{}/streamHub/poll", hub.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(opened.status(), reqwest::StatusCode::CREATED);
    let session = opened.text().await.unwrap();
    let session_url = format!("{}/streamHub/poll/{}", hub.base_url, session.trim());
    assert_eq!(hub.dispatcher.client_count(), 1);

    // The caller gives up long before the hub would answer the poll.
    let abandoned = http
        .get(&session_url)
        .timeout(Duration::from_millis(200))
        .send()
        .await;
    assert!(abandoned.is_err());

    assert!(hub.wait_for_clients(0).await);
    assert!(hub.polls.is_empty());
    let expired = http.get(&session_url).send().await.unwrap();
    assert_eq!(expired.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sensitive_tweets_are_held_back_without_a_scorer() {
    let hub = TestHub::spawn().await.unwrap();
    let mut sub = subscribe(&hub, Transport::WebSockets);
    sub.client.add_tracks(&["rust".to_string()]).await.unwrap();

    hub.source.push_tweet("1", "risky", "rust something sensitive", true);
    hub.source.push_tweet("2", "calm", "rust something calm", false);

    let embed = recv_within(&mut sub.tweets).await.unwrap();
    assert_eq!(embed.author_name, "calm");

    sub.client.close().await;
}

#[tokio::test]
async fn status_updates_follow_the_lifecycle() {
    let hub = TestHub::spawn().await.unwrap();
    let mut sub = subscribe(&hub, Transport::WebSockets);

    sub.client.add_tracks(&["rust".to_string()]).await.unwrap();
    let started = status_starting_with(&mut sub.statuses, "Twitter stream started").await;
    assert!(started.is_streaming);

    sub.client.pause().await.unwrap();
    let paused = status_starting_with(&mut sub.statuses, "Twitter stream paused").await;
    assert!(!paused.is_streaming);

    sub.client.start().await.unwrap();
    let resumed = status_starting_with(&mut sub.statuses, "Twitter stream resumed").await;
    assert!(resumed.is_streaming);
    assert_eq!(hub.source.connect_calls().len(), 1);

    hub.source.push_tweet("2", "Y", "rust after resume", false);
    let embed = recv_within(&mut sub.tweets).await.unwrap();
    assert_eq!(embed.author_name, "Y");

    sub.client.stop().await.unwrap();
    let stopped = status_starting_with(&mut sub.statuses, "Twitter stream stopped").await;
    assert!(!stopped.is_streaming);
    assert_eq!(hub.stream.state(), StreamState::Stopped);
    assert!(!hub.source.is_connected());

    sub.client.close().await;
}

#[tokio::test]
async fn upstream_close_is_announced() {
    let hub = TestHub::spawn().await.unwrap();
    let mut sub = subscribe(&hub, Transport::WebSockets);
    sub.client.add_tracks(&["rust".to_string()]).await.unwrap();

    hub.source
        .push(lib_stream::core::UpstreamMessage::Disconnect("operator closed".to_string()));
    let disconnected = status_starting_with(&mut sub.statuses, "Twitter stream disconnected").await;
    assert!(disconnected.message.contains("operator closed"));

    hub.source.close_current();
    let stopped = status_starting_with(&mut sub.statuses, "Twitter stream stopped").await;
    assert!(stopped.message.contains("operator closed"));
    assert!(!stopped.is_streaming);

    sub.client.close().await;
}

#[tokio::test]
async fn failed_start_reaches_the_caller_and_every_subscriber() {
    let hub = TestHub::spawn().await.unwrap();
    let mut caller = subscribe(&hub, Transport::WebSockets);
    let mut watcher = subscribe(&hub, Transport::LongPolling);
    assert!(hub.wait_for_clients(2).await);

    hub.source.fail_next_connect("401 Unauthorized");
    let result = caller.client.add_tracks(&["rust".to_string()]).await;
    match result {
        Err(ClientError::Remote(message)) => assert!(message.contains("401")),
        other => panic!("expected a remote error, got {:?}", other),
    }

    for statuses in [&mut caller.statuses, &mut watcher.statuses] {
        let failed = status_starting_with(statuses, "Twitter stream failed to start").await;
        assert!(failed.message.contains("401 Unauthorized"));
        assert!(!failed.is_streaming);
    }
    assert_eq!(hub.stream.state(), StreamState::Stopped);
    assert_eq!(hub.stream.tracks().await, vec!["rust".to_string()]);

    caller.client.close().await;
    watcher.client.close().await;
}

#[tokio::test]
async fn every_subscriber_gets_each_tweet_once() {
    let hub = TestHub::spawn().await.unwrap();
    let mut first = subscribe(&hub, Transport::WebSockets);
    let mut second = subscribe(&hub, Transport::WebSockets);
    assert!(hub.wait_for_clients(2).await);

    first.client.add_tracks(&["rust".to_string()]).await.unwrap();
    hub.source.push_tweet("1", "A", "rust one", false);
    hub.source.push_tweet("2", "B", "rust two", false);

    for sub in [&mut first, &mut second] {
        let mut authors = vec![
            recv_within(&mut sub.tweets).await.unwrap().author_name,
            recv_within(&mut sub.tweets).await.unwrap().author_name,
        ];
        authors.sort();
        assert_eq!(authors, vec!["A".to_string(), "B".to_string()]);
        assert!(tokio::time::timeout(Duration::from_millis(200), sub.tweets.recv())
            .await
            .is_err());
    }

    first.client.close().await;
    second.client.close().await;
}

#[tokio::test]
async fn handlers_survive_a_reconnect() {
    let hub = TestHub::spawn().await.unwrap();
    let mut sub = subscribe(&hub, Transport::WebSockets);
    sub.client.add_tracks(&["rust".to_string()]).await.unwrap();
    assert!(hub.wait_for_clients(1).await);

    // Dropping every queue ends the session hub side; the count only comes
    // back once the client has reconnected.
    hub.dispatcher.disconnect_all();
    assert_eq!(hub.dispatcher.client_count(), 0);
    assert!(hub.wait_for_clients(1).await);

    // The hub keeps its stream running across subscriber churn.
    assert_eq!(hub.stream.state(), StreamState::Running);
    hub.source.push_tweet("3", "again", "rust after reconnect", false);
    let embed = recv_within(&mut sub.tweets).await.unwrap();
    assert_eq!(embed.author_name, "again");

    sub.client.pause().await.unwrap();
    assert_eq!(hub.stream.state(), StreamState::Paused);

    sub.client.close().await;
}

#[tokio::test]
async fn unreachable_hub_gives_up() {
    let hub = TestHub::spawn().await.unwrap();
    let mut options = options(&hub, Transport::WebSockets);
    // Nothing listens on port 9 locally.
    options.base_url = "http://127.0.0.1:9".to_string();
    options.reconnect.max_attempts = Some(2);
    let client = StreamHubClient::connect(options).unwrap();

    let mut states = client.state_changes();
    let terminal = tokio::time::timeout(Duration::from_secs(10), states.wait_for(ConnectionState::is_terminal))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert!(matches!(terminal, ConnectionState::GaveUp { .. }));

    match client.start().await {
        Err(ClientError::GaveUp(_)) => {}
        other => panic!("expected GaveUp, got {:?}", other),
    }
}
