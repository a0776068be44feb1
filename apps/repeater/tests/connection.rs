use parking_lot::Mutex;
use repeater::connection::{
    ConnectionError, ConnectionManager, ConnectionOptions, ConnectionState, EventHandler,
    MemoryDialer, MemoryPeer, ReconnectionFailure, INVALID_REQUEST_CODE,
};
use repeater::executors::{ExecutorRegistry, HttpExecutorOptions};
use repeater::hub::CommandHub;
use repeater_proto::{ErrorCode, Frame, Protocol, Request, Response, EVENT_REQUEST};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_timeout::tokio_timeout_test;
use tokio::sync::{mpsc, Notify, Semaphore};

fn hub_backed(manager: &ConnectionManager, hub: Arc<CommandHub>) {
    manager.on(EventHandler::request(move |request: Request| {
        let hub = hub.clone();
        async move { Ok::<_, anyhow::Error>(hub.send_request(request).await?) }
    }));
}

async fn expect_ack(peer: &mut MemoryPeer, expected: u64) -> Response {
    match peer.recv_event().await.expect("ack frame") {
        Frame::Ack { id, payload } => {
            assert_eq!(id, expected);
            serde_json::from_value(payload).unwrap()
        }
        other => panic!("unexpected frame: {other:?}"),
    }
}

#[tokio_timeout_test(10, paused)]
async fn exhausted_reconnects_report_once_with_the_last_error() {
    let dialer = Arc::new(MemoryDialer::new());
    let peer = dialer.push_link();
    dialer.push_error(ConnectionError::Rejected(502));
    dialer.push_error(ConnectionError::Rejected(503));
    // The third redial finds the queue empty and is refused.

    let manager = ConnectionManager::new(dialer.clone(), ConnectionOptions::default());
    let failures: Arc<Mutex<Vec<ReconnectionFailure>>> = Arc::default();
    {
        let failures = failures.clone();
        manager.on(EventHandler::reconnection_failed(move |failure| {
            failures.lock().push(failure);
        }));
    }

    manager.connect().await.unwrap();
    drop(peer);
    manager.closed().await;

    let failures = failures.lock();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempts, 3);
    assert!(matches!(
        failures[0].error,
        ConnectionError::Transport {
            code: Some(ErrorCode::ConnectionRefused),
            ..
        }
    ));
    assert_eq!(dialer.attempts(), 4);
    assert!(manager.last_reconnect_error().is_none());
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert!(manager.connect().await.is_err());
}

#[tokio_timeout_test(10, paused)]
async fn successful_reconnect_clears_the_stored_error() {
    let dialer = Arc::new(MemoryDialer::new());
    let first = dialer.push_link();
    dialer.push_error(ConnectionError::Rejected(503));
    let mut second = dialer.push_link();

    let manager = ConnectionManager::new(dialer.clone(), ConnectionOptions::default());
    let reconnected = Arc::new(Notify::new());
    {
        let reconnected = reconnected.clone();
        manager.on(EventHandler::reconnected(move || {
            let reconnected = reconnected.clone();
            async move {
                reconnected.notify_one();
                Ok::<_, anyhow::Error>(())
            }
        }));
    }

    manager.connect().await.unwrap();
    drop(first);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(manager.state(), ConnectionState::Reconnecting);
    assert!(matches!(
        manager.last_reconnect_error(),
        Some(ConnectionError::Rejected(503))
    ));

    reconnected.notified().await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.last_reconnect_error().is_none());
    assert_eq!(dialer.attempts(), 3);

    assert!(second.send(Frame::Ping));
    assert_eq!(second.recv().await, Some(Frame::Pong));

    manager.disconnect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Closed);
}

#[tokio_timeout_test(10)]
async fn unsupported_protocol_is_acked_and_connection_stays_up() {
    let dialer = Arc::new(MemoryDialer::new());
    let mut peer = dialer.push_link();
    let manager = ConnectionManager::new(dialer, ConnectionOptions::default());
    hub_backed(&manager, Arc::new(CommandHub::new(ExecutorRegistry::new())));
    manager.connect().await.unwrap();

    let request = Request::new(Protocol::Tcp, "tcp://db.internal:5432");
    assert!(peer.send(Frame::event(EVENT_REQUEST, Some(7), &request).unwrap()));

    let response = expect_ack(&mut peer, 7).await;
    assert_eq!(response.protocol, Protocol::Tcp);
    assert_eq!(response.error_code, Some(ErrorCode::UnsupportedProtocol));

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(peer.send(Frame::Ping));
    assert_eq!(peer.recv().await, Some(Frame::Pong));
}

#[tokio_timeout_test(10)]
async fn unknown_protocol_names_are_acked_as_unsupported() {
    let dialer = Arc::new(MemoryDialer::new());
    let mut peer = dialer.push_link();
    let manager = ConnectionManager::new(dialer, ConnectionOptions::default());
    let executors = ExecutorRegistry::with_defaults(HttpExecutorOptions::default()).unwrap();
    hub_backed(&manager, Arc::new(CommandHub::new(executors)));
    manager.connect().await.unwrap();

    assert!(peer.send(Frame::Event {
        event: EVENT_REQUEST.to_string(),
        id: Some(11),
        payload: json!({
            "protocol": "amqp",
            "url": "amqp://broker.internal:5672",
            "headers": {}
        }),
    }));

    let response = expect_ack(&mut peer, 11).await;
    assert_eq!(response.protocol, Protocol::Other("amqp".into()));
    assert_eq!(response.error_code, Some(ErrorCode::UnsupportedProtocol));
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio_timeout_test(10)]
async fn undecodable_requests_are_still_acked() {
    let dialer = Arc::new(MemoryDialer::new());
    let mut peer = dialer.push_link();
    let manager = ConnectionManager::new(dialer, ConnectionOptions::default());
    hub_backed(&manager, Arc::new(CommandHub::new(ExecutorRegistry::new())));
    manager.connect().await.unwrap();

    assert!(peer.send(Frame::Event {
        event: EVENT_REQUEST.to_string(),
        id: Some(12),
        payload: json!({ "protocol": "http", "headers": "not-a-map" }),
    }));

    let response = expect_ack(&mut peer, 12).await;
    assert_eq!(response.protocol, Protocol::Http);
    assert_eq!(
        response.error_code,
        Some(ErrorCode::Other(INVALID_REQUEST_CODE.into()))
    );
    assert!(response.message.unwrap().starts_with("malformed request"));

    assert!(peer.send(Frame::Ping));
    assert_eq!(peer.recv().await, Some(Frame::Pong));
}

#[tokio_timeout_test(10)]
async fn in_flight_bound_holds_later_requests_until_earlier_ones_ack() {
    let dialer = Arc::new(MemoryDialer::new());
    let mut peer = dialer.push_link();
    let options = ConnectionOptions {
        max_in_flight: Some(1),
        ..ConnectionOptions::default()
    };
    let manager = ConnectionManager::new(dialer, options);

    let (started_tx, mut started) = mpsc::unbounded_channel();
    let release = Arc::new(Semaphore::new(0));
    {
        let release = release.clone();
        manager.on(EventHandler::request(move |request: Request| {
            let started_tx = started_tx.clone();
            let release = release.clone();
            async move {
                let _ = started_tx.send(request.url.clone());
                release.acquire().await?.forget();
                Ok::<_, anyhow::Error>(Response::new(request.protocol))
            }
        }));
    }
    manager.connect().await.unwrap();

    for (id, url) in [(1, "http://a.internal/"), (2, "http://b.internal/")] {
        let request = Request::new(Protocol::Http, url);
        assert!(peer.send(Frame::event(EVENT_REQUEST, Some(id), &request).unwrap()));
    }

    assert_eq!(started.recv().await.as_deref(), Some("http://a.internal/"));
    assert!(
        tokio::time::timeout(Duration::from_millis(200), started.recv())
            .await
            .is_err(),
        "second request started while the first was in flight"
    );

    release.add_permits(1);
    expect_ack(&mut peer, 1).await;
    assert_eq!(started.recv().await.as_deref(), Some("http://b.internal/"));

    release.add_permits(1);
    expect_ack(&mut peer, 2).await;
}
