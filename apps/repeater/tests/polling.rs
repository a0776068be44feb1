use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use repeater::polling::{
    DiscoveryClient, DiscoveryError, DiscoveryPoller, HttpDiscoveryClient, PollingOptions,
    PollingOutcome,
};
use repeater_proto::DiscoveryStatus;
use serde_json::json;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use test_timeout::tokio_timeout_test;

type Statuses = Arc<Mutex<VecDeque<&'static str>>>;

async fn discovery(
    State(statuses): State<Statuses>,
    Path((project, discovery)): Path<(String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if headers.get("authorization").and_then(|value| value.to_str().ok()) != Some("api-key k3y") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if project != "p1" || discovery != "d1" {
        return StatusCode::NOT_FOUND.into_response();
    }
    let status = statuses.lock().pop_front().unwrap_or("running");
    Json(json!({ "id": discovery, "name": "nightly", "status": status })).into_response()
}

async fn serve(statuses: Vec<&'static str>) -> SocketAddr {
    let statuses: Statuses = Arc::new(Mutex::new(statuses.into()));
    let app = Router::new()
        .route(
            "/api/v2/projects/:project/discoveries/:discovery",
            get(discovery),
        )
        .with_state(statuses);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

#[tokio_timeout_test(20)]
async fn client_reads_discovery_views() {
    let addr = serve(vec!["queued"]).await;
    let client = HttpDiscoveryClient::new(&format!("http://{addr}"), "k3y").unwrap();

    let view = client.get_discovery("p1", "d1").await.unwrap();
    assert_eq!(view.name, "nightly");
    assert_eq!(view.status, DiscoveryStatus::Queued);

    assert!(matches!(
        client.get_discovery("p1", "missing").await,
        Err(DiscoveryError::NotFound(id)) if id == "missing"
    ));

    let wrong_key = HttpDiscoveryClient::new(&format!("http://{addr}"), "nope").unwrap();
    let err = wrong_key.get_discovery("p1", "d1").await.unwrap_err();
    assert!(matches!(err, DiscoveryError::Status(401)));
    assert!(!err.is_retryable());
}

#[tokio_timeout_test(20)]
async fn poller_follows_a_discovery_to_completion() {
    let addr = serve(vec!["pending", "running", "done"]).await;
    let client = Arc::new(HttpDiscoveryClient::new(&format!("http://{addr}"), "k3y").unwrap());
    let mut options = PollingOptions::new("p1", "d1");
    options.interval = Duration::from_millis(50);

    let poller = DiscoveryPoller::new(client, options);
    assert_eq!(
        poller.start().await.unwrap(),
        PollingOutcome::Finished(DiscoveryStatus::Done)
    );
}

#[tokio_timeout_test(20)]
async fn timeout_ends_polling_and_stops_fetching() {
    let addr = serve(vec![]).await;
    let client = Arc::new(HttpDiscoveryClient::new(&format!("http://{addr}"), "k3y").unwrap());
    let mut options = PollingOptions::new("p1", "d1");
    options.interval = Duration::from_millis(50);
    options.timeout = Some(Duration::from_millis(300));

    let poller = DiscoveryPoller::new(client, options);
    assert_eq!(poller.start().await.unwrap(), PollingOutcome::TimedOut);
}

#[tokio_timeout_test(20)]
async fn stop_resolves_a_running_poll_promptly() {
    let addr = serve(vec![]).await;
    let client = Arc::new(HttpDiscoveryClient::new(&format!("http://{addr}"), "k3y").unwrap());
    let poller = Arc::new(DiscoveryPoller::new(client, PollingOptions::new("p1", "d1")));

    let running = {
        let poller = poller.clone();
        tokio::spawn(async move { poller.start().await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    poller.stop();
    poller.stop();

    let outcome = tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("start resolves after stop")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, PollingOutcome::Stopped);
}
