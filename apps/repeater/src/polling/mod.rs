//! Watches a discovery until it settles, times out or is stopped.

use parking_lot::Mutex;
use repeater_proto::{DiscoveryStatus, DiscoveryView};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backoff::{Backoff, BackoffError};

mod client;

pub use client::{DiscoveryClient, DiscoveryError, HttpDiscoveryClient};

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(10);
/// Intervals below this are allowed but flagged at construction.
pub const RECOMMENDED_MIN_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_FETCH_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct PollingOptions {
    pub project_id: String,
    pub discovery_id: String,
    pub interval: Duration,
    pub timeout: Option<Duration>,
    pub fetch_retries: u32,
}

impl PollingOptions {
    pub fn new(project_id: impl Into<String>, discovery_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            discovery_id: discovery_id.into(),
            interval: DEFAULT_POLLING_INTERVAL,
            timeout: None,
            fetch_retries: DEFAULT_FETCH_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingOutcome {
    /// The discovery reached a terminal status.
    Finished(DiscoveryStatus),
    NotFound,
    TimedOut,
    Stopped,
}

#[derive(Debug, Error)]
pub enum PollingError {
    #[error("polling has already been started")]
    AlreadyStarted,
    #[error(transparent)]
    Fetch(#[from] BackoffError<DiscoveryError>),
}

pub struct DiscoveryPoller {
    client: Arc<dyn DiscoveryClient>,
    options: PollingOptions,
    cancel: CancellationToken,
    started: AtomicBool,
    timed_out: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryPoller {
    pub fn new(client: Arc<dyn DiscoveryClient>, options: PollingOptions) -> Self {
        if options.timeout.is_none() {
            warn!(
                target: "repeater::polling",
                "no timeout set; polling continues until the discovery finishes"
            );
        }
        if options.interval < RECOMMENDED_MIN_INTERVAL {
            warn!(
                target: "repeater::polling",
                interval_ms = options.interval.as_millis() as u64,
                "polling interval is below the recommended {}s",
                RECOMMENDED_MIN_INTERVAL.as_secs()
            );
        }
        Self {
            client,
            options,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            timed_out: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
        }
    }

    /// Polls until one outcome is reached. `stop()` runs on every exit
    /// path.
    pub async fn start(&self) -> Result<PollingOutcome, PollingError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PollingError::AlreadyStarted);
        }
        self.arm_timer();
        let result = self.poll().await;
        self.stop();
        result
    }

    /// Cancels polling and the timeout timer. Safe to call repeatedly.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    fn arm_timer(&self) {
        let Some(timeout) = self.options.timeout else {
            return;
        };
        let cancel = self.cancel.clone();
        let timed_out = self.timed_out.clone();
        let timer = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    timed_out.store(true, Ordering::SeqCst);
                    cancel.cancel();
                }
            }
        });
        *self.timer.lock() = Some(timer);
    }

    async fn poll(&self) -> Result<PollingOutcome, PollingError> {
        let backoff = Backoff::new(self.options.fetch_retries, |err: &DiscoveryError| {
            !err.is_retryable()
        })
        .with_label("discovery status");
        let client = self.client.clone();
        let project_id = self.options.project_id.as_str();
        let discovery_id = self.options.discovery_id.as_str();

        loop {
            let fetched = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(self.interrupted()),
                fetched = backoff.execute(|| client.get_discovery(project_id, discovery_id)) => fetched,
            };
            let view = match fetched {
                Ok(view) => view,
                Err(err) if matches!(err.inner(), DiscoveryError::NotFound(_)) => {
                    warn!(
                        target: "repeater::polling",
                        discovery_id,
                        "discovery not found, stopping"
                    );
                    return Ok(PollingOutcome::NotFound);
                }
                Err(err) => {
                    error!(
                        target: "repeater::polling",
                        discovery_id,
                        attempts = err.attempts(),
                        error = %err,
                        "failed to fetch discovery status"
                    );
                    return Err(err.into());
                }
            };

            log_status(&view);
            if view.status.is_terminal() {
                return Ok(PollingOutcome::Finished(view.status));
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(self.interrupted()),
                _ = tokio::time::sleep(self.options.interval) => {}
            }
        }
    }

    fn interrupted(&self) -> PollingOutcome {
        if self.timed_out.load(Ordering::SeqCst) {
            info!(target: "repeater::polling", "polling stopped by timeout");
            PollingOutcome::TimedOut
        } else {
            info!(target: "repeater::polling", "polling stopped");
            PollingOutcome::Stopped
        }
    }
}

fn log_status(view: &DiscoveryView) {
    let name = view.name.as_str();
    match view.status {
        DiscoveryStatus::Pending | DiscoveryStatus::Scheduled | DiscoveryStatus::Queued => {
            info!(
                target: "repeater::polling",
                status = %view.status,
                "discovery \"{name}\" is waiting to start"
            );
        }
        DiscoveryStatus::Running => {
            info!(target: "repeater::polling", "discovery \"{name}\" is running");
        }
        DiscoveryStatus::Done => {
            info!(target: "repeater::polling", "discovery \"{name}\" finished");
        }
        DiscoveryStatus::Stopped => {
            info!(target: "repeater::polling", "discovery \"{name}\" was stopped");
        }
        DiscoveryStatus::Disrupted | DiscoveryStatus::Failed => {
            warn!(
                target: "repeater::polling",
                status = %view.status,
                "discovery \"{name}\" ended unsuccessfully"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    struct Scripted {
        replies: Mutex<VecDeque<Result<DiscoveryStatus, DiscoveryError>>>,
        fetches: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<DiscoveryStatus, DiscoveryError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl DiscoveryClient for Scripted {
        async fn get_discovery(
            &self,
            _project_id: &str,
            discovery_id: &str,
        ) -> Result<DiscoveryView, DiscoveryError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let next = self
                .replies
                .lock()
                .pop_front()
                .unwrap_or(Ok(DiscoveryStatus::Running));
            next.map(|status| DiscoveryView {
                id: discovery_id.to_string(),
                name: "nightly".to_string(),
                status,
            })
        }
    }

    fn options() -> PollingOptions {
        PollingOptions::new("p1", "d1")
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_terminal_status_after_exact_fetches() {
        let client = Scripted::new(vec![
            Ok(DiscoveryStatus::Running),
            Ok(DiscoveryStatus::Running),
            Ok(DiscoveryStatus::Done),
        ]);
        let poller = DiscoveryPoller::new(client.clone(), options());

        let outcome = poller.start().await.unwrap();
        assert_eq!(outcome, PollingOutcome::Finished(DiscoveryStatus::Done));
        assert_eq!(client.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_ends_polling_without_error() {
        let client = Scripted::new(vec![Err(DiscoveryError::NotFound("d1".into()))]);
        let poller = DiscoveryPoller::new(client.clone(), options());
        assert_eq!(poller.start().await.unwrap(), PollingOutcome::NotFound);
        assert_eq!(client.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_retried_then_polling_continues() {
        let client = Scripted::new(vec![
            Err(DiscoveryError::Status(502)),
            Err(DiscoveryError::Status(503)),
            Ok(DiscoveryStatus::Failed),
        ]);
        let poller = DiscoveryPoller::new(client.clone(), options());
        assert_eq!(
            poller.start().await.unwrap(),
            PollingOutcome::Finished(DiscoveryStatus::Failed)
        );
        assert_eq!(client.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_escape_start() {
        let client = Scripted::new(vec![Err(DiscoveryError::Status(401))]);
        let poller = DiscoveryPoller::new(client.clone(), options());
        match poller.start().await {
            Err(PollingError::Fetch(err)) => {
                assert!(err.is_fatal());
                assert_eq!(err.to_string(), "status api returned HTTP 401");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(client.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_resolves_and_no_fetch_follows_expiry() {
        let client = Scripted::new(vec![]);
        let mut options = options();
        options.timeout = Some(Duration::from_secs(25));
        let poller = DiscoveryPoller::new(client.clone(), options);

        assert_eq!(poller.start().await.unwrap(), PollingOutcome::TimedOut);
        // Fetches at 0s, 10s and 20s; the timer fires at 25s.
        assert_eq!(client.fetches.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(client.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_poll_resolves_start() {
        let client = Scripted::new(vec![]);
        let poller = Arc::new(DiscoveryPoller::new(client.clone(), options()));
        let running = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.start().await })
        };

        tokio::time::sleep(Duration::from_secs(15)).await;
        poller.stop();
        assert_eq!(running.await.unwrap().unwrap(), PollingOutcome::Stopped);
        assert_eq!(client.fetches.load(Ordering::SeqCst), 2);
        poller.stop();
    }

    struct Hanging {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DiscoveryClient for Hanging {
        async fn get_discovery(
            &self,
            _project_id: &str,
            _discovery_id: &str,
        ) -> Result<DiscoveryView, DiscoveryError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_a_fetch_resolves_start() {
        let client = Arc::new(Hanging {
            fetches: AtomicUsize::new(0),
        });
        let poller = Arc::new(DiscoveryPoller::new(client.clone(), options()));
        let running = {
            let poller = poller.clone();
            tokio::spawn(async move { poller.start().await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.fetches.load(Ordering::SeqCst), 1);
        poller.stop();
        assert_eq!(running.await.unwrap().unwrap(), PollingOutcome::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected() {
        let client = Scripted::new(vec![Ok(DiscoveryStatus::Done)]);
        let poller = DiscoveryPoller::new(client, options());
        poller.start().await.unwrap();
        assert!(matches!(poller.start().await, Err(PollingError::AlreadyStarted)));
    }
}
