//! The single persistent connection to the controller.
//!
//! `ConnectionManager` dials through a [`Dialer`], hands inbound events to
//! the installed [`EventHandler`]s and keeps the link alive: a lost link
//! is redialed up to [`RECONNECT_ATTEMPTS`] times before
//! `reconnection_failed` is raised and the manager closes for good.

use parking_lot::{Mutex, RwLock};
use repeater_proto::{
    DeployPayload, DeployedPayload, ErrorCode, Frame, InboundEvent, NetworkTestResult, Protocol,
    Request, Response, RuntimeInfo, EVENT_DEPLOY, EVENT_REQUEST,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{Backoff, BackoffError};
use crate::error::{human_message, WithErrorCode};
use crate::hub::HubError;

mod handlers;
mod link;
mod state;

pub use handlers::{EventHandler, HandlerFuture, ReconnectionFailure};
pub use link::{Dialer, Link, MemoryDialer, MemoryPeer, WebSocketDialer, DOMAIN_HEADER};
pub use state::ConnectionState;

use handlers::Handlers;

/// Redials allowed after the link drops.
pub const RECONNECT_ATTEMPTS: u32 = 3;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_RETRIES: u32 = 3;
/// Ack code for a `request` whose payload could not be decoded.
pub const INVALID_REQUEST_CODE: &str = "ERR_INVALID_REQUEST";

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("controller rejected the repeater credentials (HTTP {0})")]
    Unauthorized(u16),
    #[error("controller refused the connection (HTTP {0})")]
    Rejected(u16),
    #[error("invalid controller url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("{0} cannot be sent as an http header")]
    InvalidCredentials(&'static str),
    #[error("{message}")]
    Transport {
        code: Option<ErrorCode>,
        message: String,
    },
    #[error("not connected to the controller")]
    NotConnected,
    #[error("already connected to the controller")]
    AlreadyConnected,
    #[error("connection is closed")]
    Closed,
    #[error("controller link closed")]
    LinkClosed,
    #[error("controller did not confirm deployment within {0:?}")]
    DeployTimeout(Duration),
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl ConnectionError {
    /// Errors that no amount of redialing will fix.
    pub fn is_fatal(&self) -> bool {
        match self {
            ConnectionError::Unauthorized(_)
            | ConnectionError::InvalidUrl { .. }
            | ConnectionError::InvalidCredentials(_) => true,
            ConnectionError::Rejected(status) => *status < 500,
            ConnectionError::Transport { code, .. } => matches!(
                code,
                Some(ErrorCode::InvalidUrl | ErrorCode::UnsupportedProtocol)
            ),
            _ => false,
        }
    }
}

impl WithErrorCode for ConnectionError {
    fn error_code(&self) -> Option<ErrorCode> {
        match self {
            ConnectionError::Transport { code, .. } => code.clone(),
            ConnectionError::InvalidUrl { .. } => Some(ErrorCode::InvalidUrl),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub heartbeat_interval: Duration,
    pub deploy_timeout: Duration,
    /// Backoff depth for the initial dial.
    pub connect_retries: u32,
    /// Upper bound on concurrently executing requests. `None` runs every
    /// request as soon as it arrives.
    pub max_in_flight: Option<usize>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            deploy_timeout: DEFAULT_DEPLOY_TIMEOUT,
            connect_retries: DEFAULT_CONNECT_RETRIES,
            max_in_flight: None,
        }
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    handlers: RwLock<Handlers>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    pending_deploy: Mutex<Option<oneshot::Sender<DeployedPayload>>>,
    last_reconnect_error: Mutex<Option<ConnectionError>>,
    limiter: Option<Arc<Semaphore>>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(
                target: "repeater::connection",
                from = %previous,
                to = %next,
                "state changed"
            );
        }
    }

    fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        let outbound = self.outbound.lock();
        let sender = outbound.as_ref().ok_or(ConnectionError::NotConnected)?;
        sender.send(frame).map_err(|_| ConnectionError::LinkClosed)
    }

    fn ack<T: serde::Serialize>(&self, id: u64, payload: &T) {
        let frame = match Frame::ack(id, payload) {
            Ok(frame) => frame,
            Err(err) => {
                error!(target: "repeater::connection", id, error = %err, "failed to encode ack");
                return;
            }
        };
        if let Err(err) = self.send(frame) {
            warn!(target: "repeater::connection", id, error = %err, "ack not delivered");
        }
    }
}

struct Driver {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

pub struct ConnectionManager {
    dialer: Arc<dyn Dialer>,
    options: ConnectionOptions,
    shared: Arc<Shared>,
    driver: tokio::sync::Mutex<Option<Driver>>,
}

impl ConnectionManager {
    pub fn new(dialer: Arc<dyn Dialer>, options: ConnectionOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let limiter = options
            .max_in_flight
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));
        Self {
            dialer,
            options,
            shared: Arc::new(Shared {
                state,
                handlers: RwLock::new(Handlers::default()),
                outbound: Mutex::new(None),
                pending_deploy: Mutex::new(None),
                last_reconnect_error: Mutex::new(None),
                limiter,
            }),
            driver: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Most recent redial failure, kept until reconnection succeeds or
    /// the failure is reported.
    pub fn last_reconnect_error(&self) -> Option<ConnectionError> {
        self.shared.last_reconnect_error.lock().clone()
    }

    /// Installs a handler, replacing any handler of the same kind.
    pub fn on(&self, handler: EventHandler) {
        debug!(target: "repeater::connection", kind = handler.kind(), "handler installed");
        self.shared.handlers.write().install(handler);
    }

    /// Dials the controller, retrying transient failures.
    pub async fn connect(&self) -> Result<(), BackoffError<ConnectionError>> {
        let mut driver = self.driver.lock().await;
        match self.state() {
            ConnectionState::Disconnected => {}
            ConnectionState::Closed => return Err(BackoffError::Fatal(ConnectionError::Closed)),
            _ => return Err(BackoffError::Fatal(ConnectionError::AlreadyConnected)),
        }
        self.shared.set_state(ConnectionState::Connecting);

        let backoff = Backoff::new(self.options.connect_retries, ConnectionError::is_fatal)
            .with_label("connect");
        let dialer = self.dialer.clone();
        let link = match backoff.execute(|| dialer.dial()).await {
            Ok(link) => link,
            Err(err) => {
                self.shared.set_state(ConnectionState::Disconnected);
                return Err(err);
            }
        };

        *self.shared.outbound.lock() = Some(link.sender());
        self.shared.set_state(ConnectionState::Connected);
        info!(target: "repeater::connection", "connected to controller");

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(drive(
            self.shared.clone(),
            self.dialer.clone(),
            self.options.heartbeat_interval,
            link,
            shutdown.clone(),
        ));
        *driver = Some(Driver { task, shutdown });
        Ok(())
    }

    /// Registers this repeater and waits for the controller to confirm
    /// the assigned identity.
    pub async fn deploy(
        &self,
        repeater_id: Option<String>,
        runtime: Option<RuntimeInfo>,
    ) -> Result<DeployedPayload, ConnectionError> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        let (tx, rx) = oneshot::channel();
        *self.shared.pending_deploy.lock() = Some(tx);

        let payload = DeployPayload {
            repeater_id,
            runtime,
        };
        let frame = Frame::event(EVENT_DEPLOY, None, &payload)
            .map_err(|err| ConnectionError::Encode(err.to_string()))?;
        self.shared.send(frame)?;

        match tokio::time::timeout(self.options.deploy_timeout, rx).await {
            Ok(Ok(deployed)) => {
                info!(
                    target: "repeater::connection",
                    repeater_id = %deployed.repeater_id,
                    "repeater deployed"
                );
                Ok(deployed)
            }
            Ok(Err(_)) => Err(ConnectionError::LinkClosed),
            Err(_) => {
                self.shared.pending_deploy.lock().take();
                Err(ConnectionError::DeployTimeout(self.options.deploy_timeout))
            }
        }
    }

    /// Tears the link down and drops every handler. The manager cannot be
    /// reconnected afterwards.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        let mut driver = self.driver.lock().await;
        if !self.state().is_live() {
            return Err(ConnectionError::NotConnected);
        }
        if let Some(Driver { task, shutdown }) = driver.take() {
            shutdown.cancel();
            let _ = task.await;
        }
        self.shared.outbound.lock().take();
        self.shared.pending_deploy.lock().take();
        self.shared.handlers.write().clear();
        self.shared.set_state(ConnectionState::Closed);
        info!(target: "repeater::connection", "disconnected from controller");
        Ok(())
    }

    /// Resolves once the manager reaches `Closed`.
    pub async fn closed(&self) {
        let mut state = self.watch_state();
        let _ = state.wait_for(|state| *state == ConnectionState::Closed).await;
    }
}

enum LinkEnd {
    Shutdown,
    Lost,
}

async fn drive(
    shared: Arc<Shared>,
    dialer: Arc<dyn Dialer>,
    heartbeat: Duration,
    mut link: Link,
    shutdown: CancellationToken,
) {
    loop {
        let end = run_link(&shared, &mut link, heartbeat, &shutdown).await;
        shared.outbound.lock().take();
        link.close();
        if matches!(end, LinkEnd::Shutdown) {
            return;
        }

        shared.set_state(ConnectionState::Reconnecting);
        warn!(target: "repeater::connection", "lost connection to controller, reconnecting");

        let attempt = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = reconnect(&shared, dialer.as_ref()) => result,
        };
        match attempt {
            Ok(next) => {
                link = next;
                *shared.outbound.lock() = Some(link.sender());
                shared.last_reconnect_error.lock().take();
                shared.set_state(ConnectionState::Connected);
                info!(target: "repeater::connection", "reconnected to controller");
                let handler = shared.handlers.read().reconnected.clone();
                if let Some(handler) = handler {
                    tokio::spawn(async move {
                        if let Err(err) = handler(()).await {
                            warn!(target: "repeater::connection", error = %err, "reconnect handler failed");
                        }
                    });
                }
            }
            Err(attempts) => {
                let error = shared
                    .last_reconnect_error
                    .lock()
                    .take()
                    .unwrap_or(ConnectionError::LinkClosed);
                let message = human_message(&error);
                error!(
                    target: "repeater::connection",
                    attempts,
                    error = %message,
                    "reconnection failed"
                );
                let handler = shared.handlers.read().reconnection_failed.clone();
                if let Some(handler) = handler {
                    handler(ReconnectionFailure { attempts, error });
                }
                shared.set_state(ConnectionState::Closed);
                return;
            }
        }
    }
}

/// Redials under backoff. Every failure is recorded as the last
/// reconnection error; the attempt count is returned on give-up.
async fn reconnect(shared: &Shared, dialer: &dyn Dialer) -> Result<Link, u32> {
    let backoff = Backoff::new(RECONNECT_ATTEMPTS - 1, ConnectionError::is_fatal)
        .with_label("reconnect");
    backoff
        .execute(move || async move {
            let result = dialer.dial().await;
            if let Err(err) = &result {
                *shared.last_reconnect_error.lock() = Some(err.clone());
            }
            result
        })
        .await
        .map_err(|err| err.attempts())
}

async fn run_link(
    shared: &Arc<Shared>,
    link: &mut Link,
    heartbeat: Duration,
    shutdown: &CancellationToken,
) -> LinkEnd {
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    let mut last_seen = Instant::now();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return LinkEnd::Shutdown,
            frame = link.recv() => {
                let Some(frame) = frame else {
                    return LinkEnd::Lost;
                };
                last_seen = Instant::now();
                handle_frame(shared, frame);
            }
            _ = ticker.tick() => {
                if last_seen.elapsed() > heartbeat * 2 {
                    warn!(
                        target: "repeater::connection",
                        silent_ms = last_seen.elapsed().as_millis() as u64,
                        "controller stopped answering heartbeats"
                    );
                    return LinkEnd::Lost;
                }
                if link.send(Frame::Ping).is_err() {
                    return LinkEnd::Lost;
                }
            }
        }
    }
}

fn handle_frame(shared: &Arc<Shared>, frame: Frame) {
    match frame {
        Frame::Ping => {
            let _ = shared.send(Frame::Pong);
        }
        Frame::Pong => {}
        Frame::Ack { id, .. } => {
            debug!(target: "repeater::connection", id, "ignoring unsolicited ack");
        }
        Frame::Event { event, id, payload } => {
            let protocol = payload
                .get("protocol")
                .and_then(Value::as_str)
                .map(str::to_string);
            match InboundEvent::decode(&event, payload) {
                Ok(Some(inbound)) => {
                    debug!(target: "repeater::connection", event = inbound.name(), id, "event received");
                    dispatch(shared, inbound, id);
                }
                Ok(None) => {
                    debug!(target: "repeater::connection", event = %event, "ignoring unknown event");
                }
                Err(err) => {
                    warn!(
                        target: "repeater::connection",
                        event = %event,
                        error = %err,
                        "malformed event payload"
                    );
                    // A request with an id always gets an ack, even one we cannot read.
                    if let (EVENT_REQUEST, Some(id)) = (event.as_str(), id) {
                        let protocol = Protocol::from(protocol.unwrap_or_default());
                        shared.ack(
                            id,
                            &Response::error(
                                protocol,
                                ErrorCode::Other(INVALID_REQUEST_CODE.into()),
                                format!("malformed request: {err}"),
                            ),
                        );
                    }
                }
            }
        }
    }
}

fn dispatch(shared: &Arc<Shared>, event: InboundEvent, id: Option<u64>) {
    let handlers = shared.handlers.read().clone();
    match event {
        InboundEvent::Deployed(deployed) => match shared.pending_deploy.lock().take() {
            Some(waiter) => {
                let _ = waiter.send(deployed);
            }
            None => debug!(target: "repeater::connection", "unsolicited deployed event"),
        },
        InboundEvent::Request(request) => {
            let Some(handler) = handlers.request else {
                warn!(target: "repeater::connection", "request received with no handler installed");
                if let Some(id) = id {
                    shared.ack(
                        id,
                        &Response::error(
                            request.protocol,
                            ErrorCode::Other("ERR_NO_HANDLER".into()),
                            "repeater is not accepting requests",
                        ),
                    );
                }
                return;
            };
            let shared = shared.clone();
            tokio::spawn(async move {
                let _permit = match &shared.limiter {
                    Some(limiter) => limiter.clone().acquire_owned().await.ok(),
                    None => None,
                };
                let response = run_request(handler, request).await;
                if let Some(id) = id {
                    shared.ack(id, &response);
                }
            });
        }
        InboundEvent::TestNetwork(payload) => {
            let Some(handler) = handlers.test_network else {
                if let Some(id) = id {
                    shared.ack(
                        id,
                        &NetworkTestResult {
                            output: None,
                            error: Some("network tests are not supported".into()),
                        },
                    );
                }
                return;
            };
            let shared = shared.clone();
            tokio::spawn(async move {
                let result = match handler(payload).await {
                    Ok(result) => result,
                    Err(err) => {
                        warn!(target: "repeater::connection", error = %err, "network test failed");
                        NetworkTestResult {
                            output: None,
                            error: Some(err.to_string()),
                        }
                    }
                };
                if let Some(id) = id {
                    shared.ack(id, &result);
                }
            });
        }
        InboundEvent::ScriptsUpdated(payload) => {
            if let Some(handler) = handlers.scripts_updated {
                tokio::spawn(async move {
                    if let Err(err) = handler(payload).await {
                        warn!(target: "repeater::connection", error = %err, "script update failed");
                    }
                });
            }
        }
        InboundEvent::Error(payload) => {
            warn!(
                target: "repeater::connection",
                code = payload.code.as_deref().unwrap_or("unknown"),
                fatal = payload.fatal,
                "controller reported an error: {}",
                payload.message
            );
            if let Some(handler) = handlers.error {
                handler(payload);
            }
        }
        InboundEvent::UpdateAvailable(payload) => {
            if let Some(handler) = handlers.update_available {
                handler(payload);
            }
        }
    }
}

/// Runs a request handler in isolation. Errors and panics become error
/// responses for this request only.
async fn run_request(
    handler: Arc<dyn Fn(Request) -> HandlerFuture<Response> + Send + Sync>,
    request: Request,
) -> Response {
    let protocol = request.protocol.clone();
    let url = request.url.clone();
    match tokio::spawn(handler(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(err)) => {
            warn!(target: "repeater::connection", url = %url, error = %err, "request handler failed");
            let code = err
                .downcast_ref::<HubError>()
                .and_then(WithErrorCode::error_code)
                .unwrap_or_else(|| ErrorCode::Other("ERR_REQUEST_FAILED".into()));
            Response::error(protocol, code, err.to_string())
        }
        Err(join) => {
            error!(target: "repeater::connection", url = %url, error = %join, "request handler panicked");
            Response::error(
                protocol,
                ErrorCode::Other("ERR_REQUEST_FAILED".into()),
                "request handler panicked",
            )
        }
    }
}
