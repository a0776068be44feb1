use futures::future::BoxFuture;
use repeater_proto::{
    ErrorPayload, NetworkTestPayload, NetworkTestResult, Request, Response, ScriptsUpdatedPayload,
    UpdateAvailablePayload,
};
use std::future::Future;
use std::sync::Arc;

use super::ConnectionError;

pub type HandlerFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

type AsyncSlot<I, O> = Arc<dyn Fn(I) -> HandlerFuture<O> + Send + Sync>;
type SyncSlot<I> = Arc<dyn Fn(I) + Send + Sync>;

/// Reported once when reconnection gives up.
#[derive(Debug, Clone)]
pub struct ReconnectionFailure {
    pub attempts: u32,
    pub error: ConnectionError,
}

/// A subscription for one kind of connection event. Installing a handler
/// replaces any previous handler of the same kind.
#[derive(Clone)]
pub enum EventHandler {
    Request(AsyncSlot<Request, Response>),
    TestNetwork(AsyncSlot<NetworkTestPayload, NetworkTestResult>),
    ScriptsUpdated(AsyncSlot<ScriptsUpdatedPayload, ()>),
    Reconnected(AsyncSlot<(), ()>),
    Error(SyncSlot<ErrorPayload>),
    UpdateAvailable(SyncSlot<UpdateAvailablePayload>),
    ReconnectionFailed(SyncSlot<ReconnectionFailure>),
}

impl EventHandler {
    pub fn request<F, Fut>(handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
    {
        EventHandler::Request(Arc::new(move |request| -> HandlerFuture<Response> {
            Box::pin(handler(request))
        }))
    }

    pub fn test_network<F, Fut>(handler: F) -> Self
    where
        F: Fn(NetworkTestPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<NetworkTestResult>> + Send + 'static,
    {
        EventHandler::TestNetwork(Arc::new(
            move |payload| -> HandlerFuture<NetworkTestResult> { Box::pin(handler(payload)) },
        ))
    }

    pub fn scripts_updated<F, Fut>(handler: F) -> Self
    where
        F: Fn(ScriptsUpdatedPayload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        EventHandler::ScriptsUpdated(Arc::new(move |payload| -> HandlerFuture<()> {
            Box::pin(handler(payload))
        }))
    }

    pub fn reconnected<F, Fut>(handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        EventHandler::Reconnected(Arc::new(move |()| -> HandlerFuture<()> {
            Box::pin(handler())
        }))
    }

    pub fn error<F>(handler: F) -> Self
    where
        F: Fn(ErrorPayload) + Send + Sync + 'static,
    {
        EventHandler::Error(Arc::new(handler))
    }

    pub fn update_available<F>(handler: F) -> Self
    where
        F: Fn(UpdateAvailablePayload) + Send + Sync + 'static,
    {
        EventHandler::UpdateAvailable(Arc::new(handler))
    }

    pub fn reconnection_failed<F>(handler: F) -> Self
    where
        F: Fn(ReconnectionFailure) + Send + Sync + 'static,
    {
        EventHandler::ReconnectionFailed(Arc::new(handler))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EventHandler::Request(_) => "request",
            EventHandler::TestNetwork(_) => "test-network",
            EventHandler::ScriptsUpdated(_) => "scripts-updated",
            EventHandler::Reconnected(_) => "reconnected",
            EventHandler::Error(_) => "error",
            EventHandler::UpdateAvailable(_) => "update-available",
            EventHandler::ReconnectionFailed(_) => "reconnection_failed",
        }
    }
}

/// One slot per event kind.
#[derive(Default, Clone)]
pub(crate) struct Handlers {
    pub request: Option<AsyncSlot<Request, Response>>,
    pub test_network: Option<AsyncSlot<NetworkTestPayload, NetworkTestResult>>,
    pub scripts_updated: Option<AsyncSlot<ScriptsUpdatedPayload, ()>>,
    pub reconnected: Option<AsyncSlot<(), ()>>,
    pub error: Option<SyncSlot<ErrorPayload>>,
    pub update_available: Option<SyncSlot<UpdateAvailablePayload>>,
    pub reconnection_failed: Option<SyncSlot<ReconnectionFailure>>,
}

impl Handlers {
    pub fn install(&mut self, handler: EventHandler) {
        match handler {
            EventHandler::Request(slot) => self.request = Some(slot),
            EventHandler::TestNetwork(slot) => self.test_network = Some(slot),
            EventHandler::ScriptsUpdated(slot) => self.scripts_updated = Some(slot),
            EventHandler::Reconnected(slot) => self.reconnected = Some(slot),
            EventHandler::Error(slot) => self.error = Some(slot),
            EventHandler::UpdateAvailable(slot) => self.update_available = Some(slot),
            EventHandler::ReconnectionFailed(slot) => self.reconnection_failed = Some(slot),
        }
    }

    pub fn clear(&mut self) {
        *self = Handlers::default();
    }
}
