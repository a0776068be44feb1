//! Runs one repeater: connects, deploys, serves controller events until
//! shutdown or a fatal condition.

use parking_lot::Mutex;
use repeater_proto::{
    ErrorPayload, NetworkTestPayload, NetworkTestResult, Request, RuntimeInfo,
    ScriptsUpdatedPayload, UpdateAvailablePayload,
};
use std::future::Future;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::backoff::BackoffError;
use crate::config::RepeaterConfig;
use crate::connection::{
    ConnectionError, ConnectionManager, ConnectionOptions, Dialer, EventHandler,
    ReconnectionFailure, WebSocketDialer,
};
use crate::error::human_message;
use crate::executors::{ExecutorError, ExecutorRegistry};
use crate::hub::{CommandHub, HubError, NetworkDiagnostics};
use crate::scripts::ProcessSandbox;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Executors(#[from] ExecutorError),
    #[error("failed to load local scripts: {0}")]
    Scripts(#[source] HubError),
    #[error("failed to connect to the controller: {0}")]
    Connect(#[source] BackoffError<ConnectionError>),
    #[error("failed to deploy: {}", human_message(.0))]
    Deploy(#[source] ConnectionError),
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentExit {
    /// Shutdown was requested.
    Shutdown,
    /// The controller or the link failed in a way the agent cannot recover
    /// from.
    Fatal(String),
}

impl AgentExit {
    pub fn code(&self) -> i32 {
        match self {
            AgentExit::Shutdown => 0,
            AgentExit::Fatal(_) => 1,
        }
    }
}

pub struct RepeaterAgent {
    config: RepeaterConfig,
    hub: Arc<CommandHub>,
    manager: Arc<ConnectionManager>,
    repeater_id: Arc<Mutex<Option<String>>>,
}

impl RepeaterAgent {
    pub fn new(config: RepeaterConfig) -> Result<Self, AgentError> {
        let dialer = Arc::new(WebSocketDialer::new(
            config.endpoints.socket_url.clone(),
            config.token.clone(),
            config.domain.clone(),
        ));
        Self::with_dialer(config, dialer)
    }

    pub fn with_dialer(config: RepeaterConfig, dialer: Arc<dyn Dialer>) -> Result<Self, AgentError> {
        let executors = ExecutorRegistry::with_defaults(config.http.clone())?;
        let mut hub = CommandHub::new(executors).with_request_timeout(config.request_timeout);
        if let Some(command) = config.sandbox_command.as_deref() {
            if let Some(sandbox) = ProcessSandbox::from_command_line(command, config.sandbox_timeout) {
                hub = hub.with_sandbox(Arc::new(sandbox));
            }
        }
        if let Some(command) = config.diagnostics_command.as_deref() {
            if let Some(diagnostics) = NetworkDiagnostics::from_command_line(command) {
                hub = hub.with_diagnostics(diagnostics);
            }
        }

        let options = ConnectionOptions {
            heartbeat_interval: config.heartbeat_interval,
            max_in_flight: config.max_in_flight,
            ..ConnectionOptions::default()
        };
        let repeater_id = Arc::new(Mutex::new(config.repeater_id.clone()));
        Ok(Self {
            hub: Arc::new(hub),
            manager: Arc::new(ConnectionManager::new(dialer, options)),
            repeater_id,
            config,
        })
    }

    pub fn hub(&self) -> &Arc<CommandHub> {
        &self.hub
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// Identity assigned by the controller on the most recent deploy.
    pub fn repeater_id(&self) -> Option<String> {
        self.repeater_id.lock().clone()
    }

    /// Runs until ctrl-c or a fatal condition.
    pub async fn run(self) -> Result<AgentExit, AgentError> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<AgentExit, AgentError>
    where
        F: Future<Output = ()>,
    {
        if !self.config.scripts.is_empty() {
            self.hub
                .load_local_scripts(&self.config.scripts)
                .await
                .map_err(AgentError::Scripts)?;
            if self.config.sandbox_command.is_none() {
                warn!("local scripts are loaded but no sandbox command is configured");
            }
        }

        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel();
        self.install_handlers(fatal_tx);

        self.manager.connect().await.map_err(AgentError::Connect)?;
        let requested = self.repeater_id.lock().clone();
        let deployed = self
            .manager
            .deploy(requested, Some(runtime_info(&self.hub)))
            .await
            .map_err(AgentError::Deploy)?;
        *self.repeater_id.lock() = Some(deployed.repeater_id.clone());
        info!(
            repeater_id = %deployed.repeater_id,
            cluster = %self.config.endpoints.api_url,
            "repeater is ready"
        );

        let exit = tokio::select! {
            _ = shutdown => {
                info!("shutting down");
                AgentExit::Shutdown
            }
            reason = fatal_rx.recv() => {
                AgentExit::Fatal(reason.unwrap_or_else(|| "repeater stopped".to_string()))
            }
        };

        match self.manager.disconnect().await {
            Ok(()) | Err(ConnectionError::NotConnected) => {}
            Err(err) => warn!(error = %err, "disconnect failed"),
        }
        self.hub.reset_scripts();
        if let AgentExit::Fatal(reason) = &exit {
            error!("{reason}");
        }
        Ok(exit)
    }

    fn install_handlers(&self, fatal: mpsc::UnboundedSender<String>) {
        let hub = self.hub.clone();
        self.manager.on(EventHandler::request(move |request: Request| {
            let hub = hub.clone();
            async move { Ok::<_, anyhow::Error>(hub.send_request(request).await?) }
        }));

        let hub = self.hub.clone();
        self.manager
            .on(EventHandler::test_network(move |payload: NetworkTestPayload| {
                let hub = hub.clone();
                async move {
                    let targets = payload.input.targets();
                    let output = hub.test_network(payload.kind, &targets).await?;
                    Ok::<_, anyhow::Error>(NetworkTestResult {
                        output: Some(output),
                        error: None,
                    })
                }
            }));

        let hub = self.hub.clone();
        self.manager
            .on(EventHandler::scripts_updated(move |payload: ScriptsUpdatedPayload| {
                let hub = hub.clone();
                async move {
                    hub.compile_scripts(payload.script)?;
                    Ok::<_, anyhow::Error>(())
                }
            }));

        let manager = Arc::downgrade(&self.manager);
        let hub = self.hub.clone();
        let repeater_id = self.repeater_id.clone();
        self.manager.on(EventHandler::reconnected(move || {
            redeploy(manager.clone(), hub.clone(), repeater_id.clone())
        }));

        let controller_fatal = fatal.clone();
        self.manager.on(EventHandler::error(move |payload: ErrorPayload| {
            if payload.fatal {
                let _ = controller_fatal.send(format!("controller error: {}", payload.message));
            }
        }));

        self.manager.on(EventHandler::update_available(
            |payload: UpdateAvailablePayload| {
                warn!(
                    version = %payload.version,
                    running = env!("CARGO_PKG_VERSION"),
                    "a newer repeater version is available"
                );
            },
        ));

        self.manager.on(EventHandler::reconnection_failed(
            move |failure: ReconnectionFailure| {
                let _ = fatal.send(format!(
                    "lost the controller after {} reconnection attempts: {}",
                    failure.attempts,
                    human_message(&failure.error)
                ));
            },
        ));
    }
}

async fn redeploy(
    manager: Weak<ConnectionManager>,
    hub: Arc<CommandHub>,
    repeater_id: Arc<Mutex<Option<String>>>,
) -> anyhow::Result<()> {
    let Some(manager) = manager.upgrade() else {
        return Ok(());
    };
    let requested = repeater_id.lock().clone();
    let deployed = manager.deploy(requested, Some(runtime_info(&hub))).await?;
    info!(repeater_id = %deployed.repeater_id, "redeployed after reconnect");
    *repeater_id.lock() = Some(deployed.repeater_id);
    Ok(())
}

pub fn runtime_info(hub: &CommandHub) -> RuntimeInfo {
    RuntimeInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        scripts_loaded: hub.scripts_loaded(),
    }
}
