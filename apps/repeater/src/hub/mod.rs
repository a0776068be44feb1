//! Command hub: turns controller commands into local work.

use parking_lot::RwLock;
use repeater_proto::{
    ErrorCode, NetworkTestType, Protocol, Request, Response, ScriptSource,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::WithErrorCode;
use crate::executors::ExecutorRegistry;
use crate::scripts::{ScriptError, ScriptOrigin, ScriptSandbox, SetOutcome, VirtualScripts};

pub mod diagnostics;

pub use diagnostics::{DiagnosticsError, NetworkDiagnostics};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum HubError {
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(Protocol),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("network diagnostics are not configured")]
    DiagnosticsUnavailable,
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
}

impl WithErrorCode for HubError {
    fn error_code(&self) -> Option<ErrorCode> {
        let code = match self {
            HubError::UnsupportedProtocol(_) => ErrorCode::UnsupportedProtocol,
            HubError::Script(_) => ErrorCode::Other("ERR_SCRIPT_FAILED".into()),
            HubError::DiagnosticsUnavailable | HubError::Diagnostics(_) => return None,
        };
        Some(code)
    }
}

impl HubError {
    /// Error response carried back on the request's acknowledgement.
    pub fn into_response(self, protocol: Protocol) -> Response {
        let code = self
            .error_code()
            .unwrap_or_else(|| ErrorCode::Other("ERR_REQUEST_FAILED".into()));
        Response::error(protocol, code, self.to_string())
    }
}

pub struct CommandHub {
    executors: ExecutorRegistry,
    scripts: RwLock<VirtualScripts>,
    sandbox: Option<Arc<dyn ScriptSandbox>>,
    diagnostics: Option<NetworkDiagnostics>,
    request_timeout: Duration,
}

impl CommandHub {
    pub fn new(executors: ExecutorRegistry) -> Self {
        Self {
            executors,
            scripts: RwLock::new(VirtualScripts::new()),
            sandbox: None,
            diagnostics: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn ScriptSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: NetworkDiagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Replaces the controller-pushed script set. Has no effect while
    /// local scripts are loaded. Returns how many scripts were stored.
    pub fn compile_scripts(&self, source: ScriptSource) -> Result<usize, HubError> {
        let mut scripts = self.scripts.write();
        if scripts.has_origin(ScriptOrigin::Local) {
            warn!(
                target: "repeater::hub",
                "local scripts are loaded; ignoring scripts pushed by the controller"
            );
            return Ok(0);
        }
        scripts.clear(ScriptOrigin::Remote);
        let mut stored = 0;
        for (wildcard, code) in source.into_entries() {
            if scripts.set(&wildcard, ScriptOrigin::Remote, code)? == SetOutcome::Stored {
                stored += 1;
            }
        }
        info!(target: "repeater::hub", count = stored, "remote scripts compiled");
        Ok(stored)
    }

    /// Loads scripts from disk, keyed by host wildcard. Local scripts
    /// replace every script currently held, remote ones included.
    pub async fn load_local_scripts(
        &self,
        files: &BTreeMap<String, PathBuf>,
    ) -> Result<usize, HubError> {
        let mut loaded = Vec::with_capacity(files.len());
        for (wildcard, path) in files {
            let code = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ScriptError::Read {
                    path: path.clone(),
                    source,
                })?;
            loaded.push((wildcard.as_str(), code));
        }

        let mut scripts = self.scripts.write();
        scripts.clear_all();
        for (wildcard, code) in loaded {
            scripts.set(wildcard, ScriptOrigin::Local, code)?;
        }
        info!(target: "repeater::hub", count = scripts.size(), "local scripts loaded");
        Ok(scripts.size())
    }

    pub fn reset_scripts(&self) {
        self.scripts.write().clear_all();
    }

    pub fn scripts_loaded(&self) -> bool {
        !self.scripts.read().is_empty()
    }

    pub fn script_count(&self) -> usize {
        self.scripts.read().size()
    }

    /// Runs a controller request: executor lookup, script transform, then
    /// execution. Executor failures come back inside the `Response`.
    pub async fn send_request(&self, request: Request) -> Result<Response, HubError> {
        let executor = self
            .executors
            .get(&request.protocol)
            .ok_or_else(|| HubError::UnsupportedProtocol(request.protocol.clone()))?;
        let request = self.apply_scripts(request).await?;
        debug!(
            target: "repeater::hub",
            protocol = %request.protocol,
            url = %request.url,
            "dispatching request"
        );
        Ok(executor.execute(request, self.request_timeout).await)
    }

    async fn apply_scripts(&self, request: Request) -> Result<Request, HubError> {
        let Some(host) = request.host() else {
            return Ok(request);
        };
        let script = match self.scripts.read().find(&host) {
            Some(script) => script.clone(),
            None => return Ok(request),
        };
        let sandbox = self
            .sandbox
            .as_ref()
            .ok_or_else(|| ScriptError::NoSandbox { host: host.clone() })?;
        debug!(
            target: "repeater::hub",
            host = %host,
            wildcard = script.host_wildcard(),
            origin = %script.origin(),
            "applying script"
        );
        Ok(sandbox.run(&script, request).await?)
    }

    pub async fn test_network(
        &self,
        kind: NetworkTestType,
        targets: &[&str],
    ) -> Result<String, HubError> {
        let diagnostics = self
            .diagnostics
            .as_ref()
            .ok_or(HubError::DiagnosticsUnavailable)?;
        info!(
            target: "repeater::hub",
            test = kind.as_str(),
            targets = targets.len(),
            "running network test"
        );
        Ok(diagnostics.run(kind, targets).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::RequestExecutor;
    use crate::scripts::VirtualScript;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<Request>>,
    }

    #[async_trait]
    impl RequestExecutor for Recording {
        fn protocol(&self) -> Protocol {
            Protocol::Http
        }

        async fn execute(&self, request: Request, _timeout: Duration) -> Response {
            self.seen.lock().push(request);
            Response {
                status_code: Some(200),
                ..Response::new(Protocol::Http)
            }
        }
    }

    struct TagSandbox;

    #[async_trait]
    impl ScriptSandbox for TagSandbox {
        async fn run(
            &self,
            script: &VirtualScript,
            request: Request,
        ) -> Result<Request, ScriptError> {
            Ok(request.with_header("x-script", script.code()))
        }
    }

    fn hub_with(recording: Arc<Recording>) -> CommandHub {
        let mut registry = ExecutorRegistry::new();
        registry.register(recording);
        CommandHub::new(registry).with_sandbox(Arc::new(TagSandbox))
    }

    #[tokio::test]
    async fn unsupported_protocol_is_an_error_not_a_panic() {
        let hub = hub_with(Arc::new(Recording::default()));
        let err = hub
            .send_request(Request::new(Protocol::Tcp, "tcp://db.internal:5432"))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::UnsupportedProtocol(Protocol::Tcp)));

        let response = err.into_response(Protocol::Tcp);
        assert_eq!(response.error_code, Some(ErrorCode::UnsupportedProtocol));
    }

    #[tokio::test]
    async fn scripts_transform_requests_before_execution() {
        let recording = Arc::new(Recording::default());
        let hub = hub_with(recording.clone());
        hub.compile_scripts(ScriptSource::Single("signed".into()))
            .unwrap();

        let response = hub
            .send_request(Request::new(Protocol::Http, "http://api.internal/health"))
            .await
            .unwrap();
        assert_eq!(response.status_code, Some(200));

        let seen = recording.seen.lock();
        assert_eq!(
            seen[0].headers.get("x-script"),
            Some(&repeater_proto::HeaderValue::from("signed"))
        );
    }

    #[tokio::test]
    async fn local_scripts_shadow_remote_pushes() {
        let dir = std::env::temp_dir().join(format!("repeater-hub-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("local.js");
        tokio::fs::write(&path, "local-code").await.unwrap();

        let recording = Arc::new(Recording::default());
        let hub = hub_with(recording.clone());
        hub.compile_scripts(ScriptSource::Single("remote-code".into()))
            .unwrap();

        let files = BTreeMap::from([("*.internal".to_string(), path)]);
        assert_eq!(hub.load_local_scripts(&files).await.unwrap(), 1);
        assert_eq!(
            hub.compile_scripts(ScriptSource::Single("newer-remote".into()))
                .unwrap(),
            0
        );
        assert_eq!(hub.script_count(), 1);

        hub.send_request(Request::new(Protocol::Http, "http://api.internal/"))
            .await
            .unwrap();
        assert_eq!(
            recording.seen.lock()[0].headers.get("x-script"),
            Some(&repeater_proto::HeaderValue::from("local-code"))
        );
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn remote_pushes_replace_the_previous_remote_set() {
        let recording = Arc::new(Recording::default());
        let hub = hub_with(recording.clone());
        let first = BTreeMap::from([
            ("a.internal".to_string(), "x".to_string()),
            ("b.internal".to_string(), "y".to_string()),
        ]);
        assert_eq!(hub.compile_scripts(ScriptSource::ByHost(first)).unwrap(), 2);

        let second = BTreeMap::from([("c.internal".to_string(), "z".to_string())]);
        assert_eq!(hub.compile_scripts(ScriptSource::ByHost(second)).unwrap(), 1);
        assert_eq!(hub.script_count(), 1);

        hub.send_request(Request::new(Protocol::Http, "http://a.internal/"))
            .await
            .unwrap();
        hub.send_request(Request::new(Protocol::Http, "http://c.internal/"))
            .await
            .unwrap();
        let seen = recording.seen.lock();
        assert!(seen[0].headers.get("x-script").is_none());
        assert_eq!(
            seen[1].headers.get("x-script"),
            Some(&repeater_proto::HeaderValue::from("z"))
        );
    }

    #[tokio::test]
    async fn unknown_protocol_names_are_unsupported() {
        let hub = hub_with(Arc::new(Recording::default()));
        let err = hub
            .send_request(Request::new(
                Protocol::Other("amqp".into()),
                "amqp://broker.internal:5672",
            ))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "unsupported protocol: amqp");
        assert_eq!(err.error_code(), Some(ErrorCode::UnsupportedProtocol));
    }

    #[tokio::test]
    async fn matching_script_without_sandbox_fails_the_request() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(Recording::default()));
        let hub = CommandHub::new(registry);
        hub.compile_scripts(ScriptSource::Single("code".into()))
            .unwrap();

        let err = hub
            .send_request(Request::new(Protocol::Http, "http://api.internal/"))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Script(ScriptError::NoSandbox { .. })));
    }

    #[tokio::test]
    async fn network_test_requires_configured_tool() {
        let hub = hub_with(Arc::new(Recording::default()));
        assert!(matches!(
            hub.test_network(NetworkTestType::Ping, &["10.0.0.1"]).await,
            Err(HubError::DiagnosticsUnavailable)
        ));
    }
}
