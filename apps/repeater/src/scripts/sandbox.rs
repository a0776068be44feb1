use async_trait::async_trait;
use repeater_proto::Request;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{ScriptError, ScriptOrigin, VirtualScript};

/// Runs one script against one request and returns the transformed
/// request.
#[async_trait]
pub trait ScriptSandbox: Send + Sync {
    async fn run(&self, script: &VirtualScript, request: Request) -> Result<Request, ScriptError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Invocation<'a> {
    host_wildcard: &'a str,
    origin: ScriptOrigin,
    code: &'a str,
    request: &'a Request,
}

/// Spawns a fresh interpreter process per invocation. The process reads
/// one JSON invocation from stdin and prints the resulting request as
/// JSON on stdout.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessSandbox {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Splits a shell-style command line on whitespace.
    pub fn from_command_line(command: &str, timeout: Duration) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect(), timeout))
    }

    async fn invoke(&self, script: &VirtualScript, request: &Request) -> Result<Request, ScriptError> {
        let input = encode_invocation(script, request)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ScriptError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await.map_err(ScriptError::Io)?;
            stdin.shutdown().await.map_err(ScriptError::Io)?;
        }
        let output = child.wait_with_output().await.map_err(ScriptError::Io)?;

        if !output.status.success() {
            return Err(ScriptError::Failed {
                wildcard: script.host_wildcard().to_string(),
                status: output
                    .status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|source| ScriptError::InvalidOutput {
            wildcard: script.host_wildcard().to_string(),
            source,
        })
    }
}

fn encode_invocation(script: &VirtualScript, request: &Request) -> Result<Vec<u8>, ScriptError> {
    serde_json::to_vec(&Invocation {
        host_wildcard: script.host_wildcard(),
        origin: script.origin(),
        code: script.code(),
        request,
    })
    .map_err(|source| ScriptError::Encode {
        wildcard: script.host_wildcard().to_string(),
        source,
    })
}

#[async_trait]
impl ScriptSandbox for ProcessSandbox {
    async fn run(&self, script: &VirtualScript, request: Request) -> Result<Request, ScriptError> {
        debug!(
            target: "repeater::scripts",
            wildcard = script.host_wildcard(),
            program = %self.program,
            "running script"
        );
        match tokio::time::timeout(self.timeout, self.invoke(script, &request)).await {
            Ok(result) => result,
            Err(_) => Err(ScriptError::TimedOut {
                wildcard: script.host_wildcard().to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}
