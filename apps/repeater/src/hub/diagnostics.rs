//! Network diagnostics through an external interactive tool.
//!
//! The tool is started as `<program> <args..> --<type>` and asks for its
//! input through fixed prompts on stdout. Each prompt is answered once on
//! stdin; the completion marker closes stdin. Only exit status 0 with a
//! non-empty transcript counts as success.

use once_cell::sync::Lazy;
use regex::Regex;
use repeater_proto::NetworkTestType;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tracing::{debug, warn};

pub const URL_PROMPT: &str = "Please enter the target URLs to test (separated by commas)";
pub const HOST_PROMPT: &str = "Please enter the target hostname or IP";
pub const DONE_MARKER: &str = "Done!";

pub const DEFAULT_DIAGNOSTICS_TIMEOUT: Duration = Duration::from_secs(300);

static ANSI_SEQUENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()][A-Za-z0-9]|\x1b[=>78]")
        .expect("valid ansi pattern")
});

#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("no targets given for {0} test")]
    NoTargets(&'static str),
    #[error("failed to start diagnostic tool {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("diagnostic tool i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("diagnostic tool exited with status {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("diagnostic tool produced no output")]
    EmptyOutput,
    #[error("diagnostic tool did not finish within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone)]
pub struct NetworkDiagnostics {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl NetworkDiagnostics {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: DEFAULT_DIAGNOSTICS_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub async fn run(
        &self,
        kind: NetworkTestType,
        targets: &[&str],
    ) -> Result<String, DiagnosticsError> {
        if targets.is_empty() {
            return Err(DiagnosticsError::NoTargets(kind.as_str()));
        }
        match tokio::time::timeout(self.timeout, self.converse(kind, targets)).await {
            Ok(result) => result,
            Err(_) => Err(DiagnosticsError::TimedOut(self.timeout)),
        }
    }

    async fn converse(
        &self,
        kind: NetworkTestType,
        targets: &[&str],
    ) -> Result<String, DiagnosticsError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(format!("--{}", kind.as_str()))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DiagnosticsError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("diagnostic tool stdout not captured"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("diagnostic tool stderr not captured"))?;
        let stderr_task = tokio::spawn(async move {
            let mut collected = Vec::new();
            let _ = stderr.read_to_end(&mut collected).await;
            collected
        });

        let mut prompts = PromptState::new(child.stdin.take(), targets);
        let mut raw = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let read = stdout.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            raw.extend_from_slice(&chunk[..read]);
            let transcript = strip_ansi(&String::from_utf8_lossy(&raw));
            prompts.advance(&transcript).await?;
        }
        prompts.close().await;

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let stderr = strip_ansi(&String::from_utf8_lossy(&stderr)).trim().to_string();
            warn!(
                target: "repeater::hub",
                test = kind.as_str(),
                status = %status,
                "diagnostic tool failed"
            );
            return Err(DiagnosticsError::Failed {
                status: status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr,
            });
        }

        let transcript = clean_transcript(&String::from_utf8_lossy(&raw));
        if transcript.is_empty() {
            return Err(DiagnosticsError::EmptyOutput);
        }
        Ok(transcript)
    }
}

/// Which prompts have been answered, and the pipe to answer on.
struct PromptState {
    stdin: Option<ChildStdin>,
    urls: String,
    host: String,
    answered_urls: bool,
    answered_host: bool,
}

impl PromptState {
    fn new(stdin: Option<ChildStdin>, targets: &[&str]) -> Self {
        Self {
            stdin,
            urls: targets.join(","),
            host: targets.first().copied().unwrap_or_default().to_string(),
            answered_urls: false,
            answered_host: false,
        }
    }

    async fn advance(&mut self, transcript: &str) -> Result<(), DiagnosticsError> {
        if !self.answered_urls && transcript.contains(URL_PROMPT) {
            self.answered_urls = true;
            let answer = self.urls.clone();
            self.answer(&answer).await?;
        }
        if !self.answered_host && transcript.contains(HOST_PROMPT) {
            self.answered_host = true;
            let answer = self.host.clone();
            self.answer(&answer).await?;
        }
        if transcript.contains(DONE_MARKER) {
            self.close().await;
        }
        Ok(())
    }

    async fn answer(&mut self, line: &str) -> Result<(), DiagnosticsError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(());
        };
        debug!(target: "repeater::hub", answer = line, "answering diagnostic prompt");
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
    }
}

pub fn strip_ansi(text: &str) -> String {
    ANSI_SEQUENCE.replace_all(text, "").into_owned()
}

/// Strips escape sequences, keeps only the final rewrite of lines redrawn
/// with `\r`, and trims blank edges.
pub fn clean_transcript(text: &str) -> String {
    let stripped = strip_ansi(text);
    let lines: Vec<&str> = stripped
        .split('\n')
        .map(|line| {
            let line = line.strip_suffix('\r').unwrap_or(line);
            line.rsplit('\r').next().unwrap_or(line).trim_end()
        })
        .collect();
    lines.join("\n").trim().to_string()
}
