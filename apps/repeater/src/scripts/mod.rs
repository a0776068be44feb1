//! Request transformation scripts keyed by host wildcard.
//!
//! The store only keeps, orders and selects scripts. Running one goes
//! through a [`ScriptSandbox`], which lives outside this process.

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, warn};

pub mod sandbox;

pub use sandbox::{ProcessSandbox, ScriptSandbox};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptOrigin {
    /// Loaded from disk at startup.
    Local,
    /// Pushed by the controller.
    Remote,
}

impl ScriptOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptOrigin::Local => "local",
            ScriptOrigin::Remote => "remote",
        }
    }
}

impl fmt::Display for ScriptOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("invalid host wildcard {wildcard:?}: {source}")]
    InvalidWildcard {
        wildcard: String,
        #[source]
        source: regex::Error,
    },
    #[error("failed to read script {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a script matches {host} but no script sandbox is configured")]
    NoSandbox { host: String },
    #[error("failed to start script sandbox: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("script sandbox i/o failed: {0}")]
    Io(#[source] std::io::Error),
    #[error("script for {wildcard} exited with status {status}: {stderr}")]
    Failed {
        wildcard: String,
        status: String,
        stderr: String,
    },
    #[error("failed to encode the script invocation for {wildcard}: {source}")]
    Encode {
        wildcard: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("script for {wildcard} produced an invalid request: {source}")]
    InvalidOutput {
        wildcard: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("script for {wildcard} did not finish within {timeout_ms}ms")]
    TimedOut { wildcard: String, timeout_ms: u64 },
}

/// A stored script together with its compiled host matcher.
#[derive(Debug, Clone)]
pub struct VirtualScript {
    host_wildcard: String,
    origin: ScriptOrigin,
    code: String,
    matcher: Regex,
}

impl VirtualScript {
    pub fn new(
        host_wildcard: impl Into<String>,
        origin: ScriptOrigin,
        code: impl Into<String>,
    ) -> Result<Self, ScriptError> {
        let host_wildcard = host_wildcard.into();
        let matcher = compile_wildcard(&host_wildcard)?;
        Ok(Self {
            host_wildcard,
            origin,
            code: code.into(),
            matcher,
        })
    }

    pub fn host_wildcard(&self) -> &str {
        &self.host_wildcard
    }

    pub fn origin(&self) -> ScriptOrigin {
        self.origin
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn matches(&self, host: &str) -> bool {
        self.matcher.is_match(host)
    }

    /// Literal characters first, pattern length second.
    fn specificity(&self) -> (usize, usize) {
        let literal = self
            .host_wildcard
            .chars()
            .filter(|c| !matches!(c, '*' | '?'))
            .count();
        (literal, self.host_wildcard.len())
    }
}

/// `*` spans any run of characters, `?` exactly one. Case-insensitive.
fn compile_wildcard(wildcard: &str) -> Result<Regex, ScriptError> {
    let mut pattern = String::with_capacity(wildcard.len() + 8);
    pattern.push('^');
    for c in wildcard.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
        }
    }
    pattern.push('$');
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| ScriptError::InvalidWildcard {
            wildcard: wildcard.to_string(),
            source,
        })
}

/// Outcome of [`VirtualScripts::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Stored,
    /// A remote script was refused because local scripts are active.
    Rejected,
}

/// Script storage with local-over-remote precedence.
#[derive(Debug, Default)]
pub struct VirtualScripts {
    entries: Vec<VirtualScript>,
}

impl VirtualScripts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a script, replacing any entry with the same wildcard and
    /// origin. Remote scripts are refused while any local script exists.
    pub fn set(
        &mut self,
        host_wildcard: &str,
        origin: ScriptOrigin,
        code: impl Into<String>,
    ) -> Result<SetOutcome, ScriptError> {
        if origin == ScriptOrigin::Remote && self.has_origin(ScriptOrigin::Local) {
            warn!(
                target: "repeater::scripts",
                wildcard = host_wildcard,
                "ignoring remote script: local scripts take precedence"
            );
            return Ok(SetOutcome::Rejected);
        }
        let script = VirtualScript::new(host_wildcard, origin, code)?;
        self.entries
            .retain(|entry| !(entry.origin == origin && entry.host_wildcard == host_wildcard));
        debug!(
            target: "repeater::scripts",
            wildcard = host_wildcard,
            origin = %origin,
            "script stored"
        );
        self.entries.push(script);
        Ok(SetOutcome::Stored)
    }

    pub fn clear(&mut self, origin: ScriptOrigin) {
        self.entries.retain(|entry| entry.origin != origin);
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_origin(&self, origin: ScriptOrigin) -> bool {
        self.entries.iter().any(|entry| entry.origin == origin)
    }

    /// Most specific script matching `host`. Local scripts outrank remote
    /// ones regardless of specificity.
    pub fn find(&self, host: &str) -> Option<&VirtualScript> {
        self.entries
            .iter()
            .filter(|entry| entry.matches(host))
            .max_by_key(|entry| (entry.origin == ScriptOrigin::Local, entry.specificity()))
    }
}
