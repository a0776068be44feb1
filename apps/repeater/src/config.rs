use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::cli::{PollingArgs, RepeaterArgs};
use crate::executors::{default_whitelist_mime_types, HttpExecutorOptions};
use crate::polling::PollingOptions;

/// Path of the controller's repeater socket, relative to the cluster host.
pub const SOCKET_PATH: &str = "/api/v1/repeaters/socket";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Missing(&'static str),
    #[error("invalid cluster host {host}: {reason}")]
    InvalidHost { host: String, reason: String },
    #[error("invalid --scripts value: {0}")]
    InvalidScripts(String),
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("failed to read this machine's hostname: {0}")]
    Hostname(#[source] std::io::Error),
}

/// Socket and REST addresses derived from one cluster host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEndpoints {
    pub socket_url: String,
    pub api_url: String,
}

impl ClusterEndpoints {
    /// Accepts `host[:port]` or a full url. Without a scheme, localhost
    /// targets get plain `ws`/`http` and everything else `wss`/`https`.
    pub fn from_host(host: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidHost {
            host: host.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = host.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(ConfigError::Missing("cluster host"));
        }

        let (secure, authority) = match trimmed.split_once("://") {
            Some(("https" | "wss", rest)) => (true, rest),
            Some(("http" | "ws", rest)) => (false, rest),
            Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme {scheme}"))),
            None => (!is_local(trimmed), trimmed),
        };
        let (http, ws) = if secure { ("https", "wss") } else { ("http", "ws") };

        let api = Url::parse(&format!("{http}://{authority}"))
            .map_err(|err| invalid(&err.to_string()))?;
        if api.host_str().is_none() {
            return Err(invalid("missing host"));
        }
        let mut socket = api.clone();
        socket
            .set_scheme(ws)
            .map_err(|_| invalid("cannot derive socket url"))?;
        socket.set_path(SOCKET_PATH);
        Ok(Self {
            socket_url: socket.to_string(),
            api_url: api.as_str().trim_end_matches('/').to_string(),
        })
    }
}

fn is_local(authority: &str) -> bool {
    let host = if let Some(rest) = authority.strip_prefix('[') {
        rest.split(']').next().unwrap_or(rest)
    } else {
        authority.split([':', '/']).next().unwrap_or(authority)
    };
    let host = host.to_ascii_lowercase();
    host == "localhost" || host.ends_with(".localhost") || host == "127.0.0.1" || host == "::1"
}

/// `--scripts` is either a single file applied to every host or a JSON
/// object mapping host wildcards to files.
pub fn parse_scripts(value: &str) -> Result<BTreeMap<String, PathBuf>, ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(BTreeMap::new());
    }
    if value.starts_with('{') {
        let map: BTreeMap<String, PathBuf> = serde_json::from_str(value)
            .map_err(|err| ConfigError::InvalidScripts(err.to_string()))?;
        if let Some((wildcard, _)) = map.iter().find(|(wildcard, _)| wildcard.trim().is_empty()) {
            return Err(ConfigError::InvalidScripts(format!(
                "empty host wildcard {wildcard:?}"
            )));
        }
        return Ok(map);
    }
    Ok(BTreeMap::from([("*".to_string(), PathBuf::from(value))]))
}

fn positive_secs(secs: u64, name: &'static str) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::ZeroDuration(name));
    }
    Ok(Duration::from_secs(secs))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct RepeaterConfig {
    pub endpoints: ClusterEndpoints,
    pub token: String,
    /// Domain claim sent on the socket upgrade; the machine's hostname
    /// unless overridden.
    pub domain: String,
    pub repeater_id: Option<String>,
    pub request_timeout: Duration,
    pub http: HttpExecutorOptions,
    pub scripts: BTreeMap<String, PathBuf>,
    pub sandbox_command: Option<String>,
    pub sandbox_timeout: Duration,
    pub diagnostics_command: Option<String>,
    pub max_in_flight: Option<usize>,
    pub heartbeat_interval: Duration,
}

impl RepeaterConfig {
    pub fn from_args(args: &RepeaterArgs) -> Result<Self, ConfigError> {
        let token = args.token.trim();
        if token.is_empty() {
            return Err(ConfigError::Missing("token"));
        }
        let domain = match non_empty(args.hostname.as_deref()) {
            Some(domain) => domain,
            None => hostname::get()
                .map_err(ConfigError::Hostname)?
                .to_string_lossy()
                .into_owned(),
        };
        let whitelist_mime_types = if args.whitelist_mime_types.is_empty() {
            default_whitelist_mime_types()
        } else {
            args.whitelist_mime_types.clone()
        };

        Ok(Self {
            endpoints: ClusterEndpoints::from_host(&args.cluster)?,
            token: token.to_string(),
            domain,
            repeater_id: non_empty(args.repeater_id.as_deref()),
            request_timeout: positive_secs(args.request_timeout, "request timeout")?,
            http: HttpExecutorOptions {
                proxy: non_empty(args.proxy.as_deref()),
                insecure: args.insecure,
                max_content_length: args.max_content_length,
                whitelist_mime_types,
            },
            scripts: args
                .scripts
                .as_deref()
                .map(parse_scripts)
                .transpose()?
                .unwrap_or_default(),
            sandbox_command: non_empty(args.sandbox_command.as_deref()),
            sandbox_timeout: positive_secs(args.sandbox_timeout, "sandbox timeout")?,
            diagnostics_command: non_empty(args.diagnostics_command.as_deref()),
            max_in_flight: args.max_in_flight.filter(|bound| *bound > 0),
            heartbeat_interval: positive_secs(args.heartbeat_interval, "heartbeat interval")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub api_url: String,
    pub token: String,
    pub options: PollingOptions,
}

impl PollingConfig {
    pub fn from_args(args: &PollingArgs) -> Result<Self, ConfigError> {
        let token = args.token.trim();
        if token.is_empty() {
            return Err(ConfigError::Missing("api token"));
        }
        let project_id = args.project_id.trim();
        if project_id.is_empty() {
            return Err(ConfigError::Missing("project id"));
        }
        let discovery_id = args.discovery_id.trim();
        if discovery_id.is_empty() {
            return Err(ConfigError::Missing("discovery id"));
        }

        let mut options = PollingOptions::new(project_id, discovery_id);
        options.interval = positive_secs(args.interval, "polling interval")?;
        options.timeout = args
            .timeout
            .map(|secs| positive_secs(secs, "polling timeout"))
            .transpose()?;

        Ok(Self {
            api_url: ClusterEndpoints::from_host(&args.api)?.api_url,
            token: token.to_string(),
            options,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;

    fn repeater_args(extra: &[&str]) -> RepeaterArgs {
        let mut argv = vec![
            "repeater",
            "repeater",
            "--cluster",
            "cluster.example",
            "--token",
            "s3cret",
            "--hostname",
            "build-01",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Repeater(args) => args,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn remote_hosts_default_to_tls() {
        let endpoints = ClusterEndpoints::from_host("cluster.example").unwrap();
        assert_eq!(
            endpoints.socket_url,
            "wss://cluster.example/api/v1/repeaters/socket"
        );
        assert_eq!(endpoints.api_url, "https://cluster.example");
    }

    #[test]
    fn localhost_defaults_to_plain_transport() {
        let endpoints = ClusterEndpoints::from_host("localhost:8080").unwrap();
        assert_eq!(
            endpoints.socket_url,
            "ws://localhost:8080/api/v1/repeaters/socket"
        );
        assert_eq!(endpoints.api_url, "http://localhost:8080");
    }

    #[test]
    fn explicit_scheme_wins() {
        let endpoints = ClusterEndpoints::from_host("http://10.0.0.5:3000/").unwrap();
        assert_eq!(endpoints.socket_url, "ws://10.0.0.5:3000/api/v1/repeaters/socket");
        assert!(matches!(
            ClusterEndpoints::from_host("ftp://cluster.example"),
            Err(ConfigError::InvalidHost { .. })
        ));
        assert!(matches!(
            ClusterEndpoints::from_host("  "),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test_timeout::timeout]
    fn scripts_accept_a_path_or_a_wildcard_map() {
        let single = parse_scripts("./scripts/auth.js").unwrap();
        assert_eq!(single.get("*"), Some(&PathBuf::from("./scripts/auth.js")));

        let map = parse_scripts(r#"{"*.internal": "a.js", "api.example": "b.js"}"#).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get("*.internal"), Some(&PathBuf::from("a.js")));

        assert!(matches!(
            parse_scripts("{not json"),
            Err(ConfigError::InvalidScripts(_))
        ));
    }

    #[test_timeout::timeout]
    fn repeater_config_from_args() {
        let config = RepeaterConfig::from_args(&repeater_args(&[
            "--request-timeout",
            "5",
            "--scripts",
            "auth.js",
            "--max-in-flight",
            "0",
        ]))
        .unwrap();
        assert_eq!(config.domain, "build-01");
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.scripts.len(), 1);
        assert_eq!(config.max_in_flight, None);
        assert_eq!(config.http.whitelist_mime_types, default_whitelist_mime_types());
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        let err = RepeaterConfig::from_args(&repeater_args(&["--heartbeat-interval", "0"]))
            .unwrap_err();
        assert_eq!(err.to_string(), "heartbeat interval must be greater than zero");
    }

    #[test]
    fn polling_config_from_args() {
        let cli = Cli::try_parse_from([
            "repeater",
            "polling",
            "--api",
            "app.example",
            "--token",
            "key",
            "--project-id",
            "p1",
            "--discovery-id",
            "d1",
            "--timeout",
            "600",
        ])
        .unwrap();
        let Command::Polling(args) = cli.command else {
            panic!("expected polling command");
        };
        let config = PollingConfig::from_args(&args).unwrap();
        assert_eq!(config.api_url, "https://app.example");
        assert_eq!(config.options.interval, Duration::from_secs(10));
        assert_eq!(config.options.timeout, Some(Duration::from_secs(600)));
    }
}
