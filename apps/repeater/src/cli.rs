use clap::{Args, Parser, Subcommand};

use crate::executors::DEFAULT_MAX_CONTENT_LENGTH;

#[derive(Parser, Debug)]
#[command(name = "repeater", version)]
#[command(about = "Relay agent that runs scanner requests inside a private network")]
pub struct Cli {
    /// Log filter, e.g. `info` or `repeater=debug`. `RUST_LOG` takes precedence.
    #[arg(long, global = true, env = "REPEATER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to the controller and serve its requests
    Repeater(RepeaterArgs),
    /// Watch a discovery until it finishes
    Polling(PollingArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RepeaterArgs {
    /// Controller host (e.g. cluster.example or localhost:8080)
    #[arg(long, env = "REPEATER_CLUSTER")]
    pub cluster: String,

    #[arg(long, env = "REPEATER_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Identity to reclaim on deploy
    #[arg(long, env = "REPEATER_ID")]
    pub repeater_id: Option<String>,

    /// Domain claim sent to the controller (defaults to this machine's hostname)
    #[arg(long, env = "REPEATER_HOSTNAME")]
    pub hostname: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, env = "REPEATER_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout: u64,

    /// Proxy for outgoing HTTP requests
    #[arg(long, env = "REPEATER_PROXY")]
    pub proxy: Option<String>,

    /// Accept invalid TLS certificates from targets
    #[arg(long, env = "REPEATER_INSECURE")]
    pub insecure: bool,

    #[arg(long, env = "REPEATER_MAX_CONTENT_LENGTH", default_value_t = DEFAULT_MAX_CONTENT_LENGTH)]
    pub max_content_length: usize,

    /// MIME types exempt from truncation (comma separated)
    #[arg(
        long = "whitelist-mime-types",
        env = "REPEATER_WHITELIST_MIME_TYPES",
        value_delimiter = ','
    )]
    pub whitelist_mime_types: Vec<String>,

    /// Script file, or a JSON object mapping host wildcards to files
    #[arg(long, env = "REPEATER_SCRIPTS")]
    pub scripts: Option<String>,

    /// Command that executes request scripts
    #[arg(long, env = "REPEATER_SANDBOX_COMMAND")]
    pub sandbox_command: Option<String>,

    #[arg(long, env = "REPEATER_SANDBOX_TIMEOUT", default_value_t = 10)]
    pub sandbox_timeout: u64,

    /// Command that runs network tests
    #[arg(long, env = "REPEATER_DIAGNOSTICS_COMMAND")]
    pub diagnostics_command: Option<String>,

    /// Maximum requests executed at once (unbounded when unset)
    #[arg(long, env = "REPEATER_MAX_IN_FLIGHT")]
    pub max_in_flight: Option<usize>,

    #[arg(long, env = "REPEATER_HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub heartbeat_interval: u64,
}

#[derive(Args, Debug, Clone)]
pub struct PollingArgs {
    /// Status API host
    #[arg(long, env = "REPEATER_API")]
    pub api: String,

    #[arg(long, env = "REPEATER_API_TOKEN", hide_env_values = true)]
    pub token: String,

    #[arg(long, env = "REPEATER_PROJECT_ID")]
    pub project_id: String,

    #[arg(long, env = "REPEATER_DISCOVERY_ID")]
    pub discovery_id: String,

    /// Seconds between status checks
    #[arg(long, env = "REPEATER_POLLING_INTERVAL", default_value_t = 10)]
    pub interval: u64,

    /// Give up after this many seconds
    #[arg(long, env = "REPEATER_POLLING_TIMEOUT")]
    pub timeout: Option<u64>,
}
