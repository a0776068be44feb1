pub mod agent;
pub mod backoff;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod executors;
pub mod hub;
pub mod polling;
pub mod scripts;
pub mod telemetry;

pub use agent::{AgentError, AgentExit, RepeaterAgent};
pub use config::{PollingConfig, RepeaterConfig};
