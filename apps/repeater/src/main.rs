use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use repeater::cli::{Cli, Command, PollingArgs, RepeaterArgs};
use repeater::polling::{DiscoveryPoller, HttpDiscoveryClient, PollingOutcome};
use repeater::{telemetry, PollingConfig, RepeaterAgent, RepeaterConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_level);

    let result = match cli.command {
        Command::Repeater(args) => run_repeater(args).await,
        Command::Polling(args) => run_polling(args).await,
    };
    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    }
}

async fn run_repeater(args: RepeaterArgs) -> Result<i32> {
    let config = RepeaterConfig::from_args(&args)?;
    info!(
        socket = %config.endpoints.socket_url,
        domain = %config.domain,
        "starting repeater"
    );
    let exit = RepeaterAgent::new(config)?.run().await?;
    Ok(exit.code())
}

async fn run_polling(args: PollingArgs) -> Result<i32> {
    let config = PollingConfig::from_args(&args)?;
    let client = Arc::new(HttpDiscoveryClient::new(&config.api_url, config.token)?);
    let poller = Arc::new(DiscoveryPoller::new(client, config.options));

    let stopper = poller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop();
        }
    });

    let code = match poller.start().await? {
        PollingOutcome::Finished(status) => {
            info!(status = %status, "discovery settled");
            0
        }
        PollingOutcome::TimedOut | PollingOutcome::Stopped => 0,
        PollingOutcome::NotFound => {
            warn!("discovery does not exist");
            1
        }
    };
    Ok(code)
}
