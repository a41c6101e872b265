#![forbid(unsafe_code)]

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use crashblk::{Args, Config, SignalHub, Supervisor, SupervisorReport};
use crashblk_transport::LocalTransport;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_args(Args::parse()) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("invalid config: {err}");
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(report) if report.is_success() => ExitCode::SUCCESS,
        Ok(report) => {
            let failed = report.failures().count();
            tracing::error!(failed, total = report.outcomes.len(), "some devices failed");
            ExitCode::FAILURE
        }
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<SupervisorReport> {
    let hub = SignalHub::new();
    let _forwarder = hub
        .forward_os_signals()
        .context("install signal handlers")?;

    let transport = LocalTransport::with_capacity(config.max_devices);
    let supervisor = Supervisor::new(transport, hub);
    Ok(supervisor.run(&config.files, config.base_index).await)
}
