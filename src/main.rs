use anyhow::{Context, Result};
use clap::Parser;
use skyplan::cli::Cli;
use skyplan_config::RuntimeConfig;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::load_from_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => RuntimeConfig::load().context("Failed to load configuration")?,
    };

    if let Some(region) = &cli.region {
        config.aws.region = region.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log.level = level.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            return ExitCode::from(skyplan::exit_code(&err));
        }
    };
    skyplan::init_tracing(&config);

    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, cancelling");
                on_signal.cancel();
            }
            Err(e) => warn!("Failed to install Ctrl+C handler: {}", e),
        }
    });

    match skyplan::commands::run(cli.command, cli.provider, config, token).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(skyplan::exit_code(&err))
        }
    }
}
