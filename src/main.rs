//! reclaimdb: shrink SQL Server databases after rewriting their oversized tables.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::cli::{CommonArgs, CommonCommands, utils};
use common::config::Configuration;
use reclaimer::{CleanupCoordinator, DatabaseName, MssqlProvider, RunMode};
use tokio_util::sync::CancellationToken;

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

fn database_names(config: &Configuration) -> Result<Vec<DatabaseName>> {
    config
        .database
        .databases
        .iter()
        .map(|name| DatabaseName::new(name.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid database name in configuration")
}

fn run_mode(command: &CommonCommands, config: &Configuration) -> RunMode {
    match command {
        CommonCommands::Shrink => RunMode::ShrinkOnly,
        CommonCommands::Plan => RunMode::Plan,
        _ if config.dry_run => RunMode::Plan,
        _ => RunMode::Full,
    }
}

async fn run(args: CommonArgs) -> Result<ExitCode> {
    let config = utils::load_config(&args)?;
    let databases = database_names(&config)?;

    let command = args.command();
    match command {
        CommonCommands::Validate => {
            println!("Configuration {} is valid", args.config.display());
            return Ok(ExitCode::SUCCESS);
        }
        CommonCommands::Config { json } => {
            utils::display_config(&config, json)?;
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    utils::init_logging(&args, &config.logging)?;

    let mode = run_mode(&command, &config);
    let cancel = CancellationToken::new();
    let shutdown = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => {
                    log::warn!("Stopping after the current step");
                    cancel.cancel();
                }
                Err(e) => log::error!("Shutdown signal handling unavailable: {e:?}"),
            }
        })
    };

    let coordinator = CleanupCoordinator::from_config(Arc::new(MssqlProvider::new()), &config)
        .with_cancellation(cancel);
    let report = coordinator.run(&databases, mode).await;

    shutdown.abort();

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CommonArgs::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("reclaimdb: {e:?}");
            ExitCode::from(2)
        }
    }
}
