use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command line of the `reclaimdb` binary
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Reclaims SQL Server storage by rewriting oversized tables and shrinking databases", long_about = None)]
pub struct CommonArgs {
    #[arg(
        short,
        long,
        default_value = "config.yaml",
        help = "Configuration file path (YAML or TOML)"
    )]
    pub config: PathBuf,

    #[arg(short, long, help = "Enable verbose logging", conflicts_with = "quiet")]
    pub verbose: bool,

    #[arg(short, long, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<CommonCommands>,
}

impl CommonArgs {
    pub fn command(&self) -> CommonCommands {
        self.command.clone().unwrap_or_default()
    }
}

#[derive(Subcommand, Debug, Clone, Default, PartialEq, Eq)]
pub enum CommonCommands {
    /// Rewrite oversized tables, then shrink each database (default)
    #[default]
    Run,
    /// Only wait for each database to be ONLINE and shrink it
    Shrink,
    /// Connect and list the tables a run would rewrite, without changing anything
    Plan,
    /// Validate configuration and exit
    Validate,
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::{Configuration, LoggingConfig};
    use anyhow::{Context, Result};
    use std::fs::OpenOptions;
    use std::sync::Mutex;
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    /// Filter directive implied by the verbosity flags, falling back to the configured level.
    pub fn log_directive(args: &CommonArgs, logging: &LoggingConfig) -> String {
        if args.quiet {
            "warn".to_string()
        } else if args.verbose {
            "debug".to_string()
        } else {
            logging.level.clone()
        }
    }

    /// Install the global subscriber: readable output on stderr plus an
    /// append-only copy in the configured log file. RUST_LOG wins over flags.
    pub fn init_logging(args: &CommonArgs, logging: &LoggingConfig) -> Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&logging.file)
            .with_context(|| format!("Failed to open log file {}", logging.file.display()))?;

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(log_directive(args, logging)))
            .context("Invalid log filter")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .try_init()
            .context("Failed to install log subscriber")?;

        Ok(())
    }

    /// Load and validate the configuration named on the command line
    pub fn load_config(args: &CommonArgs) -> Result<Configuration> {
        Configuration::load_from_path(&args.config).with_context(|| {
            format!(
                "Failed to load configuration from {}",
                args.config.display()
            )
        })
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("reclaimdb configuration:");
            println!("========================");
            println!("Driver: {}", config.database.driver);
            println!("Server: {}", config.database.server);
            println!("Login: {}", config.database.uid);
            println!("Databases: {}", config.database.databases.join(", "));
            println!("Row threshold: {}", config.row_threshold);
            println!("Capture limit: {}", config.rewrite.capture_limit);
            println!("Poll interval: {:?}", config.shrink.poll_interval);
            println!("Settle delay: {:?}", config.shrink.settle_delay);
            match config.shrink.max_wait {
                Some(max_wait) => println!("Max readiness wait: {max_wait:?}"),
                None => println!("Max readiness wait: unbounded"),
            }
            println!("Dry run: {}", config.dry_run);
            println!("Log file: {}", config.logging.file.display());
        }
        Ok(())
    }
}
