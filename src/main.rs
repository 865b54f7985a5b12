//! hangar - autoscaling daemon for ephemeral CI job runners
//!
//! The daemon registers a runner scale set with the upstream service,
//! listens for job lifecycle messages, and reconciles demand against a
//! fleet of single-use runners on a pluggable compute backend.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use hangar::config::{Configuration, LoggingConfiguration};

mod cmd;

#[derive(Parser)]
#[command(name = "hangar")]
#[command(about = "Autoscaling daemon for ephemeral CI job runners")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "hangar.toml")]
    config: String,

    /// Enable debug logging regardless of the configured level
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(cmd::Commands::Validate) = cli.command {
        init_logging(&LoggingConfiguration::default(), cli.debug);
        cmd::validate::run(&cli.config)?;
        return Ok(());
    }

    let config = match Configuration::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            // Logging has to come up so the load error is visible
            init_logging(&LoggingConfiguration::default(), cli.debug);
            error!("Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config.logging, cli.debug || config.debug);
    info!("Starting hangar v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = cmd::root::run(config).await {
        error!("Daemon error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize tracing from the logging section, overridden by --debug
/// and RUST_LOG
fn init_logging(logging: &LoggingConfiguration, debug: bool) {
    let level = if debug { "debug" } else { &logging.level };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("hangar={}", level).into());

    if logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
