//! patchnorm CLI application
//!
//! Simulates patch-parallel group normalization on in-process workers and
//! inspects the layered TOML/environment configuration.

use anyhow::{Context, Result};
use clap::Parser;
use patchnorm::PatchNormConfig;
use tracing::{error, warn};

use patchnorm_cli::commands::config::render;
use patchnorm_cli::exit::{EXIT_SUCCESS, EXIT_TOLERANCE, exit_code_for};
use patchnorm_cli::{Cli, Commands, LogFormat};

fn main() {
    let cli = Cli::parse();
    setup_logging(&cli.log_level, cli.log_format);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("Command failed: {e}");
            let mut source = e.source();
            while let Some(err) = source {
                error!("  Caused by: {err}");
                source = err.source();
            }
            eprintln!("error: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_configuration(&cli)?;
    match cli.command {
        Commands::Simulate(cmd) => {
            let report = cmd.execute(&config)?;
            if report.passed {
                Ok(EXIT_SUCCESS)
            } else {
                warn!(
                    max_output_error = report.max_output_error,
                    max_moment_error = report.max_moment_error,
                    tolerance = report.tolerance,
                    "sharded result differs from the single-device baseline"
                );
                Ok(EXIT_TOLERANCE)
            }
        }
        Commands::Config { action } => {
            println!("{}", render(action, &config)?);
            Ok(EXIT_SUCCESS)
        }
    }
}

/// File (when given) then `PATCHNORM_*` environment overrides.
fn load_configuration(cli: &Cli) -> Result<PatchNormConfig> {
    match &cli.config {
        Some(path) => PatchNormConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display())),
        None => PatchNormConfig::from_env().context("failed to build configuration"),
    }
}

/// Logs go to stderr so reports on stdout stay machine-readable.
fn setup_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => {
            subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).init();
        }
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
    }
}
