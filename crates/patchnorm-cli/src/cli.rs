//! Command-line arguments.

use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};

use crate::commands::SimulateCommand;

/// patchnorm - group normalization across height-sharded feature maps
#[derive(Debug, Parser)]
#[command(name = "patchnorm")]
#[command(about = "Simulate patch-parallel group normalization")]
#[command(long_about = r#"
Runs sharded group normalization over in-process workers and checks the
result against the single-device layer.

Examples:
  # Four workers, default layer shape
  patchnorm simulate --world-size 4

  # Embedding-conditioned variant with JSON output
  patchnorm simulate --conditioned --format json

  # Print the effective configuration
  patchnorm --config patchnorm.toml config show
"#)]
#[command(version)]
pub struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, value_name = "PATH", global = true, env = "PATCHNORM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, value_name = "LEVEL", global = true, default_value = "warn")]
    pub log_level: String,

    /// Log output format
    #[arg(long, value_enum, global = true, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run sharded normalization across simulated workers
    #[command(alias = "sim")]
    Simulate(SimulateCommand),

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Clone, Copy, Subcommand)]
pub enum ConfigAction {
    /// Show the effective configuration (file, environment and defaults)
    Show,
    /// Show the built-in defaults
    Default,
}

/// The clap command, for completions and help tests.
pub fn build_cli() -> clap::Command {
    Cli::command()
}
