//! CLI command implementations

pub mod config;
pub mod simulate;

pub use simulate::{OutputFormat, RankReport, SimulateCommand, SimulationReport, run_simulation};
