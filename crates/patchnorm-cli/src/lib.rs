//! patchnorm CLI library
//!
//! Exposes the argument parser and command implementations for testing.

pub mod cli;
pub mod commands;
pub mod exit;

pub use cli::{Cli, Commands, ConfigAction, LogFormat, build_cli};
