//! Common types for the patchnorm crates
//!
//! This crate holds the error taxonomy shared by every normalization layer
//! and the TOML/environment configuration layer.

pub mod config;
pub mod error;

pub use config::{
    AdaGroupNormConfig, ConfigError, DEFAULT_EPS, GroupNormConfig, PatchNormConfig,
    SimulationConfig,
};
pub use error::{ErrorKind, NormError, Result};
