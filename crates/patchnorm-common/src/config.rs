//! Layer and simulation configuration.
//!
//! Loads [`PatchNormConfig`] from a TOML file (`patchnorm.toml`) with
//! environment variable overrides via `PATCHNORM_*` prefixed variables.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use crate::error::NormError;

/// Default epsilon added to the variance before the square root.
pub const DEFAULT_EPS: f64 = 1e-5;

/// Configuration of an affine group normalization layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupNormConfig {
    /// Number of contiguous channel groups.
    /// Override: `PATCHNORM_NUM_GROUPS`
    pub num_groups: usize,

    /// Channels expected on the input.
    /// Override: `PATCHNORM_NUM_CHANNELS`
    pub num_channels: usize,

    /// Added to the variance before the square root.
    /// Override: `PATCHNORM_EPS`
    pub eps: f64,

    /// Learn per-channel `weight` and `bias`.
    /// Override: `PATCHNORM_AFFINE`
    pub affine: bool,
}

impl Default for GroupNormConfig {
    fn default() -> Self {
        Self { num_groups: 32, num_channels: 128, eps: DEFAULT_EPS, affine: true }
    }
}

impl GroupNormConfig {
    pub fn new(num_groups: usize, num_channels: usize) -> Self {
        Self { num_groups, num_channels, ..Self::default() }
    }

    #[must_use]
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    #[must_use]
    pub fn with_affine(mut self, affine: bool) -> Self {
        self.affine = affine;
        self
    }

    pub fn channels_per_group(&self) -> usize {
        self.num_channels / self.num_groups.max(1)
    }

    pub fn validate(&self) -> Result<(), NormError> {
        validate_groups(self.num_channels, self.num_groups)?;
        validate_eps(self.eps)
    }
}

/// Configuration of an embedding-conditioned group normalization layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaGroupNormConfig {
    /// Width of the conditioning embedding.
    pub embedding_dim: usize,
    /// Channels produced by the layer; the projection emits `2 * out_dim`.
    pub out_dim: usize,
    pub num_groups: usize,
    /// Activation applied to the embedding before projection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act_fn: Option<String>,
    pub eps: f64,
}

impl Default for AdaGroupNormConfig {
    fn default() -> Self {
        Self { embedding_dim: 512, out_dim: 128, num_groups: 32, act_fn: None, eps: DEFAULT_EPS }
    }
}

impl AdaGroupNormConfig {
    pub fn new(embedding_dim: usize, out_dim: usize, num_groups: usize) -> Self {
        Self { embedding_dim, out_dim, num_groups, ..Self::default() }
    }

    #[must_use]
    pub fn with_act_fn(mut self, act_fn: impl Into<String>) -> Self {
        self.act_fn = Some(act_fn.into());
        self
    }

    #[must_use]
    pub fn with_eps(mut self, eps: f64) -> Self {
        self.eps = eps;
        self
    }

    pub fn validate(&self) -> Result<(), NormError> {
        if self.embedding_dim == 0 {
            return Err(NormError::InvalidConfig("embedding_dim must be > 0".into()));
        }
        validate_groups(self.out_dim, self.num_groups)?;
        validate_eps(self.eps)
    }
}

/// Shape and seed of an in-process multi-worker simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Override: `PATCHNORM_WORLD_SIZE`
    pub world_size: usize,
    /// Override: `PATCHNORM_BATCH_SIZE`
    pub batch_size: usize,
    /// Global image height, split across workers.
    /// Override: `PATCHNORM_HEIGHT`
    pub height: usize,
    /// Override: `PATCHNORM_WIDTH`
    pub width: usize,
    /// Override: `PATCHNORM_SEED`
    pub seed: u64,
    /// Largest absolute difference accepted against the unsharded baseline.
    pub tolerance: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self { world_size: 2, batch_size: 1, height: 32, width: 32, seed: 0, tolerance: 1e-4 }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), NormError> {
        if self.world_size == 0 {
            return Err(NormError::InvalidConfig("world_size must be >= 1".into()));
        }
        if self.batch_size == 0 {
            return Err(NormError::InvalidConfig("batch_size must be >= 1".into()));
        }
        if self.width == 0 {
            return Err(NormError::InvalidConfig("width must be >= 1".into()));
        }
        if self.height < self.world_size {
            return Err(NormError::InvalidConfig(format!(
                "height ({}) must be >= world_size ({}) so every worker owns a row",
                self.height, self.world_size
            )));
        }
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(NormError::InvalidConfig(format!(
                "tolerance must be finite and > 0, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchNormConfig {
    pub group_norm: GroupNormConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditioning: Option<AdaGroupNormConfig>,
    pub simulation: SimulationConfig,
}

/// Errors that can occur when loading or validating a [`PatchNormConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("validation failed: {0}")]
    Invalid(#[from] NormError),
    #[error("invalid environment override {key}={value}: {reason}")]
    EnvOverride { key: String, value: String, reason: String },
}

impl PatchNormConfig {
    /// Default configuration rendered as TOML.
    pub fn default_toml() -> Result<String, ConfigError> {
        Self::default().to_toml()
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load configuration from a TOML file, falling back to defaults for
    /// missing fields, then apply environment variable overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load from TOML string (useful for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut cfg: PatchNormConfig = toml::from_str(toml_str)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load only from environment variables, starting from defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.group_norm.validate()?;
        if let Some(conditioning) = &self.conditioning {
            conditioning.validate()?;
        }
        self.simulation.validate()?;
        Ok(())
    }

    /// Apply `PATCHNORM_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_override("PATCHNORM_NUM_GROUPS")? {
            self.group_norm.num_groups = v;
        }
        if let Some(v) = env_override("PATCHNORM_NUM_CHANNELS")? {
            self.group_norm.num_channels = v;
        }
        if let Some(v) = env_override("PATCHNORM_EPS")? {
            self.group_norm.eps = v;
        }
        if let Some(v) = env_flag("PATCHNORM_AFFINE")? {
            self.group_norm.affine = v;
        }
        if let Some(v) = env_override("PATCHNORM_WORLD_SIZE")? {
            self.simulation.world_size = v;
        }
        if let Some(v) = env_override("PATCHNORM_BATCH_SIZE")? {
            self.simulation.batch_size = v;
        }
        if let Some(v) = env_override("PATCHNORM_HEIGHT")? {
            self.simulation.height = v;
        }
        if let Some(v) = env_override("PATCHNORM_WIDTH")? {
            self.simulation.width = v;
        }
        if let Some(v) = env_override("PATCHNORM_SEED")? {
            self.simulation.seed = v;
        }
        Ok(())
    }
}

fn env_override<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(val) => val.parse::<T>().map(Some).map_err(|e| ConfigError::EnvOverride {
            key: key.into(),
            value: val.clone(),
            reason: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

/// Boolean override: `1/true/yes/on` or `0/false/no/off`, any case.
fn env_flag(key: &str) -> Result<Option<bool>, ConfigError> {
    let Ok(val) = std::env::var(key) else {
        return Ok(None);
    };
    let normalized = val.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::EnvOverride {
            key: key.into(),
            value: val,
            reason: "expected one of 1/true/yes/on or 0/false/no/off".into(),
        }),
    }
}

fn validate_groups(num_channels: usize, num_groups: usize) -> Result<(), NormError> {
    if num_groups == 0 {
        return Err(NormError::InvalidConfig("num_groups must be >= 1".into()));
    }
    if num_channels == 0 {
        return Err(NormError::InvalidConfig("num_channels must be >= 1".into()));
    }
    if num_channels % num_groups != 0 {
        return Err(NormError::IndivisibleGroups { num_channels, num_groups });
    }
    Ok(())
}

fn validate_eps(eps: f64) -> Result<(), NormError> {
    if !eps.is_finite() || eps <= 0.0 {
        return Err(NormError::InvalidConfig(format!("eps must be finite and > 0, got {eps}")));
    }
    Ok(())
}
