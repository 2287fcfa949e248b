//! `patchnorm config` subcommands.

use anyhow::{Context, Result};
use patchnorm::PatchNormConfig;

use crate::cli::ConfigAction;

/// Render the requested configuration as TOML.
pub fn render(action: ConfigAction, effective: &PatchNormConfig) -> Result<String> {
    let rendered = match action {
        ConfigAction::Show => effective.to_toml(),
        ConfigAction::Default => PatchNormConfig::default_toml(),
    };
    rendered.context("failed to serialize configuration")
}
