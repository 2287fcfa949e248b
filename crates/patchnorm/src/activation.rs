//! Pointwise activations applied to conditioning embeddings.
//!
//! Names follow the diffusion-model convention (`swish`, `silu`, `mish`,
//! `gelu`, `relu`). The lookup happens once, when a layer is built; the
//! forward pass only matches on the resolved variant.

use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;
use patchnorm_common::{NormError, Result};

/// A named, resolved nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamedActivation {
    /// `x * sigmoid(x)`; also answers to `swish`.
    Silu,
    /// `x * tanh(softplus(x))`.
    Mish,
    /// Exact (erf) GELU.
    Gelu,
    /// `max(0, x)`.
    Relu,
}

impl NamedActivation {
    pub fn apply(self, xs: &Tensor) -> Result<Tensor> {
        let out = match self {
            Self::Silu => xs.silu()?,
            Self::Mish => xs.mul(&softplus(xs)?.tanh()?)?,
            Self::Gelu => xs.gelu_erf()?,
            Self::Relu => xs.relu()?,
        };
        Ok(out)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Silu => "silu",
            Self::Mish => "mish",
            Self::Gelu => "gelu",
            Self::Relu => "relu",
        }
    }
}

impl fmt::Display for NamedActivation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NamedActivation {
    type Err = NormError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "swish" | "silu" => Ok(Self::Silu),
            "mish" => Ok(Self::Mish),
            "gelu" => Ok(Self::Gelu),
            "relu" => Ok(Self::Relu),
            _ => Err(NormError::UnknownActivation(s.to_string())),
        }
    }
}

/// Activation slot of a conditioning projector: nothing, or one named function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingActivation {
    #[default]
    Identity,
    Named(NamedActivation),
}

impl EmbeddingActivation {
    /// Resolve an optional activation name. `None` means identity.
    pub fn resolve(name: Option<&str>) -> Result<Self> {
        match name {
            None => Ok(Self::Identity),
            Some(name) => Ok(Self::Named(name.parse()?)),
        }
    }

    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Identity => Ok(xs.clone()),
            Self::Named(act) => act.apply(xs),
        }
    }
}

/// `log(1 + exp(x))` without overflow for large `x`.
fn softplus(xs: &Tensor) -> candle_core::Result<Tensor> {
    let tail = xs.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    xs.relu()?.add(&tail)
}
