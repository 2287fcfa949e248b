//! Error types for normalization layers

use patchnorm_collective::CollectiveError;
use thiserror::Error;

/// Result alias used across the patchnorm crates.
pub type Result<T> = std::result::Result<T, NormError>;

/// Coarse classification of a [`NormError`].
///
/// Every kind is fatal: configuration errors surface before or at the
/// first forward call, protocol errors take down the whole worker group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Layer or input sizing does not fit together.
    Configuration,
    /// The collective exchange between workers failed.
    Protocol,
    /// The tensor backend rejected an operation.
    Tensor,
}

#[derive(Debug, Error)]
pub enum NormError {
    #[error("num_groups ({num_groups}) must divide num_channels ({num_channels})")]
    IndivisibleGroups { num_channels: usize, num_groups: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown activation function: {0}")]
    UnknownActivation(String),

    #[error("rank {rank} owns an empty shard; every worker needs at least one row")]
    EmptyShard { rank: usize },

    #[error("{op}: expected {expected}, got shape {actual:?}")]
    ShapeMismatch { op: &'static str, expected: String, actual: Vec<usize> },

    #[error("collective exchange failed: {0}")]
    Collective(#[from] CollectiveError),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

impl NormError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::IndivisibleGroups { .. }
            | Self::InvalidConfig(_)
            | Self::UnknownActivation(_)
            | Self::EmptyShard { .. }
            | Self::ShapeMismatch { .. } => ErrorKind::Configuration,
            Self::Collective(_) => ErrorKind::Protocol,
            Self::Tensor(_) => ErrorKind::Tensor,
        }
    }

    pub fn shape_mismatch(op: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        Self::ShapeMismatch { op, expected: expected.into(), actual: actual.to_vec() }
    }
}
