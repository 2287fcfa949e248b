//! Group normalization with learned per-channel affine parameters.
//!
//! [`GroupNorm`] is the single-device baseline. [`PatchGroupNorm`] computes
//! the same result when each worker holds only a height slice of the input;
//! the statistics come from a [`DistributedMomentEstimator`] and the rest of
//! the layer stays local.

use std::sync::Arc;

use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};
use patchnorm_collective::{CollectiveContext, LoopbackCollective};
use patchnorm_common::{GroupNormConfig, NormError, Result};
use tracing::{debug, info};

use crate::apply::AffineParams;
use crate::moments::{DistributedMomentEstimator, GroupMoments, dims4, local_group_moments};
use crate::shard::ShardExtent;

/// Everything one sharded forward call resolved for this worker.
#[derive(Debug, Clone)]
pub struct ShardOutput {
    /// Normalized local shard, in the input dtype.
    pub output: Tensor,
    pub moments: GroupMoments,
    pub extent: ShardExtent,
}

/// Load `weight` (init 1) and `bias` (init 0) for `num_channels`.
pub fn affine_from_var_builder(num_channels: usize, vb: &VarBuilder) -> Result<AffineParams> {
    let weight = vb.get_with_hints(num_channels, "weight", Init::Const(1.))?;
    let bias = vb.get_with_hints(num_channels, "bias", Init::Const(0.))?;
    AffineParams::new(weight, bias)
}

fn checked_affine(
    config: &GroupNormConfig,
    affine: Option<AffineParams>,
) -> Result<Option<AffineParams>> {
    config.validate()?;
    match affine {
        Some(params) if params.num_channels() != config.num_channels => {
            Err(NormError::shape_mismatch(
                "group_norm affine",
                format!("[{}]", config.num_channels),
                params.weight().dims(),
            ))
        }
        other => Ok(other),
    }
}

fn check_channels(op: &'static str, xs: &Tensor, num_channels: usize) -> Result<()> {
    let (_, c, _, _) = dims4(op, xs)?;
    if c != num_channels {
        return Err(NormError::shape_mismatch(op, format!("[B, {num_channels}, H, W]"), xs.dims()));
    }
    Ok(())
}

/// Normalize with `moments`, apply the optional affine map and restore the dtype.
fn finish(
    xs: &Tensor,
    moments: &GroupMoments,
    eps: f64,
    affine: Option<&AffineParams>,
) -> Result<Tensor> {
    let normed = moments.normalize(xs, eps)?;
    let out = match affine {
        Some(params) => params.apply(&normed)?,
        None => normed,
    };
    Ok(out.to_dtype(xs.dtype())?)
}

fn log_upcast(xs: &Tensor) {
    if matches!(xs.dtype(), DType::F16 | DType::BF16) {
        debug!(dtype = ?xs.dtype(), "upcasting to f32 for group statistics");
    }
}

// ── Unsharded baseline ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GroupNorm {
    config: GroupNormConfig,
    affine: Option<AffineParams>,
}

impl GroupNorm {
    pub fn new(config: GroupNormConfig, affine: Option<AffineParams>) -> Result<Self> {
        let affine = checked_affine(&config, affine)?;
        Ok(Self { config, affine })
    }

    /// Weights under `vb` when `config.affine`, none otherwise.
    pub fn load(config: GroupNormConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let affine = if config.affine {
            Some(affine_from_var_builder(config.num_channels, &vb)?)
        } else {
            None
        };
        Self::new(config, affine)
    }

    pub fn config(&self) -> &GroupNormConfig {
        &self.config
    }

    pub fn affine(&self) -> Option<&AffineParams> {
        self.affine.as_ref()
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        check_channels("group_norm", xs, self.config.num_channels)?;
        log_upcast(xs);
        let moments = local_group_moments(xs, self.config.num_groups)?;
        finish(xs, &moments, self.config.eps, self.affine.as_ref())
    }
}

// ── Height-sharded ────────────────────────────────────────────────────

/// Group normalization over one height shard of a larger feature map.
///
/// Every worker in the collective group must call [`Self::forward`] the same
/// number of times, in the same order, with shards that agree on batch size,
/// channels and width.
#[derive(Debug, Clone)]
pub struct PatchGroupNorm {
    config: GroupNormConfig,
    affine: Option<AffineParams>,
    estimator: DistributedMomentEstimator,
}

impl PatchGroupNorm {
    pub fn new(
        config: GroupNormConfig,
        affine: Option<AffineParams>,
        ctx: Arc<dyn CollectiveContext>,
    ) -> Result<Self> {
        let affine = checked_affine(&config, affine)?;
        let estimator = DistributedMomentEstimator::new(ctx, config.num_groups)?;
        info!(
            rank = estimator.context().rank(),
            world_size = estimator.context().world_size(),
            num_groups = config.num_groups,
            num_channels = config.num_channels,
            affine = affine.is_some(),
            "built patch group norm"
        );
        Ok(Self { config, affine, estimator })
    }

    pub fn load(
        config: GroupNormConfig,
        vb: VarBuilder,
        ctx: Arc<dyn CollectiveContext>,
    ) -> Result<Self> {
        config.validate()?;
        let affine = if config.affine {
            Some(affine_from_var_builder(config.num_channels, &vb)?)
        } else {
            None
        };
        Self::new(config, affine, ctx)
    }

    /// Single-worker layer; equivalent to [`GroupNorm`].
    pub fn single(config: GroupNormConfig, affine: Option<AffineParams>) -> Result<Self> {
        Self::new(config, affine, Arc::new(LoopbackCollective::new()))
    }

    pub fn config(&self) -> &GroupNormConfig {
        &self.config
    }

    pub fn context(&self) -> &dyn CollectiveContext {
        self.estimator.context()
    }

    /// Global statistics for this shard's feature map. Collective.
    pub fn moments(&self, xs: &Tensor) -> Result<GroupMoments> {
        check_channels("patch_group_norm", xs, self.config.num_channels)?;
        self.estimator.estimate(xs)
    }

    /// Normalizes the local shard. Collective.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_stats(xs)?.output)
    }

    /// [`Self::forward`], also returning the statistics and the shard extent
    /// it resolved. Same collective rounds as `forward`.
    pub fn forward_with_stats(&self, xs: &Tensor) -> Result<ShardOutput> {
        log_upcast(xs);
        check_channels("patch_group_norm", xs, self.config.num_channels)?;
        let (moments, extent) = self.estimator.estimate_with_extent(xs)?;
        let output = finish(xs, &moments, self.config.eps, self.affine.as_ref())?;
        Ok(ShardOutput { output, moments, extent })
    }
}
