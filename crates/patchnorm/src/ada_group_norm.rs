//! Embedding-conditioned group normalization.
//!
//! Instead of learned per-channel parameters, the output is modulated by a
//! per-sample `(scale, shift)` pair projected from a conditioning embedding
//! such as a diffusion timestep encoding:
//!
//! ```text
//! y = (x - E) / sqrt(var + eps) * (1 + scale) + shift
//! ```

use std::sync::Arc;

use candle_core::Tensor;
use candle_nn::{Linear, VarBuilder};
use patchnorm_collective::{CollectiveContext, LoopbackCollective};
use patchnorm_common::{AdaGroupNormConfig, NormError, Result};
use tracing::info;

use crate::activation::EmbeddingActivation;
use crate::group_norm::ShardOutput;
use crate::moments::{DistributedMomentEstimator, GroupMoments, dims4, local_group_moments};
use crate::projector::ConditioningProjector;

fn build_projector(config: &AdaGroupNormConfig, linear: Linear) -> Result<ConditioningProjector> {
    config.validate()?;
    let activation = EmbeddingActivation::resolve(config.act_fn.as_deref())?;
    let projector = ConditioningProjector::from_linear(linear, activation)?;
    if projector.out_dim() != config.out_dim || projector.embedding_dim() != config.embedding_dim
    {
        return Err(NormError::shape_mismatch(
            "ada_group_norm projection",
            format!("weight [{}, {}]", 2 * config.out_dim, config.embedding_dim),
            projector.linear().weight().dims(),
        ));
    }
    Ok(projector)
}

fn load_projector(config: &AdaGroupNormConfig, vb: VarBuilder) -> Result<ConditioningProjector> {
    config.validate()?;
    ConditioningProjector::new(config.embedding_dim, config.out_dim, config.act_fn.as_deref(), vb)
}

fn check_channels(op: &'static str, xs: &Tensor, out_dim: usize) -> Result<()> {
    let (_, c, _, _) = dims4(op, xs)?;
    if c != out_dim {
        return Err(NormError::shape_mismatch(op, format!("[B, {out_dim}, H, W]"), xs.dims()));
    }
    Ok(())
}

fn finish(
    xs: &Tensor,
    emb: &Tensor,
    moments: &GroupMoments,
    eps: f64,
    projector: &ConditioningProjector,
) -> Result<Tensor> {
    let scale_shift = projector.project(emb)?;
    let normed = moments.normalize(xs, eps)?;
    Ok(scale_shift.apply(&normed)?.to_dtype(xs.dtype())?)
}

/// Unsharded embedding-conditioned group norm.
#[derive(Debug, Clone)]
pub struct AdaGroupNorm {
    config: AdaGroupNormConfig,
    projector: ConditioningProjector,
}

impl AdaGroupNorm {
    /// Projection weights under `vb.pp("linear")`.
    pub fn load(config: AdaGroupNormConfig, vb: VarBuilder) -> Result<Self> {
        let projector = load_projector(&config, vb)?;
        Ok(Self { config, projector })
    }

    pub fn from_linear(config: AdaGroupNormConfig, linear: Linear) -> Result<Self> {
        let projector = build_projector(&config, linear)?;
        Ok(Self { config, projector })
    }

    pub fn config(&self) -> &AdaGroupNormConfig {
        &self.config
    }

    pub fn projector(&self) -> &ConditioningProjector {
        &self.projector
    }

    pub fn forward(&self, xs: &Tensor, emb: &Tensor) -> Result<Tensor> {
        check_channels("ada_group_norm", xs, self.config.out_dim)?;
        let moments = local_group_moments(xs, self.config.num_groups)?;
        finish(xs, emb, &moments, self.config.eps, &self.projector)
    }
}

/// Embedding-conditioned group norm over one height shard.
///
/// The projection is local; only the group statistics cross workers.
#[derive(Debug, Clone)]
pub struct PatchAdaGroupNorm {
    config: AdaGroupNormConfig,
    projector: ConditioningProjector,
    estimator: DistributedMomentEstimator,
}

impl PatchAdaGroupNorm {
    pub fn load(
        config: AdaGroupNormConfig,
        vb: VarBuilder,
        ctx: Arc<dyn CollectiveContext>,
    ) -> Result<Self> {
        let projector = load_projector(&config, vb)?;
        Self::with_projector(config, projector, ctx)
    }

    pub fn from_linear(
        config: AdaGroupNormConfig,
        linear: Linear,
        ctx: Arc<dyn CollectiveContext>,
    ) -> Result<Self> {
        let projector = build_projector(&config, linear)?;
        Self::with_projector(config, projector, ctx)
    }

    /// Single-worker layer; equivalent to [`AdaGroupNorm`].
    pub fn single(config: AdaGroupNormConfig, linear: Linear) -> Result<Self> {
        Self::from_linear(config, linear, Arc::new(LoopbackCollective::new()))
    }

    fn with_projector(
        config: AdaGroupNormConfig,
        projector: ConditioningProjector,
        ctx: Arc<dyn CollectiveContext>,
    ) -> Result<Self> {
        let estimator = DistributedMomentEstimator::new(ctx, config.num_groups)?;
        info!(
            rank = estimator.context().rank(),
            world_size = estimator.context().world_size(),
            num_groups = config.num_groups,
            out_dim = config.out_dim,
            embedding_dim = config.embedding_dim,
            activation = ?projector.activation(),
            "built patch ada group norm"
        );
        Ok(Self { config, projector, estimator })
    }

    pub fn config(&self) -> &AdaGroupNormConfig {
        &self.config
    }

    pub fn projector(&self) -> &ConditioningProjector {
        &self.projector
    }

    pub fn context(&self) -> &dyn CollectiveContext {
        self.estimator.context()
    }

    /// Global statistics for this shard's feature map. Collective.
    pub fn moments(&self, xs: &Tensor) -> Result<GroupMoments> {
        check_channels("patch_ada_group_norm", xs, self.config.out_dim)?;
        self.estimator.estimate(xs)
    }

    /// Normalizes the local shard and applies the conditioning. Collective.
    pub fn forward(&self, xs: &Tensor, emb: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_stats(xs, emb)?.output)
    }

    /// [`Self::forward`], also returning the statistics and the shard extent
    /// it resolved. Same collective rounds as `forward`.
    pub fn forward_with_stats(&self, xs: &Tensor, emb: &Tensor) -> Result<ShardOutput> {
        check_channels("patch_ada_group_norm", xs, self.config.out_dim)?;
        let (moments, extent) = self.estimator.estimate_with_extent(xs)?;
        let output = finish(xs, emb, &moments, self.config.eps, &self.projector)?;
        Ok(ShardOutput { output, moments, extent })
    }
}
