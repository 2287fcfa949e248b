//! Distributed per-group mean and variance.
//!
//! The estimator runs two all-gather rounds after the height exchange:
//!
//! 1. every worker sums its shard per `(batch, group)`; the gathered partial
//!    sums, added in rank order and divided by the global element count,
//!    give the group mean `E`;
//! 2. every worker sums `(x - E)^2` against that global mean; the same
//!    gather-sum-divide yields the biased variance.
//!
//! No worker ever holds more than its own shard plus `world_size * B * G`
//! partial values. Two passes against the global mean keep the variance
//! as stable as the unsharded computation, unlike `E[x^2] - E[x]^2`.

use std::sync::Arc;

use candle_core::{DType, Tensor};
use patchnorm_collective::CollectiveContext;
use patchnorm_common::{NormError, Result};
use tracing::debug;

use crate::shard::{ShardExtent, resolve_shard_extent};

/// Dimensions summed over in the grouped `[B, G, C/G, h, w]` view.
const GROUP_REDUCE_DIMS: (usize, usize, usize) = (2, 3, 4);

/// Per-`(batch, group)` statistics, valid for one forward call.
#[derive(Debug, Clone)]
pub struct GroupMoments {
    /// `[batch, num_groups]`
    pub mean: Tensor,
    /// Biased variance, `[batch, num_groups]`.
    pub var: Tensor,
    /// Elements per group across all shards: `C/G * global_height * width`.
    pub count: usize,
}

impl GroupMoments {
    pub fn num_groups(&self) -> usize {
        self.mean.dims().get(1).copied().unwrap_or(0)
    }

    /// `(x - E) / sqrt(var + eps)` for a `[B, C, h, w]` shard.
    pub fn normalize(&self, xs: &Tensor, eps: f64) -> Result<Tensor> {
        let (b, c, h, w) = dims4("normalize", xs)?;
        let g = self.num_groups();
        if self.mean.dims() != [b, g] || g == 0 || c % g != 0 {
            return Err(NormError::shape_mismatch(
                "normalize",
                format!("[B, C, H, W] matching moments of shape {:?}", self.mean.dims()),
                xs.dims(),
            ));
        }
        let grouped = xs.to_dtype(DType::F32)?.reshape((b, g, c / g, h, w))?;
        let mean = self.mean.reshape((b, g, 1, 1, 1))?;
        let std = self.var.affine(1.0, eps)?.sqrt()?.reshape((b, g, 1, 1, 1))?;
        let normed = grouped.broadcast_sub(&mean)?.broadcast_div(&std)?;
        Ok(normed.reshape((b, c, h, w))?)
    }
}

/// Computes exact global group statistics for a height-sharded tensor.
#[derive(Debug, Clone)]
pub struct DistributedMomentEstimator {
    ctx: Arc<dyn CollectiveContext>,
    num_groups: usize,
}

impl DistributedMomentEstimator {
    pub fn new(ctx: Arc<dyn CollectiveContext>, num_groups: usize) -> Result<Self> {
        if num_groups == 0 {
            return Err(NormError::InvalidConfig("num_groups must be >= 1".into()));
        }
        Ok(Self { ctx, num_groups })
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn context(&self) -> &dyn CollectiveContext {
        self.ctx.as_ref()
    }

    /// Statistics of the global tensor this worker holds a height slice of.
    ///
    /// Issues three collective calls (heights, sums, squared deviations);
    /// every rank must call this in lock-step with a matching batch size,
    /// channel count and width.
    pub fn estimate(&self, xs: &Tensor) -> Result<GroupMoments> {
        Ok(self.estimate_with_extent(xs)?.0)
    }

    /// Same as [`Self::estimate`], also returning the resolved shard extent.
    pub fn estimate_with_extent(&self, xs: &Tensor) -> Result<(GroupMoments, ShardExtent)> {
        let (b, c, h, w) = dims4("estimate", xs)?;
        let g = self.num_groups;
        if c % g != 0 {
            return Err(NormError::IndivisibleGroups { num_channels: c, num_groups: g });
        }
        let extent = resolve_shard_extent(self.ctx.as_ref(), h)?;
        let count = c / g * extent.global_height * w;

        let grouped = xs.to_dtype(DType::F32)?.reshape((b, g, c / g, h, w))?;

        let partial_sum = grouped.sum(GROUP_REDUCE_DIMS)?;
        let mean = self.sum_across_ranks(&partial_sum)?.affine(1.0 / count as f64, 0.0)?;

        let centered = grouped.broadcast_sub(&mean.reshape((b, g, 1, 1, 1))?)?;
        let partial_sq = centered.sqr()?.sum(GROUP_REDUCE_DIMS)?;
        let var = self.sum_across_ranks(&partial_sq)?.affine(1.0 / count as f64, 0.0)?;

        debug!(
            rank = extent.rank,
            world_size = extent.world_size,
            local_height = h,
            global_height = extent.global_height,
            count,
            "estimated group moments"
        );
        Ok((GroupMoments { mean, var, count }, extent))
    }

    /// All-gather a `[B, G]` partial and add the contributions in rank order.
    fn sum_across_ranks(&self, partial: &Tensor) -> Result<Tensor> {
        let dims = partial.dims().to_vec();
        let send = partial.flatten_all()?.to_vec1::<f32>()?;
        let gathered = self.ctx.gather_f32(&send)?;

        let mut shape = Vec::with_capacity(dims.len() + 1);
        shape.push(self.ctx.world_size());
        shape.extend_from_slice(&dims);
        Ok(Tensor::from_vec(gathered, shape, partial.device())?.sum(0)?)
    }
}

/// Group statistics of an unsharded `[B, C, H, W]` tensor.
pub fn local_group_moments(xs: &Tensor, num_groups: usize) -> Result<GroupMoments> {
    let (b, c, h, w) = dims4("local_group_moments", xs)?;
    if num_groups == 0 || c % num_groups != 0 {
        return Err(NormError::IndivisibleGroups { num_channels: c, num_groups });
    }
    let count = c / num_groups * h * w;
    let flat = xs.to_dtype(DType::F32)?.reshape((b, num_groups, count))?;
    let mean = flat.mean_keepdim(2)?;
    let var = flat.broadcast_sub(&mean)?.sqr()?.mean_keepdim(2)?;
    Ok(GroupMoments { mean: mean.squeeze(2)?, var: var.squeeze(2)?, count })
}

pub(crate) fn dims4(op: &'static str, xs: &Tensor) -> Result<(usize, usize, usize, usize)> {
    match *xs.dims() {
        [b, c, h, w] => Ok((b, c, h, w)),
        _ => Err(NormError::shape_mismatch(op, "[B, C, H, W]", xs.dims())),
    }
}
