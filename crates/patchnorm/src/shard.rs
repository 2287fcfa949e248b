//! Height-axis shard metadata.
//!
//! Workers own contiguous, disjoint row ranges of the global feature map.
//! [`resolve_shard_extent`] exchanges local heights once per forward call so
//! every worker learns the global height and where its own slice starts.

use std::ops::Range;

use candle_core::Tensor;
use patchnorm_collective::CollectiveContext;
use patchnorm_common::{NormError, Result};
use tracing::trace;

/// Height axis of a `[batch, channel, height, width]` tensor.
pub const HEIGHT_DIM: usize = 2;

/// One worker's view of the sharded height axis for the current call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardExtent {
    pub rank: usize,
    pub world_size: usize,
    /// Rows held by this worker.
    pub local_height: usize,
    /// Rows across all workers.
    pub global_height: usize,
    /// First global row owned by this worker.
    pub row_offset: usize,
}

impl ShardExtent {
    /// Global rows owned by this worker.
    pub fn rows(&self) -> Range<usize> {
        self.row_offset..self.row_offset + self.local_height
    }
}

/// Exchange local heights and derive the global height.
///
/// Every rank must call this in lock-step; the result is identical on all
/// ranks apart from `rank`, `local_height` and `row_offset`.
pub fn resolve_shard_extent(
    ctx: &dyn CollectiveContext,
    local_height: usize,
) -> Result<ShardExtent> {
    let rank = ctx.rank();
    if local_height == 0 {
        return Err(NormError::EmptyShard { rank });
    }

    let world_size = ctx.world_size();
    let mut heights = vec![0u64; world_size];
    ctx.all_gather_u64(&[local_height as u64], &mut heights)?;

    if let Some(empty) = heights.iter().position(|&h| h == 0) {
        return Err(NormError::EmptyShard { rank: empty });
    }
    let global_height = heights.iter().sum::<u64>() as usize;
    let row_offset = heights[..rank].iter().sum::<u64>() as usize;
    trace!(rank, world_size, local_height, global_height, row_offset, "resolved shard extent");

    Ok(ShardExtent { rank, world_size, local_height, global_height, row_offset })
}

/// Split `total` rows into `parts` contiguous ranges.
///
/// The first `total % parts` ranges get one extra row, so sizes differ by
/// at most one.
pub fn split_heights(total: usize, parts: usize) -> Vec<Range<usize>> {
    if parts == 0 {
        return Vec::new();
    }
    let base = total / parts;
    let remainder = total % parts;
    let mut ranges = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < remainder);
        ranges.push(start..start + len);
        start += len;
    }
    ranges
}

/// Cut a `[batch, channel, height, width]` tensor into `parts` height shards.
pub fn shard_along_height(xs: &Tensor, parts: usize) -> Result<Vec<Tensor>> {
    let dims = xs.dims();
    if dims.len() != 4 {
        return Err(NormError::shape_mismatch("shard_along_height", "[B, C, H, W]", dims));
    }
    let height = dims[HEIGHT_DIM];
    if parts == 0 || height < parts {
        return Err(NormError::InvalidConfig(format!(
            "cannot split height {height} into {parts} non-empty shards"
        )));
    }
    split_heights(height, parts)
        .into_iter()
        .map(|rows| Ok(xs.narrow(HEIGHT_DIM, rows.start, rows.len())?))
        .collect()
}

/// Reassemble shards produced by [`shard_along_height`], in rank order.
pub fn gather_along_height(shards: &[Tensor]) -> Result<Tensor> {
    Ok(Tensor::cat(shards, HEIGHT_DIM)?)
}
