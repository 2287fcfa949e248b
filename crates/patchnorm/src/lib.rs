//! Group normalization for height-sharded feature maps.
//!
//! In patch parallelism every worker holds a contiguous slice of rows of a
//! `[batch, channels, height, width]` activation. Group normalization needs
//! statistics over whole groups, so the sharded layers in this crate
//! exchange small per-group partial sums through a [`CollectiveContext`]
//! and then normalize only their own slice.
//!
//! ```no_run
//! use std::sync::Arc;
//! use candle_core::{Device, Tensor};
//! use patchnorm::{
//!     CollectiveContext, GroupNormConfig, LocalFabric, PatchGroupNorm, gather_along_height,
//!     run_workers, shard_along_height,
//! };
//!
//! # fn main() -> patchnorm::Result<()> {
//! let xs = Tensor::randn(0f32, 1.0, (1, 8, 16, 16), &Device::Cpu)?;
//! let shards = shard_along_height(&xs, 2)?;
//! let fabric = LocalFabric::new(2)?;
//! let outputs = run_workers(fabric, |ctx| -> patchnorm::Result<Tensor> {
//!     let rank = ctx.rank();
//!     let layer = PatchGroupNorm::new(GroupNormConfig::new(4, 8), None, Arc::new(ctx))?;
//!     layer.forward(&shards[rank])
//! });
//! let outputs = outputs.into_iter().collect::<patchnorm::Result<Vec<_>>>()?;
//! let ys = gather_along_height(&outputs)?;
//! assert_eq!(ys.dims(), xs.dims());
//! # Ok(())
//! # }
//! ```

pub mod activation;
pub mod ada_group_norm;
pub mod apply;
pub mod group_norm;
pub mod moments;
pub mod projector;
pub mod shard;

pub use activation::{EmbeddingActivation, NamedActivation};
pub use ada_group_norm::{AdaGroupNorm, PatchAdaGroupNorm};
pub use apply::{AffineParams, ScaleShift};
pub use group_norm::{GroupNorm, PatchGroupNorm, ShardOutput, affine_from_var_builder};
pub use moments::{DistributedMomentEstimator, GroupMoments, local_group_moments};
pub use projector::ConditioningProjector;
pub use shard::{
    HEIGHT_DIM, ShardExtent, gather_along_height, resolve_shard_extent, shard_along_height,
    split_heights,
};

pub use patchnorm_collective::{
    CollectiveContext, CollectiveError, LocalCollective, LocalFabric, LoopbackCollective,
    run_workers,
};
pub use patchnorm_common::{
    AdaGroupNormConfig, ConfigError, DEFAULT_EPS, ErrorKind, GroupNormConfig, NormError,
    PatchNormConfig, Result, SimulationConfig,
};
