//! Integration tests: sharded layers against their unsharded baselines.
//!
//! Workers run on real threads over an in-process [`LocalFabric`]; each test
//! shards a global tensor along the height axis, runs one layer per worker
//! and reassembles the result.

use std::sync::Arc;
use std::time::Duration;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, VarBuilder, VarMap};
use patchnorm::{
    AdaGroupNorm, AdaGroupNormConfig, AffineParams, CollectiveContext, CollectiveError, ErrorKind,
    GroupNorm, GroupNormConfig, LocalFabric, NormError, PatchAdaGroupNorm, PatchGroupNorm,
    gather_along_height, local_group_moments, run_workers, shard_along_height,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

// ── Helpers ─────────────────────────────────────────────────────────────────

fn fabric(world_size: usize) -> LocalFabric {
    LocalFabric::new(world_size).unwrap().with_timeout(Duration::from_secs(10))
}

fn random_tensor(seed: u64, dims: (usize, usize, usize, usize)) -> Tensor {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let len = dims.0 * dims.1 * dims.2 * dims.3;
    let data: Vec<f32> = (0..len).map(|_| rng.random_range(-3.0..3.0)).collect();
    Tensor::from_vec(data, dims, &Device::Cpu).unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    let a = a.to_dtype(DType::F32).unwrap();
    let b = b.to_dtype(DType::F32).unwrap();
    let diff = (a - b).unwrap().abs().unwrap().flatten_all().unwrap();
    diff.max(0).unwrap().to_scalar::<f32>().unwrap()
}

fn sharded_group_norm(
    xs: &Tensor,
    world_size: usize,
    config: &GroupNormConfig,
    affine: Option<&AffineParams>,
) -> Tensor {
    let shards = shard_along_height(xs, world_size).unwrap();
    let outputs = run_workers(fabric(world_size), |ctx| -> patchnorm::Result<Tensor> {
        let rank = ctx.rank();
        let layer = PatchGroupNorm::new(config.clone(), affine.cloned(), Arc::new(ctx))?;
        layer.forward(&shards[rank])
    });
    let outputs: Vec<Tensor> = outputs.into_iter().map(Result::unwrap).collect();
    gather_along_height(&outputs).unwrap()
}

fn projection(embedding_dim: usize, out_dim: usize, seed: u64) -> Linear {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let rows = 2 * out_dim;
    let weight: Vec<f32> =
        (0..rows * embedding_dim).map(|_| rng.random_range(-0.5..0.5)).collect();
    let bias: Vec<f32> = (0..rows).map(|_| rng.random_range(-0.1..0.1)).collect();
    Linear::new(
        Tensor::from_vec(weight, (rows, embedding_dim), &Device::Cpu).unwrap(),
        Some(Tensor::from_vec(bias, rows, &Device::Cpu).unwrap()),
    )
}

// ── Scenarios ───────────────────────────────────────────────────────────────

#[test]
fn two_workers_constant_halves() {
    // 4x4 single-channel image: rows [0, 2) hold 1.0, rows [2, 4) hold 3.0
    let top = Tensor::full(1f32, (1, 1, 2, 4), &Device::Cpu).unwrap();
    let bottom = Tensor::full(3f32, (1, 1, 2, 4), &Device::Cpu).unwrap();
    let shards = [top, bottom];
    let config = GroupNormConfig::new(1, 1).with_eps(1e-5);

    let results = run_workers(fabric(2), |ctx| -> patchnorm::Result<_> {
        let rank = ctx.rank();
        let layer = PatchGroupNorm::new(config.clone(), None, Arc::new(ctx))?;
        let moments = layer.moments(&shards[rank])?;
        let out = layer.forward(&shards[rank])?;
        Ok((moments, out))
    });

    let denom = (1.0f32 + 1e-5).sqrt();
    for (rank, result) in results.into_iter().enumerate() {
        let (moments, out) = result.unwrap();
        assert_eq!(moments.count, 16);
        assert_eq!(moments.mean.to_vec2::<f32>().unwrap(), vec![vec![2.0]]);
        assert_eq!(moments.var.to_vec2::<f32>().unwrap(), vec![vec![1.0]]);

        let local_value = if rank == 0 { 1.0f32 } else { 3.0 };
        let expected = (local_value - 2.0) / denom;
        for got in out.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!((got - expected).abs() < 1e-6, "rank {rank}: {got} vs {expected}");
        }
    }
}

#[test]
fn sharded_output_matches_unsharded_for_uneven_splits() {
    let xs = random_tensor(11, (2, 8, 7, 5));
    let config = GroupNormConfig::new(4, 8);
    let affine = AffineParams::new(
        Tensor::new(&[1.0f32, 0.5, 2.0, -1.0, 0.3, 1.1, 0.9, 1.5], &Device::Cpu).unwrap(),
        Tensor::new(&[0.0f32, 0.1, -0.1, 0.2, 0.0, -0.3, 0.4, 0.0], &Device::Cpu).unwrap(),
    )
    .unwrap();
    let baseline = GroupNorm::new(config.clone(), Some(affine.clone()))
        .unwrap()
        .forward(&xs)
        .unwrap();

    for world_size in 1..=7 {
        let sharded = sharded_group_norm(&xs, world_size, &config, Some(&affine));
        let diff = max_abs_diff(&sharded, &baseline);
        assert!(diff < 1e-4, "world_size={world_size}: diff={diff}");
    }
}

#[test]
fn moments_match_unsharded_statistics() {
    let xs = random_tensor(3, (3, 6, 9, 4));
    let reference = local_group_moments(&xs, 3).unwrap();
    let shards = shard_along_height(&xs, 3).unwrap();

    let results = run_workers(fabric(3), |ctx| -> patchnorm::Result<_> {
        let rank = ctx.rank();
        let layer = PatchGroupNorm::new(GroupNormConfig::new(3, 6), None, Arc::new(ctx))?;
        layer.moments(&shards[rank])
    });
    for result in results {
        let moments = result.unwrap();
        assert_eq!(moments.count, reference.count);
        assert!(max_abs_diff(&moments.mean, &reference.mean) < 1e-5);
        assert!(max_abs_diff(&moments.var, &reference.var) < 1e-5);
    }
}

#[test]
fn two_and_four_shards_agree() {
    let xs = random_tensor(29, (1, 4, 16, 6));
    let config = GroupNormConfig::new(2, 4);
    let two = sharded_group_norm(&xs, 2, &config, None);
    let four = sharded_group_norm(&xs, 4, &config, None);
    let diff = max_abs_diff(&two, &four);
    assert!(diff < 1e-5, "diff={diff}");
}

#[test]
fn conditioned_variant_matches_unsharded() {
    let xs = random_tensor(5, (2, 8, 6, 3));
    let emb = random_tensor(6, (1, 1, 2, 16)).reshape((2, 16)).unwrap();
    let config = AdaGroupNormConfig::new(16, 8, 2).with_act_fn("silu");
    let linear = projection(16, 8, 7);

    let baseline = AdaGroupNorm::from_linear(config.clone(), linear.clone())
        .unwrap()
        .forward(&xs, &emb)
        .unwrap();

    let shards = shard_along_height(&xs, 3).unwrap();
    let outputs = run_workers(fabric(3), |ctx| -> patchnorm::Result<Tensor> {
        let rank = ctx.rank();
        let layer =
            PatchAdaGroupNorm::from_linear(config.clone(), linear.clone(), Arc::new(ctx))?;
        layer.forward(&shards[rank], &emb)
    });
    let outputs: Vec<Tensor> = outputs.into_iter().map(Result::unwrap).collect();
    let sharded = gather_along_height(&outputs).unwrap();

    let diff = max_abs_diff(&sharded, &baseline);
    assert!(diff < 1e-4, "diff={diff}");
}

#[test]
fn half_precision_shards_keep_their_dtype() {
    let xs = random_tensor(13, (1, 4, 8, 8)).to_dtype(DType::F16).unwrap();
    let config = GroupNormConfig::new(2, 4);
    let baseline = GroupNorm::new(config.clone(), None).unwrap().forward(&xs).unwrap();
    let sharded = sharded_group_norm(&xs, 2, &config, None);
    assert_eq!(sharded.dtype(), DType::F16);
    assert!(max_abs_diff(&sharded, &baseline) < 1e-2);
}

#[test]
fn half_precision_conditioned_layers_load_and_run() {
    let varmap = VarMap::new();
    let config = AdaGroupNormConfig::new(6, 4, 2).with_act_fn("silu");
    let vb = VarBuilder::from_varmap(&varmap, DType::F16, &Device::Cpu);
    let baseline = AdaGroupNorm::load(config.clone(), vb).unwrap();
    assert_eq!(baseline.projector().linear().weight().dtype(), DType::F16);

    let xs = random_tensor(23, (2, 4, 6, 3)).to_dtype(DType::F16).unwrap();
    let emb = random_tensor(24, (2, 6, 1, 1))
        .reshape((2, 6))
        .unwrap()
        .to_dtype(DType::F16)
        .unwrap();
    let expected = baseline.forward(&xs, &emb).unwrap();
    assert_eq!(expected.dtype(), DType::F16);

    let shards = shard_along_height(&xs, 2).unwrap();
    let outputs = run_workers(fabric(2), |ctx| -> patchnorm::Result<Tensor> {
        let rank = ctx.rank();
        let vb = VarBuilder::from_varmap(&varmap, DType::F16, &Device::Cpu);
        let layer = PatchAdaGroupNorm::load(config.clone(), vb, Arc::new(ctx))?;
        layer.forward(&shards[rank], &emb)
    });
    let outputs: Vec<Tensor> = outputs.into_iter().map(Result::unwrap).collect();
    let sharded = gather_along_height(&outputs).unwrap();
    assert_eq!(sharded.dtype(), DType::F16);
    let diff = max_abs_diff(&sharded, &expected);
    assert!(diff < 2e-2, "diff={diff}");
}

#[test]
fn stats_carry_the_extent_without_an_extra_round() {
    let xs = random_tensor(29, (1, 4, 5, 2));
    let emb = random_tensor(30, (1, 3, 1, 1)).reshape((1, 3)).unwrap();
    let shards = shard_along_height(&xs, 2).unwrap();
    let gn_config = GroupNormConfig::new(2, 4);
    let ada_config = AdaGroupNormConfig::new(3, 4, 2);
    let linear = projection(3, 4, 31);

    let results = run_workers(fabric(2), |ctx| -> patchnorm::Result<_> {
        let rank = ctx.rank();
        let ctx = Arc::new(ctx);
        let gn = PatchGroupNorm::new(gn_config.clone(), None, ctx.clone())?;
        let plain = gn.forward_with_stats(&shards[rank])?;
        let after_plain = ctx.rounds_posted();
        let ada = PatchAdaGroupNorm::from_linear(ada_config.clone(), linear.clone(), ctx.clone())?;
        let conditioned = ada.forward_with_stats(&shards[rank], &emb)?;
        Ok((plain, after_plain, conditioned, ctx.rounds_posted()))
    });

    let expected_rows = [0..3, 3..5];
    for (rank, result) in results.into_iter().enumerate() {
        let (plain, after_plain, conditioned, after_conditioned) = result.unwrap();
        assert_eq!(after_plain, 3, "heights, sums and squared deviations only");
        assert_eq!(after_conditioned, 6);
        for stats in [&plain, &conditioned] {
            assert_eq!(stats.extent.rank, rank);
            assert_eq!(stats.extent.global_height, 5);
            assert_eq!(stats.extent.rows(), expected_rows[rank]);
            assert_eq!(stats.moments.count, 2 * 5 * 2);
            assert_eq!(stats.output.dims(), shards[rank].dims());
        }
    }
}

#[test]
fn repeated_forward_calls_stay_in_lock_step() {
    let xs = random_tensor(17, (1, 4, 6, 4));
    let ys = random_tensor(18, (1, 4, 6, 4));
    let config = GroupNormConfig::new(2, 4);
    let baseline = GroupNorm::new(config.clone(), None).unwrap();
    let x_shards = shard_along_height(&xs, 2).unwrap();
    let y_shards = shard_along_height(&ys, 2).unwrap();

    let results = run_workers(fabric(2), |ctx| -> patchnorm::Result<_> {
        let rank = ctx.rank();
        let layer = PatchGroupNorm::new(config.clone(), None, Arc::new(ctx))?;
        Ok((layer.forward(&x_shards[rank])?, layer.forward(&y_shards[rank])?))
    });
    let (x_out, y_out): (Vec<Tensor>, Vec<Tensor>) =
        results.into_iter().map(Result::unwrap).unzip();

    let x_full = gather_along_height(&x_out).unwrap();
    let y_full = gather_along_height(&y_out).unwrap();
    let x_diff = max_abs_diff(&x_full, &baseline.forward(&xs).unwrap());
    let y_diff = max_abs_diff(&y_full, &baseline.forward(&ys).unwrap());
    assert!(x_diff < 1e-5 && y_diff < 1e-5, "x={x_diff} y={y_diff}");
}

// ── Failure semantics ───────────────────────────────────────────────────────

#[test]
fn indivisible_groups_fail_before_any_exchange() {
    let results = run_workers(fabric(2), |ctx| -> patchnorm::Result<()> {
        PatchGroupNorm::new(GroupNormConfig::new(3, 10), None, Arc::new(ctx))?;
        Ok(())
    });
    for result in results {
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(matches!(err, NormError::IndivisibleGroups { num_channels: 10, num_groups: 3 }));
    }
}

#[test]
fn failed_worker_aborts_its_peers() {
    let xs = random_tensor(23, (1, 4, 4, 4));
    let shards = shard_along_height(&xs, 2).unwrap();

    let results = run_workers(fabric(2), |ctx| -> patchnorm::Result<Tensor> {
        let rank = ctx.rank();
        let layer = PatchGroupNorm::new(GroupNormConfig::new(2, 4), None, Arc::new(ctx))?;
        if rank == 1 {
            return Err(NormError::InvalidConfig("worker 1 gave up".into()));
        }
        layer.forward(&shards[rank])
    });

    let err = results[0].as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(matches!(
        err,
        NormError::Collective(CollectiveError::PeerDeparted { rank: 1, .. })
    ));
}

#[test]
fn batch_size_disagreement_is_a_protocol_error() {
    let shards = [random_tensor(1, (1, 4, 2, 3)), random_tensor(2, (2, 4, 2, 3))];

    let results = run_workers(fabric(2), |ctx| -> patchnorm::Result<Tensor> {
        let rank = ctx.rank();
        let layer = PatchGroupNorm::new(GroupNormConfig::new(2, 4), None, Arc::new(ctx))?;
        layer.forward(&shards[rank])
    });
    for result in results {
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(matches!(err, NormError::Collective(CollectiveError::ShapeMismatch { .. })));
    }
}
