//! `patchnorm simulate`: run sharded normalization on in-process workers.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::Linear;
use clap::{Parser, ValueEnum};
use patchnorm::{
    AdaGroupNorm, AdaGroupNormConfig, AffineParams, CollectiveContext, ErrorKind, GroupNorm,
    LocalFabric, NormError, PatchAdaGroupNorm, PatchGroupNorm, PatchNormConfig, ShardOutput,
    gather_along_height, local_group_moments, run_workers, shard_along_height,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{debug, info};

/// Embedding width used when `--conditioned` runs without a `[conditioning]` table.
pub const DEFAULT_EMBEDDING_DIM: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Shard a seeded random tensor across workers and compare against one device
#[derive(Debug, Clone, Parser)]
pub struct SimulateCommand {
    /// Number of simulated workers
    #[arg(long, value_name = "N")]
    pub world_size: Option<usize>,

    /// Batch size of the global tensor
    #[arg(long, value_name = "B")]
    pub batch_size: Option<usize>,

    /// Global height, split across workers
    #[arg(long, value_name = "H")]
    pub height: Option<usize>,

    /// Width of the global tensor
    #[arg(long, value_name = "W")]
    pub width: Option<usize>,

    /// Seed for inputs and parameters
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u64>,

    /// Largest accepted absolute error
    #[arg(long, value_name = "TOL")]
    pub tolerance: Option<f64>,

    /// Use the embedding-conditioned layer
    #[arg(long)]
    pub conditioned: bool,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// One worker's view after the run.
#[derive(Debug, Clone, Serialize)]
pub struct RankReport {
    pub rank: usize,
    pub row_start: usize,
    pub row_end: usize,
    pub global_height: usize,
    pub max_mean_error: f64,
    pub max_var_error: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub layer: &'static str,
    pub world_size: usize,
    pub batch_size: usize,
    pub num_channels: usize,
    pub num_groups: usize,
    pub height: usize,
    pub width: usize,
    pub seed: u64,
    pub tolerance: f64,
    pub max_output_error: f64,
    pub max_moment_error: f64,
    pub passed: bool,
    pub ranks: Vec<RankReport>,
}

impl SimulationReport {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} over {} workers: [{}, {}, {}, {}], {} groups, seed {}",
            self.layer,
            self.world_size,
            self.batch_size,
            self.num_channels,
            self.height,
            self.width,
            self.num_groups,
            self.seed
        );
        for rank in &self.ranks {
            let _ = writeln!(
                out,
                "  rank {:>3}: rows {:>5}..{:<5} of {}  mean err {:.3e}  var err {:.3e}",
                rank.rank,
                rank.row_start,
                rank.row_end,
                rank.global_height,
                rank.max_mean_error,
                rank.max_var_error
            );
        }
        let _ = writeln!(out, "max output error: {:.3e}", self.max_output_error);
        let _ = writeln!(out, "max moment error: {:.3e}", self.max_moment_error);
        let verdict = if self.passed { "PASS" } else { "FAIL" };
        let _ = write!(out, "{verdict} (tolerance {:.1e})", self.tolerance);
        out
    }
}

impl SimulateCommand {
    /// Fold command-line values over the configured simulation.
    pub fn apply_overrides(&self, config: &mut PatchNormConfig) {
        let sim = &mut config.simulation;
        if let Some(v) = self.world_size {
            sim.world_size = v;
        }
        if let Some(v) = self.batch_size {
            sim.batch_size = v;
        }
        if let Some(v) = self.height {
            sim.height = v;
        }
        if let Some(v) = self.width {
            sim.width = v;
        }
        if let Some(v) = self.seed {
            sim.seed = v;
        }
        if let Some(v) = self.tolerance {
            sim.tolerance = v;
        }
    }

    pub fn execute(&self, config: &PatchNormConfig) -> Result<SimulationReport> {
        let mut config = config.clone();
        self.apply_overrides(&mut config);
        config.validate().context("invalid simulation configuration")?;

        let report = run_simulation(&config, self.conditioned)?;
        match self.format {
            OutputFormat::Text => println!("{}", report.render_text()),
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize report")?
            ),
        }
        Ok(report)
    }
}

/// Everything one sharded run produced, next to its single-device baseline.
struct ShardedRun {
    layer: &'static str,
    num_channels: usize,
    num_groups: usize,
    input: Tensor,
    baseline: Tensor,
    results: Vec<std::result::Result<ShardOutput, NormError>>,
}

fn run_group_norm(config: &PatchNormConfig, rng: &mut ChaCha8Rng) -> Result<ShardedRun> {
    let sim = &config.simulation;
    let gn = config.group_norm.clone();
    let input = random_tensor(rng, &[sim.batch_size, gn.num_channels, sim.height, sim.width])?;
    let affine = if gn.affine { Some(random_affine(rng, gn.num_channels)?) } else { None };

    let baseline = GroupNorm::new(gn.clone(), affine.clone())?.forward(&input)?;
    let shards = shard_along_height(&input, sim.world_size)?;
    let results = run_workers(LocalFabric::new(sim.world_size)?, |ctx| -> patchnorm::Result<_> {
        let rank = ctx.rank();
        let layer = PatchGroupNorm::new(gn.clone(), affine.clone(), Arc::new(ctx))?;
        layer.forward_with_stats(&shards[rank])
    });
    Ok(ShardedRun {
        layer: "PatchGroupNorm",
        num_channels: gn.num_channels,
        num_groups: gn.num_groups,
        input,
        baseline,
        results,
    })
}

fn run_ada_group_norm(config: &PatchNormConfig, rng: &mut ChaCha8Rng) -> Result<ShardedRun> {
    let sim = &config.simulation;
    let ada = config.conditioning.clone().unwrap_or_else(|| {
        AdaGroupNormConfig::new(
            DEFAULT_EMBEDDING_DIM,
            config.group_norm.num_channels,
            config.group_norm.num_groups,
        )
        .with_eps(config.group_norm.eps)
    });
    let input = random_tensor(rng, &[sim.batch_size, ada.out_dim, sim.height, sim.width])?;
    let emb = random_tensor(rng, &[sim.batch_size, ada.embedding_dim])?;
    let linear = random_linear(rng, ada.embedding_dim, 2 * ada.out_dim)?;

    let baseline = AdaGroupNorm::from_linear(ada.clone(), linear.clone())?.forward(&input, &emb)?;
    let shards = shard_along_height(&input, sim.world_size)?;
    let results = run_workers(LocalFabric::new(sim.world_size)?, |ctx| -> patchnorm::Result<_> {
        let rank = ctx.rank();
        let layer = PatchAdaGroupNorm::from_linear(ada.clone(), linear.clone(), Arc::new(ctx))?;
        layer.forward_with_stats(&shards[rank], &emb)
    });
    Ok(ShardedRun {
        layer: "PatchAdaGroupNorm",
        num_channels: ada.out_dim,
        num_groups: ada.num_groups,
        input,
        baseline,
        results,
    })
}

/// Run the configured layer sharded and unsharded and compare the results.
pub fn run_simulation(config: &PatchNormConfig, conditioned: bool) -> Result<SimulationReport> {
    let sim = &config.simulation;
    let mut rng = ChaCha8Rng::seed_from_u64(sim.seed);
    let run = if conditioned {
        run_ada_group_norm(config, &mut rng)?
    } else {
        run_group_norm(config, &mut rng)?
    };
    let ShardedRun { layer, num_channels, num_groups, input, baseline, results } = run;

    let outcomes = collect_outcomes(results)?;
    let reference = local_group_moments(&input, num_groups)?;

    let mut ranks = Vec::with_capacity(outcomes.len());
    for outcome in &outcomes {
        let report = RankReport {
            rank: outcome.extent.rank,
            row_start: outcome.extent.rows().start,
            row_end: outcome.extent.rows().end,
            global_height: outcome.extent.global_height,
            max_mean_error: max_abs_diff(&outcome.moments.mean, &reference.mean)?,
            max_var_error: max_abs_diff(&outcome.moments.var, &reference.var)?,
        };
        debug!(?report, "rank finished");
        ranks.push(report);
    }

    let outputs: Vec<Tensor> = outcomes.into_iter().map(|o| o.output).collect();
    let max_output_error = max_abs_diff(&gather_along_height(&outputs)?, &baseline)?;
    let max_moment_error =
        ranks.iter().map(|r| r.max_mean_error.max(r.max_var_error)).fold(0.0, f64::max);
    let passed = max_output_error <= sim.tolerance && max_moment_error <= sim.tolerance;
    info!(layer, max_output_error, max_moment_error, passed, "simulation finished");

    Ok(SimulationReport {
        layer,
        world_size: sim.world_size,
        batch_size: sim.batch_size,
        num_channels,
        num_groups,
        height: sim.height,
        width: sim.width,
        seed: sim.seed,
        tolerance: sim.tolerance,
        max_output_error,
        max_moment_error,
        passed,
        ranks,
    })
}

/// Surface the error that started a group failure rather than the peers'
/// protocol errors it caused.
fn collect_outcomes(
    results: Vec<std::result::Result<ShardOutput, NormError>>,
) -> Result<Vec<ShardOutput>> {
    let mut first_protocol = None;
    let mut outcomes = Vec::with_capacity(results.len());
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) if err.kind() == ErrorKind::Protocol => {
                first_protocol.get_or_insert((rank, err));
            }
            Err(err) => return Err(err).with_context(|| format!("worker {rank} failed")),
        }
    }
    match first_protocol {
        Some((rank, err)) => Err(err).with_context(|| format!("worker {rank} failed")),
        None => Ok(outcomes),
    }
}

fn random_tensor(rng: &mut ChaCha8Rng, dims: &[usize]) -> Result<Tensor> {
    let len = dims.iter().product();
    let data: Vec<f32> = (0..len).map(|_| rng.random_range(-2.0..2.0)).collect();
    Ok(Tensor::from_vec(data, dims, &Device::Cpu)?)
}

fn random_affine(rng: &mut ChaCha8Rng, num_channels: usize) -> Result<AffineParams> {
    let weight: Vec<f32> = (0..num_channels).map(|_| rng.random_range(0.5..1.5)).collect();
    let bias: Vec<f32> = (0..num_channels).map(|_| rng.random_range(-0.5..0.5)).collect();
    Ok(AffineParams::new(
        Tensor::from_vec(weight, num_channels, &Device::Cpu)?,
        Tensor::from_vec(bias, num_channels, &Device::Cpu)?,
    )?)
}

fn random_linear(rng: &mut ChaCha8Rng, in_dim: usize, out_dim: usize) -> Result<Linear> {
    let bound = 1.0 / (in_dim as f32).sqrt();
    let weight = random_tensor(rng, &[out_dim, in_dim])?.affine(f64::from(bound) / 2.0, 0.0)?;
    let bias = random_tensor(rng, &[out_dim])?.affine(f64::from(bound) / 2.0, 0.0)?;
    Ok(Linear::new(weight, Some(bias)))
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f64> {
    let diff = a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
    Ok(f64::from(diff))
}
