//! Sampling-based propagation.
//!
//! Samples are generated in fixed-size shards. Shard `s` draws from its own
//! `StdRng` seeded with `seed + s`, so the sample stream depends only on the
//! seed, the sample count and the shard size; the rayon pool only decides
//! which thread processes a shard. Per-shard Welford accumulators are merged
//! in shard order, which keeps the moments independent of the thread count.

use crate::config::CalculationSettings;
use crate::error::{Result, UncertaintyError};
use crate::function::BoundModel;
use crate::gum::row_major;
use crate::stats::{quantile_sorted, sample_correlation, shortest_interval, WelfordAccumulator};
use crate::types::{
    CoverageInterval, IntervalKind, Method, OutputCorrelation, PropagationResult, SampleSummary,
};
use nalgebra::DMatrix;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use tracing::{debug, info, warn};

pub struct MonteCarloOutcome {
    pub results: Vec<PropagationResult>,
    pub correlation: OutputCorrelation,
    /// Accepted output samples in report units, one vector per output.
    pub samples: Vec<Vec<f64>>,
    pub seed: u64,
}

/// The configured seed, or a fresh one from the thread RNG.
pub fn resolve_seed(settings: &CalculationSettings) -> u64 {
    settings.seed.unwrap_or_else(|| rand::rng().random::<u64>())
}

/// Splits `total` samples into shards of at most `shard_size`.
pub fn shard_layout(total: usize, shard_size: usize) -> Vec<usize> {
    let shard_size = shard_size.max(1);
    let mut shards = vec![shard_size; total / shard_size];
    if total % shard_size != 0 {
        shards.push(total % shard_size);
    }
    shards
}

/// Draws `rows` joint input samples (row-major, function units). `cholesky`
/// correlates the standard normal deviates before each input's
/// distribution transform.
pub fn draw_inputs(model: &BoundModel<'_>, cholesky: &DMatrix<f64>, rng: &mut StdRng, rows: usize) -> Vec<f64> {
    let n = model.arity();
    let nominals = model.nominals();
    let u = model.std_uncertainties();
    let distributions: Vec<_> = (0..n).map(|i| model.distribution(i)).collect();

    let mut args = vec![0.0; rows * n];
    if n == 0 {
        return args;
    }
    let mut z = vec![0.0; n];
    for row in args.chunks_exact_mut(n) {
        for zj in z.iter_mut() {
            *zj = rng.sample(StandardNormal);
        }
        for i in 0..n {
            let mut correlated = 0.0;
            for j in 0..=i {
                correlated += cholesky[(i, j)] * z[j];
            }
            row[i] = distributions[i].transform(correlated, nominals[i], u[i]);
        }
    }
    args
}

struct ShardOutput {
    accumulators: Vec<WelfordAccumulator>,
    values: Vec<f64>,
    failed: usize,
    first_failure: Option<String>,
}

fn run_shard(
    model: &BoundModel<'_>,
    cholesky: &DMatrix<f64>,
    seed: u64,
    index: usize,
    rows: usize,
) -> ShardOutput {
    let m = model.output_count();
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(index as u64));
    let args = draw_inputs(model, cholesky, &mut rng, rows);

    let mut out = vec![0.0; rows * m];
    let failures = model.evaluate_batch(rows, &args, &mut out);

    let mut accumulators = vec![WelfordAccumulator::new(); m];
    let mut values = Vec::with_capacity((rows - failures.len()) * m);
    let mut failed_rows = failures.iter().map(|(row, _)| *row).peekable();
    for (row, y) in out.chunks_exact(m.max(1)).take(rows).enumerate() {
        if failed_rows.peek() == Some(&row) {
            failed_rows.next();
            continue;
        }
        for (acc, &value) in accumulators.iter_mut().zip(y) {
            acc.push(value);
        }
        values.extend_from_slice(y);
    }
    debug!(shard = index, rows, failed = failures.len(), "shard evaluated");

    ShardOutput {
        accumulators,
        values,
        failed: failures.len(),
        first_failure: failures.into_iter().next().map(|(_, reason)| reason),
    }
}

pub fn propagate(
    model: &BoundModel<'_>,
    cholesky: &DMatrix<f64>,
    settings: &CalculationSettings,
    seed: u64,
) -> Result<MonteCarloOutcome> {
    let total = settings.mc_samples;
    let m = model.output_count();
    let shards = shard_layout(total, settings.shard_size);
    info!(samples = total, shards = shards.len(), seed, "starting Monte Carlo propagation");

    let outputs: Vec<ShardOutput> = shards
        .par_iter()
        .enumerate()
        .map(|(index, &rows)| run_shard(model, cholesky, seed, index, rows))
        .collect();

    let mut accumulators = vec![WelfordAccumulator::new(); m];
    let mut samples: Vec<Vec<f64>> = vec![Vec::with_capacity(total); m];
    let mut failed = 0;
    let mut first_failure = None;
    for shard in outputs {
        for (acc, other) in accumulators.iter_mut().zip(&shard.accumulators) {
            acc.merge(other);
        }
        for row in shard.values.chunks_exact(m.max(1)) {
            for (column, &value) in samples.iter_mut().zip(row) {
                column.push(value);
            }
        }
        failed += shard.failed;
        if first_failure.is_none() {
            first_failure = shard.first_failure;
        }
    }

    let drop_fraction = failed as f64 / total as f64;
    let accepted = total - failed;
    if drop_fraction > settings.max_drop_fraction || accepted < 2 {
        return Err(UncertaintyError::SampleEvaluation {
            failed,
            total,
            threshold: settings.max_drop_fraction,
            first_failure: first_failure.unwrap_or_default(),
        });
    }
    if failed > 0 {
        warn!(
            failed,
            total,
            first_failure = first_failure.as_deref().unwrap_or(""),
            "dropped failing Monte Carlo samples"
        );
    }

    let alpha = 1.0 - settings.confidence;
    let results = samples
        .iter()
        .zip(&accumulators)
        .enumerate()
        .map(|(k, (column, acc))| {
            let mut sorted = column.clone();
            sorted.par_sort_unstable_by(f64::total_cmp);
            let (lower, upper) = match settings.interval {
                IntervalKind::Symmetric => (
                    quantile_sorted(&sorted, alpha / 2.0),
                    quantile_sorted(&sorted, 1.0 - alpha / 2.0),
                ),
                IntervalKind::Shortest => shortest_interval(&sorted, settings.confidence),
            };
            let interval = CoverageInterval { lower, upper };
            let u = acc.std_dev();
            let output = model.output(k);
            PropagationResult {
                method: Method::MonteCarlo,
                output: output.name.clone(),
                unit: output.report_unit.display_symbol().to_string(),
                nominal: acc.mean(),
                standard_uncertainty: u,
                interval,
                coverage_factor: if u > 0.0 { interval.half_width() / u } else { 0.0 },
                confidence: settings.confidence,
                degrees_of_freedom: f64::INFINITY,
                samples: Some(SampleSummary {
                    samples: accepted,
                    dropped: failed,
                    drop_fraction,
                    interval_kind: settings.interval,
                }),
            }
        })
        .collect();

    let correlation = OutputCorrelation {
        outputs: (0..m).map(|k| model.output(k).name.clone()).collect(),
        matrix: row_major(&sample_correlation(&samples)),
    };
    info!(accepted, dropped = failed, "Monte Carlo propagation finished");

    Ok(MonteCarloOutcome {
        results,
        correlation,
        samples,
        seed,
    })
}
