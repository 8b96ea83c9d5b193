//! Per-input sensitivity coefficients and variance proportions.
//!
//! The GUM table reuses the linearisation coefficients. The Monte Carlo
//! table is a one-at-a-time approximation: each input is sampled alone with
//! the others held at nominal, and the coefficient is the least-squares
//! slope of the output on that input. The two tables are reported side by
//! side and never reconciled.

use crate::config::CalculationSettings;
use crate::error::{Result, UncertaintyError};
use crate::function::BoundModel;
use crate::gum::GumOutcome;
use crate::stats::{least_squares_slope, WelfordAccumulator};
use crate::types::{CorrelationProportion, Method, SensitivityEntry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use tracing::{debug, info};

const SENSITIVITY_SEED_OFFSET: u64 = 0x9E37_79B9_7F4A_7C15;

/// Seed of the one-at-a-time pass for input `i`.
pub fn sensitivity_seed(run_seed: u64, i: usize) -> u64 {
    run_seed
        .wrapping_add(SENSITIVITY_SEED_OFFSET)
        .wrapping_add(i as u64)
}

pub fn gum_sensitivity(
    model: &BoundModel<'_>,
    outcome: &GumOutcome,
) -> (Vec<SensitivityEntry>, Vec<CorrelationProportion>) {
    let n = model.arity();
    let mut entries = Vec::with_capacity(n * outcome.results.len());
    let mut remainders = Vec::with_capacity(outcome.results.len());

    for (k, result) in outcome.results.iter().enumerate() {
        let variance = result.standard_uncertainty.powi(2);
        let mut explained = 0.0;
        for i in 0..n {
            let contribution = outcome.contributions[k * n + i];
            let proportion = if variance > 0.0 {
                contribution * contribution / variance
            } else {
                0.0
            };
            explained += proportion;
            entries.push(SensitivityEntry {
                method: Method::Gum,
                output: result.output.clone(),
                variable: model.input_name(i).to_string(),
                coefficient: outcome.coefficients[k * n + i] * model.input_factor(i),
                coefficient_unit: model.coefficient_unit(k, i),
                proportion,
                approximate: false,
            });
        }
        remainders.push(CorrelationProportion {
            output: result.output.clone(),
            proportion: if variance > 0.0 { 1.0 - explained } else { 0.0 },
        });
    }

    (entries, remainders)
}

struct InputPass {
    /// Per output: (slope in report units per function-input unit, variance).
    per_output: Vec<(f64, f64)>,
}

fn one_at_a_time(
    model: &BoundModel<'_>,
    i: usize,
    samples: usize,
    seed: u64,
    max_drop_fraction: f64,
) -> Result<InputPass> {
    let n = model.arity();
    let m = model.output_count();
    let mut rng = StdRng::seed_from_u64(seed);
    let distribution = model.distribution(i);
    let nominal = model.nominals()[i];
    let u = model.std_uncertainties()[i];

    let mut xs = Vec::with_capacity(samples);
    let mut args = Vec::with_capacity(samples * n);
    for _ in 0..samples {
        let z: f64 = rng.sample(StandardNormal);
        let x = distribution.transform(z, nominal, u);
        xs.push(x);
        args.extend_from_slice(model.nominals());
        args[xs.len() * n - n + i] = x;
    }

    let mut out = vec![0.0; samples * m];
    let failures = model.evaluate_batch(samples, &args, &mut out);
    if failures.len() as f64 / samples as f64 > max_drop_fraction || samples - failures.len() < 2 {
        return Err(UncertaintyError::SampleEvaluation {
            failed: failures.len(),
            total: samples,
            threshold: max_drop_fraction,
            first_failure: failures
                .into_iter()
                .next()
                .map(|(_, reason)| reason)
                .unwrap_or_default(),
        });
    }

    let mut kept_x = Vec::with_capacity(samples - failures.len());
    let mut kept_y = vec![Vec::with_capacity(samples - failures.len()); m];
    let mut failed_rows = failures.iter().map(|(row, _)| *row).peekable();
    for row in 0..samples {
        if failed_rows.peek() == Some(&row) {
            failed_rows.next();
            continue;
        }
        kept_x.push(xs[row]);
        for (k, column) in kept_y.iter_mut().enumerate() {
            column.push(out[row * m + k]);
        }
    }

    let per_output = kept_y
        .iter()
        .map(|ys| {
            let mut acc = WelfordAccumulator::new();
            ys.iter().for_each(|&y| acc.push(y));
            (least_squares_slope(&kept_x, ys), acc.variance())
        })
        .collect();
    debug!(input = model.input_name(i), samples, "one-at-a-time pass finished");

    Ok(InputPass { per_output })
}

pub fn monte_carlo_sensitivity(
    model: &BoundModel<'_>,
    settings: &CalculationSettings,
    run_seed: u64,
) -> Result<Vec<SensitivityEntry>> {
    let n = model.arity();
    let m = model.output_count();
    let samples = settings.sensitivity_sample_count();
    info!(inputs = n, samples, "starting Monte Carlo sensitivity");

    let passes = (0..n)
        .into_par_iter()
        .map(|i| {
            one_at_a_time(
                model,
                i,
                samples,
                sensitivity_seed(run_seed, i),
                settings.max_drop_fraction,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let mut entries = Vec::with_capacity(n * m);
    for k in 0..m {
        let total: f64 = passes.iter().map(|p| p.per_output[k].1).sum();
        for (i, pass) in passes.iter().enumerate() {
            let (slope, variance) = pass.per_output[k];
            entries.push(SensitivityEntry {
                method: Method::MonteCarlo,
                output: model.output(k).name.clone(),
                variable: model.input_name(i).to_string(),
                coefficient: slope * model.input_factor(i),
                coefficient_unit: model.coefficient_unit(k, i),
                proportion: if total > 0.0 { variance / total } else { 0.0 },
                approximate: true,
            });
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::FunctionSpec;
    use crate::gum;
    use crate::input::{Distribution, InputVariable};
    use crate::traits::ScalarFn;
    use crate::units::{SiUnits, UnitSystem};
    use nalgebra::DMatrix;
    use proptest::prelude::*;

    fn input(name: &str, nominal: f64, unit: &str, u: f64) -> InputVariable {
        InputVariable::new(
            name,
            nominal,
            u,
            1.0,
            f64::INFINITY,
            SiUnits.unit(unit).expect("unit parses"),
            Distribution::Normal,
        )
        .expect("valid input")
    }

    fn weighted_sum(weights: Vec<f64>) -> FunctionSpec {
        let names = ["a", "b", "c", "d", "e"];
        let n = weights.len();
        FunctionSpec::new(
            Box::new(ScalarFn::new(n, move |x: &[f64]| {
                x.iter().zip(&weights).map(|(xi, wi)| xi * wi).sum()
            })),
            &(0..n).map(|i| (names[i], "")).collect::<Vec<_>>(),
            &[("y", "")],
            &SiUnits,
        )
        .expect("valid function")
    }

    #[test]
    fn gum_proportions_follow_variance_budget() {
        let spec = weighted_sum(vec![1.0, 2.0]);
        let inputs = [input("a", 0.0, "", 3.0), input("b", 0.0, "", 2.0)];
        let model = spec.bind(&inputs).expect("binds");
        let outcome = gum::propagate(&model, &DMatrix::identity(2, 2), &CalculationSettings::gum_only())
            .expect("propagates");
        let (entries, remainder) = gum_sensitivity(&model, &outcome);
        assert!((entries[0].proportion - 9.0 / 25.0).abs() < 1e-9);
        assert!((entries[1].proportion - 16.0 / 25.0).abs() < 1e-9);
        assert!((entries[1].coefficient - 2.0).abs() < 1e-6);
        assert!(remainder[0].proportion.abs() < 1e-9);
        assert!(entries.iter().all(|e| !e.approximate));
    }

    #[test]
    fn coefficients_are_expressed_per_input_unit() {
        let spec = FunctionSpec::new(
            Box::new(ScalarFn::new(1, |x: &[f64]| 4.0 * x[0])),
            &[("len", "m")],
            &[("y", "m")],
            &SiUnits,
        )
        .expect("valid function");
        let inputs = [input("len", 500.0, "mm", 1.0)];
        let model = spec.bind(&inputs).expect("binds");
        let outcome = gum::propagate(&model, &DMatrix::identity(1, 1), &CalculationSettings::gum_only())
            .expect("propagates");
        let (entries, _) = gum_sensitivity(&model, &outcome);
        // 4 m/m is 0.004 m/mm.
        assert!((entries[0].coefficient - 0.004).abs() < 1e-9);
        assert_eq!(entries[0].coefficient_unit, "m/mm");
    }

    #[test]
    fn correlated_inputs_leave_a_remainder() {
        let spec = weighted_sum(vec![1.0, 1.0]);
        let inputs = [input("a", 0.0, "", 1.0), input("b", 0.0, "", 1.0)];
        let model = spec.bind(&inputs).expect("binds");
        let correlation = DMatrix::from_row_slice(2, 2, &[1.0, 0.5, 0.5, 1.0]);
        let outcome =
            gum::propagate(&model, &correlation, &CalculationSettings::gum_only()).expect("propagates");
        let (entries, remainder) = gum_sensitivity(&model, &outcome);
        // u² = 1 + 1 + 2·0.5 = 3
        assert!((entries[0].proportion - 1.0 / 3.0).abs() < 1e-9);
        assert!((remainder[0].proportion - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn cancelling_correlation_pushes_proportions_past_one() {
        let spec = weighted_sum(vec![1.0, -1.0]);
        let inputs = [input("a", 0.0, "", 1.0), input("b", 0.0, "", 1.0)];
        let model = spec.bind(&inputs).expect("binds");
        let correlation = DMatrix::from_row_slice(2, 2, &[1.0, 0.9, 0.9, 1.0]);
        let outcome =
            gum::propagate(&model, &correlation, &CalculationSettings::gum_only()).expect("propagates");
        let (entries, remainder) = gum_sensitivity(&model, &outcome);
        // u² = 2 - 2 * 0.9 = 0.2, so each input alone explains 1 / 0.2.
        assert!((entries[0].proportion - 5.0).abs() < 1e-6);
        assert!((entries[1].proportion - 5.0).abs() < 1e-6);
        assert!((remainder[0].proportion + 9.0).abs() < 1e-6);
    }

    #[test]
    fn monte_carlo_sensitivity_recovers_linear_slopes() {
        let spec = weighted_sum(vec![2.0, -1.0]);
        let inputs = [input("a", 1.0, "", 0.5), input("b", 3.0, "", 1.0)];
        let model = spec.bind(&inputs).expect("binds");
        let settings = CalculationSettings {
            sensitivity_samples: Some(20_000),
            ..CalculationSettings::default()
        };
        let entries = monte_carlo_sensitivity(&model, &settings, 17).expect("samples");
        assert!(entries.iter().all(|e| e.approximate));
        assert!((entries[0].coefficient - 2.0).abs() < 1e-9);
        assert!((entries[1].coefficient + 1.0).abs() < 1e-9);
        // Equal variance contributions (2·0.5)² and (1·1)².
        assert!((entries[0].proportion - 0.5).abs() < 0.03);
        assert!((entries[0].proportion + entries[1].proportion - 1.0).abs() < 1e-12);

        let again = monte_carlo_sensitivity(&model, &settings, 17).expect("samples");
        assert_eq!(entries, again);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn uncorrelated_proportions_sum_to_one(
            weights in prop::collection::vec(0.1f64..5.0, 1..5),
            uncertainties in prop::collection::vec(0.01f64..3.0, 5),
        ) {
            let n = weights.len();
            let spec = weighted_sum(weights);
            let names = ["a", "b", "c", "d", "e"];
            let inputs: Vec<InputVariable> = (0..n)
                .map(|i| input(names[i], 1.0, "", uncertainties[i]))
                .collect();
            let model = spec.bind(&inputs).expect("binds");
            let outcome = gum::propagate(&model, &DMatrix::identity(n, n), &CalculationSettings::gum_only())
                .expect("propagates");
            let (entries, _) = gum_sensitivity(&model, &outcome);
            let total: f64 = entries.iter().map(|e| e.proportion).sum();
            prop_assert!((total - 1.0).abs() < 1e-9);
        }
    }
}
