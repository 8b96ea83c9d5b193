//! Linearised (GUM) propagation.

use crate::config::{CalculationSettings, DerivativeSettings};
use crate::error::{Result, UncertaintyError};
use crate::function::BoundModel;
use crate::stats::{coverage_factor, covariance_to_correlation, welch_satterthwaite};
use crate::types::{ConvergenceWarning, CoverageInterval, Method, OutputCorrelation, PropagationResult};
use nalgebra::DMatrix;
use rayon::prelude::*;
use tracing::{debug, info, warn};

pub struct GumOutcome {
    pub results: Vec<PropagationResult>,
    pub correlation: OutputCorrelation,
    /// Sensitivity coefficients, row-major `[output][input]`, in report
    /// units per function-input unit.
    pub coefficients: Vec<f64>,
    /// `(c_ki u_i)` per output and input, same layout as `coefficients`.
    pub contributions: Vec<f64>,
    pub warnings: Vec<ConvergenceWarning>,
}

struct Column {
    derivatives: Vec<f64>,
    warnings: Vec<ConvergenceWarning>,
}

/// Step for input `i`: a fraction of its standard uncertainty, bounded
/// below relative to the nominal magnitude.
pub fn derivative_step(nominal: f64, std_uncertainty: f64, settings: &DerivativeSettings) -> f64 {
    let h = (settings.step_fraction * std_uncertainty).max(settings.min_relative_step * nominal.abs());
    if h > 0.0 {
        h
    } else {
        settings.step_fraction
    }
}

pub fn propagate(
    model: &BoundModel<'_>,
    correlation: &DMatrix<f64>,
    settings: &CalculationSettings,
) -> Result<GumOutcome> {
    let n = model.arity();
    let m = model.output_count();
    info!(inputs = n, outputs = m, "starting GUM propagation");

    let mut y0 = vec![0.0; m];
    model
        .evaluate(model.nominals(), &mut y0)
        .map_err(|err| UncertaintyError::NominalEvaluation {
            reason: format!("{err:#}"),
        })?;

    let (coefficients, warnings) = match model.partials(model.nominals()) {
        Some(exact) => {
            let jacobian = exact
                .and_then(|j| {
                    if j.iter().all(|v| v.is_finite()) {
                        Ok(j)
                    } else {
                        anyhow::bail!("exact partial derivatives are not finite")
                    }
                })
                .map_err(|err| UncertaintyError::NominalEvaluation {
                    reason: format!("{err:#}"),
                })?;
            debug!("using exact partial derivatives");
            (jacobian, Vec::new())
        }
        None => finite_difference_jacobian(model, &y0, &settings.derivative)?,
    };

    for w in &warnings {
        warn!(input = %w.input, output = %w.output, "{w}");
    }

    let u = model.std_uncertainties();
    let mut contributions = vec![0.0; m * n];
    for k in 0..m {
        for i in 0..n {
            contributions[k * n + i] = coefficients[k * n + i] * u[i];
        }
    }

    // Output covariance C diag(u) R diag(u) Cᵀ.
    let cu = DMatrix::from_row_slice(m, n, &contributions);
    let covariance = &cu * correlation * cu.transpose();

    let mut results = Vec::with_capacity(m);
    for k in 0..m {
        let variance = covariance[(k, k)].max(0.0);
        let combined = variance.sqrt();
        let dof_terms: Vec<(f64, f64)> = (0..n)
            .map(|i| (contributions[k * n + i], model.variable(i).degrees_of_freedom))
            .collect();
        let dof = welch_satterthwaite(&dof_terms, combined);
        let k_factor = coverage_factor(settings.confidence, dof);
        let output = model.output(k);
        results.push(PropagationResult {
            method: Method::Gum,
            output: output.name.clone(),
            unit: output.report_unit.display_symbol().to_string(),
            nominal: y0[k],
            standard_uncertainty: combined,
            interval: CoverageInterval {
                lower: y0[k] - k_factor * combined,
                upper: y0[k] + k_factor * combined,
            },
            coverage_factor: k_factor,
            confidence: settings.confidence,
            degrees_of_freedom: dof,
            samples: None,
        });
    }

    let output_correlation = covariance_to_correlation(&covariance);
    info!(outputs = m, warnings = warnings.len(), "GUM propagation finished");

    Ok(GumOutcome {
        results,
        correlation: OutputCorrelation {
            outputs: (0..m).map(|k| model.output(k).name.clone()).collect(),
            matrix: row_major(&output_correlation),
        },
        coefficients,
        contributions,
        warnings,
    })
}

pub(crate) fn row_major(matrix: &DMatrix<f64>) -> Vec<f64> {
    let mut out = Vec::with_capacity(matrix.len());
    for row in matrix.row_iter() {
        out.extend(row.iter());
    }
    out
}

fn finite_difference_jacobian(
    model: &BoundModel<'_>,
    y0: &[f64],
    settings: &DerivativeSettings,
) -> Result<(Vec<f64>, Vec<ConvergenceWarning>)> {
    let n = model.arity();
    let m = model.output_count();

    let columns = (0..n)
        .into_par_iter()
        .map(|i| difference_column(model, y0, i, settings))
        .collect::<Result<Vec<_>>>()?;

    let mut jacobian = vec![0.0; m * n];
    let mut warnings = Vec::new();
    for (i, column) in columns.into_iter().enumerate() {
        for k in 0..m {
            jacobian[k * n + i] = column.derivatives[k];
        }
        warnings.extend(column.warnings);
    }
    Ok((jacobian, warnings))
}

fn difference_column(
    model: &BoundModel<'_>,
    y0: &[f64],
    i: usize,
    settings: &DerivativeSettings,
) -> Result<Column> {
    let m = model.output_count();
    let x0 = model.nominals()[i];
    let h = derivative_step(x0, model.std_uncertainties()[i], settings);

    let mut args = model.nominals().to_vec();
    let mut eval_at = |point: f64| -> Result<Vec<f64>> {
        args[i] = point;
        let mut out = vec![0.0; m];
        model
            .evaluate(&args, &mut out)
            .map_err(|err| UncertaintyError::DerivativeEvaluation {
                input: model.input_name(i).to_string(),
                point,
                unit: model.input_unit(i).display_symbol().to_string(),
                reason: format!("{err:#}"),
            })?;
        Ok(out)
    };
    let plus = eval_at(x0 + h)?;
    let minus = eval_at(x0 - h)?;

    let mut derivatives = Vec::with_capacity(m);
    let mut warnings = Vec::new();
    for k in 0..m {
        let central = (plus[k] - minus[k]) / (2.0 * h);
        let forward = (plus[k] - y0[k]) / h;
        let backward = (y0[k] - minus[k]) / h;
        let scale = y0[k].abs().max(plus[k].abs()).max(minus[k].abs());
        let noise_floor = 1e3 * f64::EPSILON * scale / h;
        if (forward - backward).abs() > settings.agreement_tolerance * central.abs() + noise_floor {
            warnings.push(ConvergenceWarning {
                input: model.input_name(i).to_string(),
                output: model.output(k).name.clone(),
                forward,
                backward,
                central,
            });
        }
        derivatives.push(central);
    }
    debug!(input = model.input_name(i), step = h, "central differences computed");

    Ok(Column {
        derivatives,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Differentiable;
    use crate::function::FunctionSpec;
    use crate::input::{Distribution, InputVariable};
    use crate::traits::{Scalar, ScalarFn, ScalarFunction, VectorFn};
    use crate::units::{SiUnits, UnitSystem};
    use proptest::prelude::*;

    fn input(name: &str, nominal: f64, u: f64, dof: f64) -> InputVariable {
        InputVariable::new(
            name,
            nominal,
            u,
            1.0,
            dof,
            SiUnits.unit("").expect("dimensionless"),
            Distribution::Normal,
        )
        .expect("valid input")
    }

    fn run(spec: &FunctionSpec, inputs: &[InputVariable]) -> Result<GumOutcome> {
        let model = spec.bind(inputs).expect("binds");
        let identity = DMatrix::identity(inputs.len(), inputs.len());
        propagate(&model, &identity, &CalculationSettings::gum_only())
    }

    #[test]
    fn product_matches_analytic_uncertainty() {
        let spec = FunctionSpec::new(
            Box::new(ScalarFn::new(2, |x: &[f64]| x[0] * x[1])),
            &[("a", ""), ("b", "")],
            &[("y", "")],
            &SiUnits,
        )
        .expect("valid function");
        let inputs = [input("a", 2.0, 0.1, f64::INFINITY), input("b", 5.0, 0.2, f64::INFINITY)];
        let outcome = run(&spec, &inputs).expect("propagates");
        let r = &outcome.results[0];
        let expected = ((5.0f64 * 0.1).powi(2) + (2.0f64 * 0.2).powi(2)).sqrt();
        assert!((r.nominal - 10.0).abs() < 1e-12);
        assert!((r.standard_uncertainty - expected).abs() < 1e-8);
        assert!((r.coverage_factor - 1.959_964).abs() < 1e-5);
        assert!(r.degrees_of_freedom.is_infinite());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn finite_dof_uses_student_t() {
        let spec = FunctionSpec::new(
            Box::new(ScalarFn::new(1, |x: &[f64]| 3.0 * x[0])),
            &[("a", "")],
            &[("y", "")],
            &SiUnits,
        )
        .expect("valid function");
        let outcome = run(&spec, &[input("a", 1.0, 0.5, 10.0)]).expect("propagates");
        let r = &outcome.results[0];
        assert!((r.degrees_of_freedom - 10.0).abs() < 1e-6);
        assert!((r.coverage_factor - 2.228_139).abs() < 1e-5);
        assert!((r.interval.half_width() - 2.228_139 * 1.5).abs() < 1e-4);
    }

    #[test]
    fn derivative_failure_names_the_input() {
        let spec = FunctionSpec::new(
            Box::new(VectorFn::new(2, 1, |x: &[f64], out: &mut [f64]| {
                if x[1] > 1.0 {
                    anyhow::bail!("out of domain");
                }
                out[0] = x[0] + x[1];
                Ok(())
            })),
            &[("a", ""), ("b", "")],
            &[("y", "")],
            &SiUnits,
        )
        .expect("valid function");
        let inputs = [input("a", 0.0, 0.1, f64::INFINITY), input("b", 1.0, 0.1, f64::INFINITY)];
        let err = run(&spec, &inputs).err().expect("must fail");
        match err {
            UncertaintyError::DerivativeEvaluation { input, reason, .. } => {
                assert_eq!(input, "b");
                assert!(reason.contains("out of domain"));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn nominal_failure_is_reported() {
        let spec = FunctionSpec::new(
            Box::new(ScalarFn::new(1, |x: &[f64]| x[0].ln())),
            &[("a", "")],
            &[("y", "")],
            &SiUnits,
        )
        .expect("valid function");
        let err = run(&spec, &[input("a", -1.0, 0.1, f64::INFINITY)]).err().expect("must fail");
        assert!(matches!(err, UncertaintyError::NominalEvaluation { .. }));
    }

    #[test]
    fn kink_at_nominal_warns() {
        let spec = FunctionSpec::new(
            Box::new(ScalarFn::new(1, |x: &[f64]| x[0].abs())),
            &[("a", "")],
            &[("y", "")],
            &SiUnits,
        )
        .expect("valid function");
        let outcome = run(&spec, &[input("a", 0.0, 1.0, f64::INFINITY)]).expect("propagates");
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].input, "a");
        assert!((outcome.warnings[0].forward - 1.0).abs() < 1e-9);
        assert!((outcome.warnings[0].backward + 1.0).abs() < 1e-9);
    }

    #[test]
    fn vector_outputs_are_correlated_through_shared_input() {
        let spec = FunctionSpec::new(
            Box::new(VectorFn::new(2, 2, |x: &[f64], out: &mut [f64]| {
                out[0] = x[0] + x[1];
                out[1] = x[0] - x[1];
                Ok(())
            })),
            &[("a", ""), ("b", "")],
            &[("sum", ""), ("diff", "")],
            &SiUnits,
        )
        .expect("valid function");
        let inputs = [input("a", 1.0, 0.3, f64::INFINITY), input("b", 1.0, 0.1, f64::INFINITY)];
        let outcome = run(&spec, &inputs).expect("propagates");
        let rho = outcome.correlation.get("sum", "diff").expect("present");
        // (0.09 - 0.01) / (0.09 + 0.01)
        assert!((rho - 0.8).abs() < 1e-6);
    }

    #[test]
    fn perfectly_correlated_inputs_cancel() {
        let spec = FunctionSpec::new(
            Box::new(ScalarFn::new(2, |x: &[f64]| x[0] - x[1])),
            &[("a", ""), ("b", "")],
            &[("y", "")],
            &SiUnits,
        )
        .expect("valid function");
        let inputs = [input("a", 1.0, 0.2, f64::INFINITY), input("b", 3.0, 0.2, f64::INFINITY)];
        let model = spec.bind(&inputs).expect("binds");
        let correlation = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let outcome =
            propagate(&model, &correlation, &CalculationSettings::gum_only()).expect("propagates");
        assert!(outcome.results[0].standard_uncertainty < 1e-8);
    }

    struct Cylinder;

    impl<T: Scalar> ScalarFunction<T> for Cylinder {
        fn arity(&self) -> usize {
            2
        }

        fn apply(&self, x: &[T], out: &mut [T]) {
            let pi = T::from_f64(std::f64::consts::PI).unwrap_or_else(T::zero);
            out[0] = pi * x[0] * x[0] * x[1];
        }
    }

    #[test]
    fn exact_partials_agree_with_finite_differences() {
        let inputs = [input("r", 0.5, 0.01, f64::INFINITY), input("h", 2.0, 0.05, f64::INFINITY)];
        let exact = FunctionSpec::new(
            Box::new(Differentiable::new(Cylinder)),
            &[("r", ""), ("h", "")],
            &[("v", "")],
            &SiUnits,
        )
        .expect("valid function");
        let numeric = FunctionSpec::new(
            Box::new(ScalarFn::new(2, |x: &[f64]| std::f64::consts::PI * x[0] * x[0] * x[1])),
            &[("r", ""), ("h", "")],
            &[("v", "")],
            &SiUnits,
        )
        .expect("valid function");
        let a = run(&exact, &inputs).expect("propagates");
        let b = run(&numeric, &inputs).expect("propagates");
        for (x, y) in a.coefficients.iter().zip(&b.coefficients) {
            assert!((x - y).abs() < 1e-6 * x.abs().max(1.0));
        }
        assert!(
            (a.results[0].standard_uncertainty - b.results[0].standard_uncertainty).abs() < 1e-9
        );
    }

    proptest! {
        #[test]
        fn linear_function_matches_root_sum_square(
            coeffs in prop::collection::vec(-10.0f64..10.0, 1..6),
            uncertainties in prop::collection::vec(0.0f64..2.0, 6),
        ) {
            let n = coeffs.len();
            let a = coeffs.clone();
            let spec = FunctionSpec::new(
                Box::new(ScalarFn::new(n, move |x: &[f64]| {
                    x.iter().zip(&a).map(|(xi, ai)| xi * ai).sum()
                })),
                &(0..n).map(|i| (["a", "b", "c", "d", "e", "f"][i], "")).collect::<Vec<_>>(),
                &[("y", "")],
                &SiUnits,
            )
            .expect("valid function");
            let inputs: Vec<InputVariable> = (0..n)
                .map(|i| input(["a", "b", "c", "d", "e", "f"][i], 1.0 + i as f64, uncertainties[i], f64::INFINITY))
                .collect();
            let outcome = run(&spec, &inputs).expect("propagates");
            let expected: f64 = coeffs
                .iter()
                .zip(&uncertainties)
                .map(|(c, u)| (c * u).powi(2))
                .sum::<f64>()
                .sqrt();
            let got = outcome.results[0].standard_uncertainty;
            prop_assert!((got - expected).abs() < 1e-6 * expected.max(1.0));
        }
    }

    #[test]
    fn step_falls_back_when_everything_vanishes() {
        let settings = DerivativeSettings::default();
        assert_eq!(derivative_step(0.0, 0.0, &settings), settings.step_fraction);
        assert!((derivative_step(1e6, 1e-9, &settings) - 1e-2).abs() < 1e-15);
        assert!((derivative_step(1.0, 2.0, &settings) - 2e-6).abs() < 1e-18);
    }
}
