//! The measurement model together with its declared input and output units.

use crate::error::ConfigurationError;
use crate::input::{Distribution, InputVariable};
use crate::traits::Evaluable;
use crate::units::{Unit, UnitSystem};
use anyhow::{bail, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    /// Unit the function natively returns.
    pub unit: Unit,
    /// Unit results are reported in.
    pub report_unit: Unit,
}

/// A callable model plus the positional meaning of its arguments and
/// outputs.
pub struct FunctionSpec {
    func: Box<dyn Evaluable>,
    inputs: Vec<(String, Unit)>,
    outputs: Vec<OutputSpec>,
}

impl FunctionSpec {
    pub fn new(
        func: Box<dyn Evaluable>,
        inputs: &[(&str, &str)],
        outputs: &[(&str, &str)],
        units: &dyn UnitSystem,
    ) -> Result<Self, ConfigurationError> {
        if inputs.len() != func.arity() {
            return Err(ConfigurationError::ArityMismatch {
                what: "inputs",
                expected: func.arity(),
                declared: inputs.len(),
            });
        }
        if outputs.len() != func.output_count() {
            return Err(ConfigurationError::ArityMismatch {
                what: "outputs",
                expected: func.output_count(),
                declared: outputs.len(),
            });
        }

        let mut parsed_inputs: Vec<(String, Unit)> = Vec::with_capacity(inputs.len());
        for (name, unit) in inputs {
            if parsed_inputs.iter().any(|(n, _)| n == name) {
                return Err(ConfigurationError::DuplicateInput(name.to_string()));
            }
            parsed_inputs.push((name.to_string(), units.unit(unit)?));
        }

        let mut parsed_outputs: Vec<OutputSpec> = Vec::with_capacity(outputs.len());
        for (name, unit) in outputs {
            if parsed_outputs.iter().any(|o| o.name == *name) {
                return Err(ConfigurationError::DuplicateOutput(name.to_string()));
            }
            let unit = units.unit(unit)?;
            parsed_outputs.push(OutputSpec {
                name: name.to_string(),
                report_unit: unit.clone(),
                unit,
            });
        }

        Ok(Self {
            func,
            inputs: parsed_inputs,
            outputs: parsed_outputs,
        })
    }

    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|(n, _)| n.as_str())
    }

    pub fn input_units(&self) -> &[(String, Unit)] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputSpec] {
        &self.outputs
    }

    pub fn set_report_unit(&mut self, output: &str, unit: Unit) -> Result<(), ConfigurationError> {
        let spec = self
            .outputs
            .iter_mut()
            .find(|o| o.name == output)
            .ok_or_else(|| ConfigurationError::UnknownOutput(output.to_string()))?;
        spec.unit.factor_to(&unit)?;
        spec.report_unit = unit;
        Ok(())
    }

    /// Function inputs without a matching definition, in argument order.
    pub fn required_inputs(&self, defined: &[InputVariable]) -> Vec<String> {
        self.input_names()
            .filter(|name| !defined.iter().any(|v| v.name == *name))
            .map(str::to_string)
            .collect()
    }

    /// Resolves every argument against `defined` and fixes the unit
    /// conversions for a run.
    pub fn bind<'a>(&'a self, defined: &'a [InputVariable]) -> Result<BoundModel<'a>, ConfigurationError> {
        let mut variables = Vec::with_capacity(self.inputs.len());
        let mut nominals = Vec::with_capacity(self.inputs.len());
        let mut std_uncertainties = Vec::with_capacity(self.inputs.len());
        let mut input_factors = Vec::with_capacity(self.inputs.len());

        for (name, unit) in &self.inputs {
            let variable = defined
                .iter()
                .find(|v| v.name == *name)
                .ok_or_else(|| ConfigurationError::UndefinedInput(name.clone()))?;
            let factor = variable.unit.factor_to(unit)?;
            nominals.push(variable.nominal * factor);
            std_uncertainties.push(variable.standard_uncertainty() * factor);
            input_factors.push(factor);
            variables.push(variable);
        }

        let output_factors = self
            .outputs
            .iter()
            .map(|o| o.unit.factor_to(&o.report_unit))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BoundModel {
            func: self.func.as_ref(),
            spec: self,
            variables,
            nominals,
            std_uncertainties,
            input_factors,
            output_factors,
        })
    }
}

/// A [`FunctionSpec`] resolved against concrete inputs. Arguments are in the
/// function's declared units; outputs come back in report units.
pub struct BoundModel<'a> {
    func: &'a dyn Evaluable,
    spec: &'a FunctionSpec,
    variables: Vec<&'a InputVariable>,
    nominals: Vec<f64>,
    std_uncertainties: Vec<f64>,
    input_factors: Vec<f64>,
    output_factors: Vec<f64>,
}

impl<'a> BoundModel<'a> {
    pub fn arity(&self) -> usize {
        self.nominals.len()
    }

    pub fn output_count(&self) -> usize {
        self.output_factors.len()
    }

    pub fn nominals(&self) -> &[f64] {
        &self.nominals
    }

    pub fn std_uncertainties(&self) -> &[f64] {
        &self.std_uncertainties
    }

    pub fn variable(&self, i: usize) -> &InputVariable {
        self.variables[i]
    }

    pub fn distribution(&self, i: usize) -> Distribution {
        self.variables[i].distribution
    }

    pub fn input_name(&self, i: usize) -> &str {
        &self.spec.inputs[i].0
    }

    pub fn input_unit(&self, i: usize) -> &Unit {
        &self.spec.inputs[i].1
    }

    /// Multiplies a value in the input's own unit to give the function unit.
    pub fn input_factor(&self, i: usize) -> f64 {
        self.input_factors[i]
    }

    pub fn output(&self, k: usize) -> &OutputSpec {
        &self.spec.outputs[k]
    }

    /// Unit label of `∂output_k / ∂input_i` as reported.
    pub fn coefficient_unit(&self, k: usize, i: usize) -> String {
        let out = self.spec.outputs[k].report_unit.display_symbol();
        let input = &self.variables[i].unit;
        if input.symbol.is_empty() {
            out.to_string()
        } else {
            format!("{out}/{}", input.symbol)
        }
    }

    pub fn evaluate(&self, args: &[f64], out: &mut [f64]) -> Result<()> {
        self.func.evaluate(args, out)?;
        self.finish_row(out)
    }

    /// Evaluates `rows` argument vectors; failing rows (errors or
    /// non-finite values) are returned in ascending order.
    pub fn evaluate_batch(&self, rows: usize, args: &[f64], out: &mut [f64]) -> Vec<(usize, String)> {
        let n_out = self.output_count();
        let mut failures = self.func.evaluate_batch(rows, args, out);
        failures.sort_by_key(|(row, _)| *row);
        let mut next_failed = failures.iter().map(|(row, _)| *row).peekable();
        let mut extra = Vec::new();
        for row in 0..rows {
            if next_failed.peek() == Some(&row) {
                next_failed.next();
                continue;
            }
            let y = &mut out[row * n_out..(row + 1) * n_out];
            if let Err(err) = self.finish_row(y) {
                y.fill(f64::NAN);
                extra.push((row, format!("{err:#}")));
            }
        }
        if !extra.is_empty() {
            failures.extend(extra);
            failures.sort_by_key(|(row, _)| *row);
        }
        failures
    }

    /// Exact partials in report units per function-input unit, if the
    /// model provides them.
    pub fn partials(&self, args: &[f64]) -> Option<Result<Vec<f64>>> {
        let n = self.arity();
        self.func.partials(args).map(|result| {
            let mut jacobian = result?;
            if jacobian.len() != n * self.output_count() {
                bail!(
                    "partials returned {} values, expected {}",
                    jacobian.len(),
                    n * self.output_count()
                );
            }
            for (k, factor) in self.output_factors.iter().enumerate() {
                for value in &mut jacobian[k * n..(k + 1) * n] {
                    *value *= factor;
                }
            }
            Ok(jacobian)
        })
    }

    fn finish_row(&self, out: &mut [f64]) -> Result<()> {
        for (k, (value, factor)) in out.iter_mut().zip(&self.output_factors).enumerate() {
            if !value.is_finite() {
                bail!(
                    "function returned non-finite value {value} for output '{}'",
                    self.spec.outputs[k].name
                );
            }
            *value *= factor;
        }
        Ok(())
    }
}
