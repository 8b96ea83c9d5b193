//! The public entry point: register inputs and a model, then propagate.

use crate::config::{CalculationSettings, ProblemConfig};
use crate::error::{ConfigurationError, Result, UncertaintyError};
use crate::function::FunctionSpec;
use crate::gum;
use crate::input::{correlation_matrix, Correlation, Distribution, InputDefinition, InputVariable};
use crate::monte_carlo;
use crate::sensitivity;
use crate::stats::{is_positive_semidefinite, psd_cholesky};
use crate::traits::Evaluable;
use crate::types::{CalculationResults, Method, SensitivityEntry};
use crate::units::{SiUnits, Unit, UnitSystem};
use std::collections::BTreeMap;
use tracing::info;

/// Holds the registered inputs, correlations and model.
///
/// Registration methods validate eagerly; `calculate` re-checks everything
/// that depends on the combination of inputs and model before the first
/// evaluation. The sensitivity table of the latest successful run is kept
/// until the configuration changes.
pub struct Calculator {
    units: Box<dyn UnitSystem>,
    inputs: Vec<InputVariable>,
    correlations: Vec<Correlation>,
    function: Option<FunctionSpec>,
    pending_report_units: BTreeMap<String, Unit>,
    last_sensitivity: Option<Vec<SensitivityEntry>>,
}

impl Default for Calculator {
    fn default() -> Self {
        Self::new()
    }
}

impl Calculator {
    pub fn new() -> Self {
        Self::with_units(Box::new(SiUnits))
    }

    pub fn with_units(units: Box<dyn UnitSystem>) -> Self {
        Self {
            units,
            inputs: Vec::new(),
            correlations: Vec::new(),
            function: None,
            pending_report_units: BTreeMap::new(),
            last_sensitivity: None,
        }
    }

    /// Builds a calculator from a configuration. The model still has to be
    /// supplied with [`Calculator::set_function`]; report units from the
    /// configuration are applied when it is.
    pub fn from_config(config: &ProblemConfig) -> Result<Self> {
        let mut calc = Self::new();
        for def in &config.inputs {
            calc.define(def.clone())?;
        }
        for c in &config.correlations {
            calc.set_correlation(&c.a, &c.b, c.rho)?;
        }
        for (output, unit) in &config.report_units {
            calc.set_report_unit(output, unit)?;
        }
        Ok(calc)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn define_input(
        &mut self,
        name: &str,
        nominal: f64,
        unit: &str,
        uncertainty: f64,
        coverage_factor: f64,
        degrees_of_freedom: f64,
        distribution: Distribution,
    ) -> Result<()> {
        let variable = InputVariable::new(
            name,
            nominal,
            uncertainty,
            coverage_factor,
            degrees_of_freedom,
            self.units.unit(unit)?,
            distribution,
        )?;
        self.add_input(variable)
    }

    /// Normal input with k = 1 and infinite degrees of freedom.
    pub fn define_input_simple(&mut self, name: &str, nominal: f64, unit: &str, uncertainty: f64) -> Result<()> {
        self.define_input(name, nominal, unit, uncertainty, 1.0, f64::INFINITY, Distribution::Normal)
    }

    pub fn define(&mut self, definition: InputDefinition) -> Result<()> {
        let variable = definition.resolve(self.units.as_ref())?;
        self.add_input(variable)
    }

    fn add_input(&mut self, variable: InputVariable) -> Result<()> {
        if self.input(&variable.name).is_some() {
            return Err(ConfigurationError::DuplicateInput(variable.name).into());
        }
        if let Some(spec) = &self.function {
            if let Some((_, expected)) = spec.input_units().iter().find(|(n, _)| *n == variable.name) {
                variable.unit.factor_to(expected)?;
            }
        }
        self.inputs.push(variable);
        self.last_sensitivity = None;
        Ok(())
    }

    /// Registers the model, replacing any previous one. `inputs` and
    /// `outputs` are `(name, unit)` pairs in the function's positional order.
    pub fn set_function<E: Evaluable + 'static>(
        &mut self,
        func: E,
        inputs: &[(&str, &str)],
        outputs: &[(&str, &str)],
    ) -> Result<()> {
        let mut spec = FunctionSpec::new(Box::new(func), inputs, outputs, self.units.as_ref())?;
        for (name, expected) in spec.input_units() {
            if let Some(variable) = self.input(name) {
                variable.unit.factor_to(expected)?;
            }
        }
        for (output, unit) in &self.pending_report_units {
            spec.set_report_unit(output, unit.clone())?;
        }
        self.pending_report_units.clear();
        self.function = Some(spec);
        self.last_sensitivity = None;
        Ok(())
    }

    /// Reports `output` in `unit` instead of the function's native unit.
    /// Before a function is set the request is kept and applied by
    /// [`Calculator::set_function`].
    pub fn set_report_unit(&mut self, output: &str, unit: &str) -> Result<()> {
        let unit = self.units.unit(unit)?;
        match &mut self.function {
            Some(spec) => spec.set_report_unit(output, unit)?,
            None => {
                self.pending_report_units.insert(output.to_string(), unit);
            }
        }
        self.last_sensitivity = None;
        Ok(())
    }

    pub fn set_correlation(&mut self, a: &str, b: &str, rho: f64) -> Result<()> {
        let correlation = Correlation::new(a, b, rho)?;
        for name in [a, b] {
            if self.input(name).is_none() {
                return Err(ConfigurationError::UndefinedInput(name.to_string()).into());
            }
        }
        self.correlations.retain(|c| !c.involves(a, b));
        self.correlations.push(correlation);
        self.last_sensitivity = None;
        Ok(())
    }

    pub fn inputs(&self) -> &[InputVariable] {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&InputVariable> {
        self.inputs.iter().find(|v| v.name == name)
    }

    pub fn correlations(&self) -> &[Correlation] {
        &self.correlations
    }

    /// Function arguments that have no input definition yet.
    pub fn required_inputs(&self) -> Vec<String> {
        self.function
            .as_ref()
            .map(|spec| spec.required_inputs(&self.inputs))
            .unwrap_or_default()
    }

    /// Runs the enabled propagation methods. Either every enabled method
    /// succeeds or nothing is returned.
    pub fn calculate(&mut self, settings: &CalculationSettings) -> Result<CalculationResults> {
        settings.validate()?;
        let spec = self.function.as_ref().ok_or(ConfigurationError::NoFunction)?;
        let model = spec.bind(&self.inputs)?;

        let names: Vec<&str> = spec.input_names().collect();
        let correlation = correlation_matrix(&names, &self.correlations);
        if !is_positive_semidefinite(&correlation) {
            return Err(ConfigurationError::CorrelationNotPositiveDefinite.into());
        }
        let cholesky = psd_cholesky(&correlation)?;

        info!(
            gum = settings.gum,
            monte_carlo = settings.monte_carlo,
            inputs = names.len(),
            "calculation started"
        );

        let mut results = BTreeMap::new();
        let mut correlations = BTreeMap::new();
        let mut sensitivity_entries = Vec::new();
        let mut correlation_proportions = Vec::new();
        let mut warnings = Vec::new();
        let mut seed = None;
        let mut samples = Vec::new();

        if settings.gum {
            let outcome = gum::propagate(&model, &correlation, settings)?;
            let (entries, remainders) = sensitivity::gum_sensitivity(&model, &outcome);
            sensitivity_entries.extend(entries);
            correlation_proportions = remainders;
            warnings = outcome.warnings;
            correlations.insert(Method::Gum, outcome.correlation);
            results.insert(Method::Gum, outcome.results);
        }

        if settings.monte_carlo {
            let run_seed = monte_carlo::resolve_seed(settings);
            let outcome = monte_carlo::propagate(&model, &cholesky, settings, run_seed)?;
            if settings.mc_sensitivity {
                sensitivity_entries.extend(sensitivity::monte_carlo_sensitivity(&model, settings, run_seed)?);
            }
            seed = Some(outcome.seed);
            samples = outcome.samples;
            correlations.insert(Method::MonteCarlo, outcome.correlation);
            results.insert(Method::MonteCarlo, outcome.results);
        }

        info!(seed = ?seed, warnings = warnings.len(), "calculation finished");
        self.last_sensitivity = Some(sensitivity_entries.clone());

        Ok(CalculationResults {
            results,
            correlations,
            sensitivity: sensitivity_entries,
            correlation_proportions,
            warnings,
            settings: settings.clone(),
            seed,
            samples,
        })
    }

    /// Sensitivity table of the latest successful [`Calculator::calculate`].
    pub fn sensitivity(&self) -> Result<Vec<SensitivityEntry>> {
        self.last_sensitivity.clone().ok_or(UncertaintyError::NotCalculated)
    }
}
