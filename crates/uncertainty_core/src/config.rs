use crate::error::ConfigurationError;
use crate::input::{Correlation, InputDefinition};
use crate::types::IntervalKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Finite-difference settings for the GUM partial derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivativeSettings {
    /// Step as a fraction of the input's standard uncertainty.
    pub step_fraction: f64,
    /// Lower bound on the step relative to the nominal magnitude.
    pub min_relative_step: f64,
    /// Relative disagreement between one-sided and central differences that
    /// triggers a convergence warning.
    pub agreement_tolerance: f64,
}

impl Default for DerivativeSettings {
    fn default() -> Self {
        Self {
            step_fraction: 1e-6,
            min_relative_step: 1e-8,
            agreement_tolerance: 1e-2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculationSettings {
    pub gum: bool,
    pub monte_carlo: bool,
    pub confidence: f64,
    pub mc_samples: usize,
    pub seed: Option<u64>,
    pub shard_size: usize,
    /// Largest tolerated fraction of failed Monte Carlo samples.
    pub max_drop_fraction: f64,
    pub interval: IntervalKind,
    pub derivative: DerivativeSettings,
    pub mc_sensitivity: bool,
    /// Samples per input for the Monte Carlo sensitivity pass; defaults to
    /// `min(mc_samples, 100_000)`.
    pub sensitivity_samples: Option<usize>,
}

impl Default for CalculationSettings {
    fn default() -> Self {
        Self {
            gum: true,
            monte_carlo: true,
            confidence: 0.95,
            mc_samples: 1_000_000,
            seed: None,
            shard_size: 50_000,
            max_drop_fraction: 0.0,
            interval: IntervalKind::Symmetric,
            derivative: DerivativeSettings::default(),
            mc_sensitivity: true,
            sensitivity_samples: None,
        }
    }
}

impl CalculationSettings {
    pub fn gum_only() -> Self {
        Self {
            monte_carlo: false,
            ..Self::default()
        }
    }

    pub fn monte_carlo_only(samples: usize, seed: u64) -> Self {
        Self {
            gum: false,
            mc_samples: samples,
            seed: Some(seed),
            ..Self::default()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.mc_samples = samples;
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn sensitivity_sample_count(&self) -> usize {
        self.sensitivity_samples
            .unwrap_or_else(|| self.mc_samples.min(100_000))
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |msg: &str| Err(ConfigurationError::InvalidSettings(msg.to_string()));
        if !self.gum && !self.monte_carlo {
            return invalid("at least one of gum or monte_carlo must be enabled");
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return invalid("confidence must lie strictly between 0 and 1");
        }
        if self.monte_carlo {
            if self.mc_samples < 2 {
                return invalid("mc_samples must be at least 2");
            }
            if self.shard_size == 0 {
                return invalid("shard_size must be positive");
            }
            if !(0.0..1.0).contains(&self.max_drop_fraction) {
                return invalid("max_drop_fraction must lie in [0, 1)");
            }
            if self.mc_sensitivity && self.sensitivity_sample_count() < 2 {
                return invalid("sensitivity_samples must be at least 2");
            }
        }
        let d = &self.derivative;
        if !(d.step_fraction > 0.0) || !(d.min_relative_step >= 0.0) {
            return invalid("derivative steps must be positive");
        }
        if !(d.agreement_tolerance > 0.0) {
            return invalid("agreement_tolerance must be positive");
        }
        Ok(())
    }
}

/// A complete problem description minus the model itself, which is always
/// supplied in code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProblemConfig {
    pub inputs: Vec<InputDefinition>,
    pub correlations: Vec<Correlation>,
    /// Output name to report unit.
    pub report_units: BTreeMap<String, String>,
    pub settings: CalculationSettings,
}
