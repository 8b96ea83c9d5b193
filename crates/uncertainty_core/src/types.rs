use crate::config::CalculationSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Method {
    Gum,
    MonteCarlo,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Gum => f.write_str("GUM"),
            Method::MonteCarlo => f.write_str("Monte Carlo"),
        }
    }
}

/// How a Monte Carlo coverage interval is chosen from the samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalKind {
    /// Equal tail probability on each side.
    #[default]
    Symmetric,
    /// Narrowest interval holding the coverage probability.
    Shortest,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageInterval {
    pub lower: f64,
    pub upper: f64,
}

impl CoverageInterval {
    pub fn half_width(&self) -> f64 {
        (self.upper - self.lower) / 2.0
    }

    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }
}

/// Sample bookkeeping attached to Monte Carlo results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub samples: usize,
    pub dropped: usize,
    pub drop_fraction: f64,
    pub interval_kind: IntervalKind,
}

/// Propagated value of one output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationResult {
    pub method: Method,
    pub output: String,
    pub unit: String,
    pub nominal: f64,
    pub standard_uncertainty: f64,
    pub interval: CoverageInterval,
    /// For Monte Carlo this is the effective factor, half-width / u.
    pub coverage_factor: f64,
    pub confidence: f64,
    /// Infinite for Monte Carlo and for GUM without finite-dof inputs.
    /// Serialized as `null` when infinite.
    #[serde(with = "infinite_as_null")]
    pub degrees_of_freedom: f64,
    pub samples: Option<SampleSummary>,
}

mod infinite_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        let finite = value.is_finite().then_some(*value);
        finite.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

impl PropagationResult {
    pub fn expanded_uncertainty(&self) -> f64 {
        self.coverage_factor * self.standard_uncertainty
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityEntry {
    pub method: Method,
    pub output: String,
    pub variable: String,
    /// Partial derivative in report-unit of the output per unit of the input.
    pub coefficient: f64,
    pub coefficient_unit: String,
    /// `(c_i u_i)² / u²` for GUM. Stays within [0, 1] only for uncorrelated
    /// inputs: with strong correlation `u²` can shrink below a single
    /// term, pushing this above 1 while the matching
    /// [`CorrelationProportion`] goes negative.
    pub proportion: f64,
    pub approximate: bool,
}

/// Share of an output's GUM variance not explained by the individual
/// inputs, i.e. the contribution of input correlations. Negative when the
/// correlations cancel variance, in which case the per-input proportions
/// can exceed 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationProportion {
    pub output: String,
    pub proportion: f64,
}

/// Non-fatal disagreement between one-sided and central differences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceWarning {
    pub input: String,
    pub output: String,
    pub forward: f64,
    pub backward: f64,
    pub central: f64,
}

impl fmt::Display for ConvergenceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "derivative of '{}' with respect to '{}' may be unreliable: forward {:e}, backward {:e}, central {:e}",
            self.output, self.input, self.forward, self.backward, self.central
        )
    }
}

/// Output correlation matrix, row-major over `outputs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputCorrelation {
    pub outputs: Vec<String>,
    pub matrix: Vec<f64>,
}

impl OutputCorrelation {
    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        let i = self.outputs.iter().position(|o| o == a)?;
        let j = self.outputs.iter().position(|o| o == b)?;
        Some(self.matrix[i * self.outputs.len() + j])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationResults {
    pub results: BTreeMap<Method, Vec<PropagationResult>>,
    pub correlations: BTreeMap<Method, OutputCorrelation>,
    pub sensitivity: Vec<SensitivityEntry>,
    pub correlation_proportions: Vec<CorrelationProportion>,
    pub warnings: Vec<ConvergenceWarning>,
    pub settings: CalculationSettings,
    /// Seed actually used by the Monte Carlo run.
    pub seed: Option<u64>,
    /// Raw Monte Carlo output samples in report units, one vector per output.
    #[serde(skip)]
    pub samples: Vec<Vec<f64>>,
}

impl CalculationResults {
    pub fn get(&self, method: Method, output: &str) -> Option<&PropagationResult> {
        self.results
            .get(&method)?
            .iter()
            .find(|r| r.output == output)
    }

    pub fn sensitivity_for(&self, method: Method) -> impl Iterator<Item = &SensitivityEntry> {
        self.sensitivity.iter().filter(move |s| s.method == method)
    }
}
