//! Measured inputs: their values, uncertainties, units and distributions.

use crate::error::ConfigurationError;
use crate::stats::{standard_normal_cdf, standard_normal_quantile};
use crate::units::{Unit, UnitSystem};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Shape of an input's probability distribution. Every variant is
/// parameterised by the input's mean and standard uncertainty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    #[default]
    Normal,
    Uniform,
    /// Symmetric triangular.
    Triangular,
    LogNormal,
}

impl Distribution {
    /// Maps a standard normal deviate `z` to a draw from this distribution
    /// with the given mean and standard deviation. Non-normal shapes go
    /// through `Φ(z)` and their inverse CDF, so correlated deviates keep
    /// their rank ordering.
    pub fn transform(&self, z: f64, mean: f64, std: f64) -> f64 {
        match self {
            Distribution::Normal => mean + std * z,
            Distribution::Uniform => {
                let half_width = 3f64.sqrt() * std;
                mean + half_width * (2.0 * standard_normal_cdf(z) - 1.0)
            }
            Distribution::Triangular => {
                let a = 6f64.sqrt() * std;
                let p = standard_normal_cdf(z);
                let offset = if p < 0.5 {
                    -a + a * (2.0 * p).sqrt()
                } else {
                    a - a * (2.0 * (1.0 - p)).sqrt()
                };
                mean + offset
            }
            Distribution::LogNormal => {
                let sigma_ln2 = (1.0 + (std / mean).powi(2)).ln();
                let mu_ln = mean.ln() - 0.5 * sigma_ln2;
                (mu_ln + sigma_ln2.sqrt() * z).exp()
            }
        }
    }

    /// Inverse of [`Distribution::transform`] for a quantile `p`.
    pub fn quantile(&self, p: f64, mean: f64, std: f64) -> f64 {
        self.transform(standard_normal_quantile(p), mean, std)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Distribution::Normal => "normal",
            Distribution::Uniform => "uniform",
            Distribution::Triangular => "triangular",
            Distribution::LogNormal => "lognormal",
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Distribution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" | "gaussian" => Ok(Distribution::Normal),
            "uniform" | "rectangular" => Ok(Distribution::Uniform),
            "triangular" => Ok(Distribution::Triangular),
            "lognormal" | "log-normal" => Ok(Distribution::LogNormal),
            other => Err(format!("unknown distribution '{other}'")),
        }
    }
}

/// A validated input quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct InputVariable {
    pub name: String,
    pub nominal: f64,
    /// Expanded uncertainty as given by the caller.
    pub uncertainty: f64,
    pub coverage_factor: f64,
    pub degrees_of_freedom: f64,
    pub unit: Unit,
    pub distribution: Distribution,
}

impl InputVariable {
    pub fn new(
        name: impl Into<String>,
        nominal: f64,
        uncertainty: f64,
        coverage_factor: f64,
        degrees_of_freedom: f64,
        unit: Unit,
        distribution: Distribution,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        let invalid = |reason: &str| ConfigurationError::InvalidInput {
            name: name.clone(),
            reason: reason.to_string(),
        };
        if name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !nominal.is_finite() {
            return Err(invalid("nominal value must be finite"));
        }
        if !uncertainty.is_finite() || uncertainty < 0.0 {
            return Err(invalid("uncertainty must be finite and non-negative"));
        }
        if !coverage_factor.is_finite() || coverage_factor <= 0.0 {
            return Err(invalid("coverage factor must be positive"));
        }
        if degrees_of_freedom.is_nan() || degrees_of_freedom <= 0.0 {
            return Err(invalid("degrees of freedom must be positive"));
        }
        if distribution == Distribution::LogNormal && nominal <= 0.0 {
            return Err(invalid("lognormal inputs need a positive nominal value"));
        }
        Ok(Self {
            name,
            nominal,
            uncertainty,
            coverage_factor,
            degrees_of_freedom,
            unit,
            distribution,
        })
    }

    /// The k=1 uncertainty, `uncertainty / coverage_factor`.
    pub fn standard_uncertainty(&self) -> f64 {
        self.uncertainty / self.coverage_factor
    }

    /// Nominal value and standard uncertainty expressed in `target`.
    pub fn value_in(&self, target: &Unit) -> Result<(f64, f64), ConfigurationError> {
        let factor = self.unit.factor_to(target)?;
        Ok((self.nominal * factor, self.standard_uncertainty() * factor))
    }
}

fn default_coverage_factor() -> f64 {
    1.0
}

/// Serializable description of an input, resolved against a
/// [`UnitSystem`] into an [`InputVariable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDefinition {
    pub name: String,
    pub nominal: f64,
    #[serde(default)]
    pub unit: String,
    pub uncertainty: f64,
    #[serde(default = "default_coverage_factor")]
    pub coverage_factor: f64,
    /// `None` means infinite degrees of freedom.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degrees_of_freedom: Option<f64>,
    #[serde(default)]
    pub distribution: Distribution,
}

impl InputDefinition {
    pub fn new(name: impl Into<String>, nominal: f64, unit: impl Into<String>, uncertainty: f64) -> Self {
        Self {
            name: name.into(),
            nominal,
            unit: unit.into(),
            uncertainty,
            coverage_factor: 1.0,
            degrees_of_freedom: None,
            distribution: Distribution::Normal,
        }
    }

    pub fn with_coverage_factor(mut self, k: f64) -> Self {
        self.coverage_factor = k;
        self
    }

    pub fn with_degrees_of_freedom(mut self, dof: f64) -> Self {
        self.degrees_of_freedom = if dof.is_infinite() { None } else { Some(dof) };
        self
    }

    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn resolve(&self, units: &dyn UnitSystem) -> Result<InputVariable, ConfigurationError> {
        InputVariable::new(
            self.name.clone(),
            self.nominal,
            self.uncertainty,
            self.coverage_factor,
            self.degrees_of_freedom.unwrap_or(f64::INFINITY),
            units.unit(&self.unit)?,
            self.distribution,
        )
    }
}

/// Correlation coefficient between two named inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub a: String,
    pub b: String,
    pub rho: f64,
}

impl Correlation {
    pub fn new(a: impl Into<String>, b: impl Into<String>, rho: f64) -> Result<Self, ConfigurationError> {
        let a = a.into();
        let b = b.into();
        let invalid = |reason: &str| ConfigurationError::InvalidCorrelation {
            a: a.clone(),
            b: b.clone(),
            reason: reason.to_string(),
        };
        if a == b {
            return Err(invalid("an input cannot be correlated with itself"));
        }
        if !(-1.0..=1.0).contains(&rho) {
            return Err(invalid("coefficient must lie in [-1, 1]"));
        }
        Ok(Self { a, b, rho })
    }

    pub fn involves(&self, x: &str, y: &str) -> bool {
        (self.a == x && self.b == y) || (self.a == y && self.b == x)
    }
}

/// Correlation matrix over `names` in order. Pairs not listed are
/// uncorrelated.
pub fn correlation_matrix(names: &[&str], correlations: &[Correlation]) -> DMatrix<f64> {
    let n = names.len();
    let mut matrix = DMatrix::<f64>::identity(n, n);
    for c in correlations {
        let i = names.iter().position(|&name| name == c.a);
        let j = names.iter().position(|&name| name == c.b);
        if let (Some(i), Some(j)) = (i, j) {
            matrix[(i, j)] = c.rho;
            matrix[(j, i)] = c.rho;
        }
    }
    matrix
}
