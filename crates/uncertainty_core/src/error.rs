//! Error taxonomy for the propagation engine.
//!
//! Configuration problems are raised eagerly while inputs and the model are
//! being registered (or, at the latest, before the first evaluation of a
//! run). Numeric failures carry enough context to locate the failing
//! evaluation.

use thiserror::Error;

/// Problems with how a calculation was set up.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("arity mismatch: function takes {expected} {what} but {declared} were declared")]
    ArityMismatch {
        what: &'static str,
        expected: usize,
        declared: usize,
    },

    #[error("input '{0}' is already defined")]
    DuplicateInput(String),

    #[error("output '{0}' is declared more than once")]
    DuplicateOutput(String),

    #[error("incompatible units: cannot convert {from} to {to}")]
    IncompatibleUnits { from: String, to: String },

    #[error("unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("input '{0}' is not defined")]
    UndefinedInput(String),

    #[error("unknown output '{0}'")]
    UnknownOutput(String),

    #[error("invalid input '{name}': {reason}")]
    InvalidInput { name: String, reason: String },

    #[error("invalid correlation between '{a}' and '{b}': {reason}")]
    InvalidCorrelation { a: String, b: String, reason: String },

    #[error("input correlation matrix is not positive semi-definite")]
    CorrelationNotPositiveDefinite,

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("no function has been set")]
    NoFunction,
}

/// Errors returned by the public calculator API.
#[derive(Debug, Clone, Error)]
pub enum UncertaintyError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("function evaluation at the nominal point failed: {reason}")]
    NominalEvaluation { reason: String },

    #[error(
        "derivative evaluation failed for input '{input}' at perturbed value {point} {unit}: {reason}"
    )]
    DerivativeEvaluation {
        input: String,
        point: f64,
        unit: String,
        reason: String,
    },

    #[error(
        "{failed} of {total} Monte Carlo samples failed (threshold {threshold}); first failure: {first_failure}"
    )]
    SampleEvaluation {
        failed: usize,
        total: usize,
        threshold: f64,
        first_failure: String,
    },

    #[error("sensitivity is only available after a successful calculate()")]
    NotCalculated,
}

impl UncertaintyError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, UncertaintyError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, UncertaintyError>;
