pub mod autodiff;
pub mod calculator;
pub mod config;
pub mod error;
pub mod function;
pub mod gum;
pub mod input;
pub mod monte_carlo;
pub mod sensitivity;
pub mod stats;
/// The `uncertainty_core` crate propagates measurement uncertainty through a
/// user-supplied model, both by linearisation (GUM) and by Monte Carlo sampling.
///
/// Key components:
/// - **Traits**: `Evaluable` (the model seen by the propagators), `Scalar` and `ScalarFunction` (models generic over `f64` and Dual numbers).
/// - **Units**: dimension vectors, the `UnitSystem` seam and the built-in SI registry.
/// - **Input / Function**: validated input quantities and the model with its declared units.
/// - **GUM / Monte Carlo / Sensitivity**: the propagators and the per-input budget.
/// - **Calculator**: the façade that registers everything and runs `calculate`.
pub mod traits;
pub mod types;
pub mod units;

pub use calculator::Calculator;
pub use config::{CalculationSettings, DerivativeSettings, ProblemConfig};
pub use error::{ConfigurationError, UncertaintyError};
pub use input::{Distribution, InputDefinition, InputVariable};
pub use traits::{Evaluable, ScalarFn, VectorFn};
pub use types::{CalculationResults, Method, PropagationResult, SensitivityEntry};
