use anyhow::Result;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in measurement models.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// The measurement model seen by the propagators.
///
/// Implementations must be referentially transparent: the propagators call
/// them repeatedly, with perturbed and sampled arguments, from several
/// threads at once.
pub trait Evaluable: Send + Sync {
    /// Number of positional arguments.
    fn arity(&self) -> usize;

    /// Number of values written per evaluation.
    fn output_count(&self) -> usize {
        1
    }

    /// Evaluates the model at `args`, writing `output_count()` values into `out`.
    fn evaluate(&self, args: &[f64], out: &mut [f64]) -> Result<()>;

    /// Evaluates `rows` argument vectors stored row-major in `args`, writing
    /// row-major results into `out`.
    ///
    /// Returns the failing rows with their error messages; a failure in one
    /// row never aborts the rest of the batch. Override this when the model
    /// has a faster vectorized form.
    fn evaluate_batch(&self, rows: usize, args: &[f64], out: &mut [f64]) -> Vec<(usize, String)> {
        let n_in = self.arity();
        let n_out = self.output_count();
        let mut failures = Vec::new();
        for row in 0..rows {
            let x = &args[row * n_in..(row + 1) * n_in];
            let y = &mut out[row * n_out..(row + 1) * n_out];
            if let Err(err) = self.evaluate(x, y) {
                y.fill(f64::NAN);
                failures.push((row, format!("{err:#}")));
            }
        }
        failures
    }

    /// Exact partial derivatives at `args`, row-major `[output][input]`.
    /// `None` means the propagator should differentiate numerically.
    fn partials(&self, _args: &[f64]) -> Option<Result<Vec<f64>>> {
        None
    }
}

impl<E: Evaluable + ?Sized> Evaluable for Box<E> {
    fn arity(&self) -> usize {
        (**self).arity()
    }

    fn output_count(&self) -> usize {
        (**self).output_count()
    }

    fn evaluate(&self, args: &[f64], out: &mut [f64]) -> Result<()> {
        (**self).evaluate(args, out)
    }

    fn evaluate_batch(&self, rows: usize, args: &[f64], out: &mut [f64]) -> Vec<(usize, String)> {
        (**self).evaluate_batch(rows, args, out)
    }

    fn partials(&self, args: &[f64]) -> Option<Result<Vec<f64>>> {
        (**self).partials(args)
    }
}

/// A model written once for any [`Scalar`], so it can be evaluated with
/// plain floats or with dual numbers for exact derivatives.
pub trait ScalarFunction<T: Scalar> {
    fn arity(&self) -> usize;

    fn output_count(&self) -> usize {
        1
    }

    /// x: arguments in the declared order
    /// out: buffer receiving the outputs
    fn apply(&self, x: &[T], out: &mut [T]);
}

/// Adapts a scalar closure `f(&[f64]) -> f64` with a fixed arity.
pub struct ScalarFn<F> {
    arity: usize,
    func: F,
}

impl<F> ScalarFn<F>
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    pub fn new(arity: usize, func: F) -> Self {
        Self { arity, func }
    }
}

impl<F> Evaluable for ScalarFn<F>
where
    F: Fn(&[f64]) -> f64 + Send + Sync,
{
    fn arity(&self) -> usize {
        self.arity
    }

    fn evaluate(&self, args: &[f64], out: &mut [f64]) -> Result<()> {
        out[0] = (self.func)(args);
        Ok(())
    }
}

/// Adapts a fallible, possibly vector-valued closure.
pub struct VectorFn<F> {
    arity: usize,
    outputs: usize,
    func: F,
}

impl<F> VectorFn<F>
where
    F: Fn(&[f64], &mut [f64]) -> Result<()> + Send + Sync,
{
    pub fn new(arity: usize, outputs: usize, func: F) -> Self {
        Self {
            arity,
            outputs,
            func,
        }
    }
}

impl<F> Evaluable for VectorFn<F>
where
    F: Fn(&[f64], &mut [f64]) -> Result<()> + Send + Sync,
{
    fn arity(&self) -> usize {
        self.arity
    }

    fn output_count(&self) -> usize {
        self.outputs
    }

    fn evaluate(&self, args: &[f64], out: &mut [f64]) -> Result<()> {
        (self.func)(args, out)
    }
}
