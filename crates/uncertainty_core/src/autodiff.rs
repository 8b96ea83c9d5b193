use crate::traits::{Evaluable, ScalarFunction};
use anyhow::Result;
use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Simple Dual Number for Forward Mode AD
/// val: real part
/// eps: infinitesimal part
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    pub val: f64,
    pub eps: f64,
}

impl Dual {
    pub fn new(val: f64, eps: f64) -> Self {
        Self { val, eps }
    }

    /// A constant (zero derivative).
    pub fn constant(val: f64) -> Self {
        Self::new(val, 0.0)
    }

    /// The independent variable of a derivative (unit seed).
    pub fn variable(val: f64) -> Self {
        Self::new(val, 1.0)
    }

    fn chain(self, val: f64, deriv: f64) -> Self {
        Self::new(val, deriv * self.eps)
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.eps == 0.0
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::new(1.0, 0.0)
    }
}

impl Add for Dual {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.val + rhs.val, self.eps + rhs.eps)
    }
}

impl Sub for Dual {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.val - rhs.val, self.eps - rhs.eps)
    }
}

impl Mul for Dual {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        Self::new(self.val * rhs.val, self.val * rhs.eps + self.eps * rhs.val)
    }
}

impl Div for Dual {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let denom = rhs.val * rhs.val;
        Self::new(
            self.val / rhs.val,
            (self.eps * rhs.val - self.val * rhs.eps) / denom,
        )
    }
}

impl Neg for Dual {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.val, -self.eps)
    }
}

impl Rem for Dual {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // d(a mod b) = da - trunc(a/b) db almost everywhere.
        let q = (self.val / rhs.val).trunc();
        Self::new(self.val % rhs.val, self.eps - q * rhs.eps)
    }
}

impl AddAssign for Dual {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
impl SubAssign for Dual {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
impl MulAssign for Dual {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}
impl DivAssign for Dual {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}
impl RemAssign for Dual {
    fn rem_assign(&mut self, rhs: Self) {
        *self = *self % rhs;
    }
}

impl Num for Dual {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(Self::constant)
            .map_err(|_| ())
    }
}

impl ToPrimitive for Dual {
    fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.val)
    }
}

impl FromPrimitive for Dual {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl NumCast for Dual {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

impl Float for Dual {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::new(-0.0, -0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.val.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.val.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.val.is_finite()
    }
    fn is_normal(self) -> bool {
        self.val.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn floor(self) -> Self {
        Self::constant(self.val.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.val.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.val.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.val.trunc())
    }
    fn fract(self) -> Self {
        Self::new(self.val.fract(), self.eps)
    }
    fn abs(self) -> Self {
        Self::new(
            self.val.abs(),
            if self.val >= 0.0 { self.eps } else { -self.eps },
        )
    }
    fn signum(self) -> Self {
        Self::constant(self.val.signum())
    }
    fn is_sign_positive(self) -> bool {
        self.val.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.val.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        Self::one() / self
    }

    fn powi(self, n: i32) -> Self {
        let val_pow = self.val.powi(n);
        Self::new(val_pow, (n as f64) * self.val.powi(n - 1) * self.eps)
    }

    fn powf(self, n: Self) -> Self {
        // x^y = exp(y * ln(x)); the ln(x) term only matters when y varies.
        let val_pow = self.val.powf(n.val);
        let base_term = if self.eps == 0.0 {
            0.0
        } else {
            n.val * self.val.powf(n.val - 1.0) * self.eps
        };
        let exp_term = if n.eps == 0.0 {
            0.0
        } else {
            val_pow * self.val.ln() * n.eps
        };
        Self::new(val_pow, base_term + exp_term)
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }

    fn exp2(self) -> Self {
        let e = self.val.exp2();
        self.chain(e, e * std::f64::consts::LN_2)
    }
    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        self.chain(self.val.log2(), 1.0 / (self.val * std::f64::consts::LN_2))
    }
    fn log10(self) -> Self {
        self.chain(self.val.log10(), 1.0 / (self.val * std::f64::consts::LN_10))
    }

    fn max(self, other: Self) -> Self {
        if self.val > other.val {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.val < other.val {
            self
        } else {
            other
        }
    }

    fn abs_sub(self, other: Self) -> Self {
        if self.val > other.val {
            self - other
        } else {
            Self::zero()
        }
    }

    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        self.chain(c, 1.0 / (3.0 * c * c))
    }
    fn hypot(self, other: Self) -> Self {
        let h = self.val.hypot(other.val);
        Self::new(h, (self.val * self.eps + other.val * other.eps) / h)
    }

    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }
    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }
    fn asin(self) -> Self {
        self.chain(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn acos(self) -> Self {
        self.chain(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn atan(self) -> Self {
        self.chain(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
    }
    fn atan2(self, other: Self) -> Self {
        let denom = self.val * self.val + other.val * other.val;
        Self::new(
            self.val.atan2(other.val),
            (other.val * self.eps - self.val * other.eps) / denom,
        )
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }

    fn exp_m1(self) -> Self {
        self.chain(self.val.exp_m1(), self.val.exp())
    }
    fn ln_1p(self) -> Self {
        self.chain(self.val.ln_1p(), 1.0 / (1.0 + self.val))
    }
    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }
    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }
    fn asinh(self) -> Self {
        self.chain(self.val.asinh(), 1.0 / (self.val * self.val + 1.0).sqrt())
    }
    fn acosh(self) -> Self {
        self.chain(self.val.acosh(), 1.0 / (self.val * self.val - 1.0).sqrt())
    }
    fn atanh(self) -> Self {
        self.chain(self.val.atanh(), 1.0 / (1.0 - self.val * self.val))
    }

    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}

// --- Differentiable model wrapper ---

/// Wraps a model written generically over [`crate::traits::Scalar`] so the
/// GUM propagator receives exact partial derivatives instead of finite
/// differences.
pub struct Differentiable<F> {
    pub inner: F,
}

impl<F> Differentiable<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F> Evaluable for Differentiable<F>
where
    F: ScalarFunction<f64> + ScalarFunction<Dual> + Send + Sync,
{
    fn arity(&self) -> usize {
        ScalarFunction::<f64>::arity(&self.inner)
    }

    fn output_count(&self) -> usize {
        ScalarFunction::<f64>::output_count(&self.inner)
    }

    fn evaluate(&self, args: &[f64], out: &mut [f64]) -> Result<()> {
        self.inner.apply(args, out);
        Ok(())
    }

    fn partials(&self, args: &[f64]) -> Option<Result<Vec<f64>>> {
        // One forward sweep per input; column j of the Jacobian is the
        // derivative part of the outputs with x_j seeded.
        let n = args.len();
        let m = ScalarFunction::<Dual>::output_count(&self.inner);
        let mut jacobian = vec![0.0; m * n];
        let mut dual_x: Vec<Dual> = args.iter().map(|&v| Dual::constant(v)).collect();
        let mut dual_out = vec![Dual::zero(); m];

        for j in 0..n {
            dual_x[j] = Dual::variable(args[j]);
            self.inner.apply(&dual_x, &mut dual_out);
            for i in 0..m {
                jacobian[i * n + j] = dual_out[i].eps;
            }
            dual_x[j] = Dual::constant(args[j]);
        }

        Some(Ok(jacobian))
    }
}

#[cfg(test)]
mod tests {
    use super::{Differentiable, Dual};
    use crate::traits::{Evaluable, Scalar, ScalarFunction};
    use num_traits::Float;

    fn derivative(f: impl Fn(Dual) -> Dual, x: f64) -> f64 {
        f(Dual::variable(x)).eps
    }

    fn central(f: impl Fn(f64) -> f64, x: f64) -> f64 {
        let h = 1e-6 * x.abs().max(1.0);
        (f(x + h) - f(x - h)) / (2.0 * h)
    }

    #[test]
    fn elementary_functions_match_finite_differences() {
        let x = 0.37;
        let cases: Vec<(Box<dyn Fn(Dual) -> Dual>, Box<dyn Fn(f64) -> f64>)> = vec![
            (Box::new(|v: Dual| v.sqrt()), Box::new(|v: f64| v.sqrt())),
            (Box::new(|v: Dual| v.exp2()), Box::new(|v: f64| v.exp2())),
            (Box::new(|v: Dual| v.log10()), Box::new(|v: f64| v.log10())),
            (Box::new(|v: Dual| v.cbrt()), Box::new(|v: f64| v.cbrt())),
            (Box::new(|v: Dual| v.asin()), Box::new(|v: f64| v.asin())),
            (Box::new(|v: Dual| v.acos()), Box::new(|v: f64| v.acos())),
            (Box::new(|v: Dual| v.atan()), Box::new(|v: f64| v.atan())),
            (Box::new(|v: Dual| v.tanh()), Box::new(|v: f64| v.tanh())),
            (Box::new(|v: Dual| v.atanh()), Box::new(|v: f64| v.atanh())),
            (Box::new(|v: Dual| v.ln_1p()), Box::new(|v: f64| v.ln_1p())),
            (
                Box::new(|v: Dual| v.powf(Dual::constant(2.5))),
                Box::new(|v: f64| v.powf(2.5)),
            ),
            (
                Box::new(|v: Dual| Dual::constant(1.5).atan2(v)),
                Box::new(|v: f64| 1.5_f64.atan2(v)),
            ),
        ];
        for (idx, (dual_fn, float_fn)) in cases.iter().enumerate() {
            let exact = derivative(dual_fn, x);
            let approx = central(float_fn, x);
            assert!(
                (exact - approx).abs() < 1e-6,
                "case {idx}: exact {exact} vs finite difference {approx}"
            );
        }
    }

    #[test]
    fn powf_with_constant_exponent_is_defined_at_zero_base() {
        let d = Dual::variable(0.0).powf(Dual::constant(2.0));
        assert_eq!(d.val, 0.0);
        assert!(d.eps.is_finite());
    }

    struct Product;

    impl<T: Scalar> ScalarFunction<T> for Product {
        fn arity(&self) -> usize {
            3
        }

        fn output_count(&self) -> usize {
            2
        }

        fn apply(&self, x: &[T], out: &mut [T]) {
            out[0] = x[0] * x[1] * x[2];
            out[1] = x[0] + x[2].sin();
        }
    }

    #[test]
    fn differentiable_reports_row_major_jacobian() {
        let model = Differentiable::new(Product);
        assert_eq!(model.arity(), 3);
        assert_eq!(model.output_count(), 2);

        let args = [2.0, 3.0, 0.5];
        let mut out = [0.0; 2];
        model.evaluate(&args, &mut out).expect("evaluation should succeed");
        assert!((out[0] - 3.0).abs() < 1e-15);

        let jacobian = model
            .partials(&args)
            .expect("partials should be provided")
            .expect("partials should compute");
        let expected = [1.5, 1.0, 6.0, 1.0, 0.0, 0.5_f64.cos()];
        for (got, want) in jacobian.iter().zip(expected) {
            assert!((got - want).abs() < 1e-12);
        }
    }
}
