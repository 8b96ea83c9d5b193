//! Statistical helpers shared by the propagators.

use crate::error::ConfigurationError;
use nalgebra::{DMatrix, SymmetricEigen};
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::function::erf;
use std::f64::consts::SQRT_2;

/// Streaming mean and variance (Welford). Two accumulators can be merged,
/// which is what makes the shard reduction independent of thread count.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WelfordAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
}

impl WelfordAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Chan et al. pairwise combination.
    pub fn merge(&mut self, other: &WelfordAccumulator) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let total = self.count + other.count;
        let delta = other.mean - self.mean;
        let n_a = self.count as f64;
        let n_b = other.count as f64;
        let n = total as f64;
        self.mean += delta * n_b / n;
        self.m2 += other.m2 + delta * delta * n_a * n_b / n;
        self.count = total;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Unbiased sample variance; zero with fewer than two samples.
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Quantile of already sorted data using linear interpolation between
/// order statistics (Hyndman-Fan type 7).
pub fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let q = q.clamp(0.0, 1.0);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// The narrowest window of sorted data holding at least `probability` of
/// the samples.
pub fn shortest_interval(sorted: &[f64], probability: f64) -> (f64, f64) {
    let n = sorted.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let width = ((probability * n as f64).ceil() as usize).clamp(1, n);
    let mut best = (sorted[0], sorted[width - 1]);
    for start in 1..=(n - width) {
        let lo = sorted[start];
        let hi = sorted[start + width - 1];
        if hi - lo < best.1 - best.0 {
            best = (lo, hi);
        }
    }
    best
}

/// Standard normal CDF.
pub fn standard_normal_cdf(z: f64) -> f64 {
    0.5 * erf::erfc(-z / SQRT_2)
}

/// Standard normal quantile.
pub fn standard_normal_quantile(p: f64) -> f64 {
    SQRT_2 * erf::erf_inv(2.0 * p - 1.0)
}

/// Student-t quantiles above this dof equal the normal ones to about 1e-6.
/// statrs' inverse CDF does not terminate near 1e9.
const NORMAL_DOF_CUTOFF: f64 = 1e6;

/// Two-sided coverage factor for `confidence` with `dof` degrees of freedom.
/// Very large or infinite dof fall back to the normal quantile.
pub fn coverage_factor(confidence: f64, dof: f64) -> f64 {
    let p = (1.0 + confidence) / 2.0;
    if dof > NORMAL_DOF_CUTOFF {
        return standard_normal_quantile(p);
    }
    match StudentsT::new(0.0, 1.0, dof) {
        Ok(dist) => dist.inverse_cdf(p),
        Err(_) => standard_normal_quantile(p),
    }
}

/// Welch-Satterthwaite effective degrees of freedom from the per-input
/// contributions `(c_i u_i)` and their dof. Infinite when every input has
/// infinite dof or the combined variance vanishes.
pub fn welch_satterthwaite(contributions: &[(f64, f64)], combined_u: f64) -> f64 {
    let denom: f64 = contributions
        .iter()
        .filter(|(_, dof)| dof.is_finite())
        .map(|(cu, dof)| cu.powi(4) / dof)
        .sum();
    if denom <= 0.0 || combined_u == 0.0 {
        f64::INFINITY
    } else {
        combined_u.powi(4) / denom
    }
}

/// Lower-triangular factor `L` with `L Lᵀ = a` for a positive semi-definite
/// matrix. Zero pivots are tolerated (their column is left at zero) so that
/// perfectly correlated inputs can still be sampled.
pub fn psd_cholesky(a: &DMatrix<f64>) -> Result<DMatrix<f64>, ConfigurationError> {
    const PIVOT_TOL: f64 = 1e-12;
    let n = a.nrows();
    let mut l = DMatrix::<f64>::zeros(n, n);
    for j in 0..n {
        let mut diag = a[(j, j)];
        for k in 0..j {
            diag -= l[(j, k)] * l[(j, k)];
        }
        if diag < -1e-9 {
            return Err(ConfigurationError::CorrelationNotPositiveDefinite);
        }
        if diag <= PIVOT_TOL {
            // Column must be consistent with a zero pivot.
            for i in (j + 1)..n {
                let mut off = a[(i, j)];
                for k in 0..j {
                    off -= l[(i, k)] * l[(j, k)];
                }
                if off.abs() > 1e-8 {
                    return Err(ConfigurationError::CorrelationNotPositiveDefinite);
                }
            }
            continue;
        }
        let d = diag.sqrt();
        l[(j, j)] = d;
        for i in (j + 1)..n {
            let mut off = a[(i, j)];
            for k in 0..j {
                off -= l[(i, k)] * l[(j, k)];
            }
            l[(i, j)] = off / d;
        }
    }
    Ok(l)
}

/// True when the smallest eigenvalue of the symmetric matrix is not
/// meaningfully negative.
pub fn is_positive_semidefinite(a: &DMatrix<f64>) -> bool {
    if a.nrows() == 0 {
        return true;
    }
    let eigen = SymmetricEigen::new(a.clone());
    eigen.eigenvalues.iter().all(|&v| v >= -1e-10)
}

/// Normalises a covariance matrix to a correlation matrix. Rows with zero
/// variance get a unit diagonal and zero off-diagonals.
pub fn covariance_to_correlation(cov: &DMatrix<f64>) -> DMatrix<f64> {
    let n = cov.nrows();
    DMatrix::from_fn(n, n, |i, j| {
        if i == j {
            return 1.0;
        }
        let denom = (cov[(i, i)] * cov[(j, j)]).sqrt();
        if denom > 0.0 {
            (cov[(i, j)] / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    })
}

/// Pearson correlation matrix of column-wise series (`columns[k]` is the
/// sample sequence of variable k).
pub fn sample_correlation(columns: &[Vec<f64>]) -> DMatrix<f64> {
    let n = columns.len();
    let means: Vec<f64> = columns
        .iter()
        .map(|c| c.iter().sum::<f64>() / c.len().max(1) as f64)
        .collect();
    let mut cov = DMatrix::<f64>::zeros(n, n);
    for i in 0..n {
        for j in i..n {
            let s: f64 = columns[i]
                .iter()
                .zip(&columns[j])
                .map(|(a, b)| (a - means[i]) * (b - means[j]))
                .sum();
            cov[(i, j)] = s;
            cov[(j, i)] = s;
        }
    }
    covariance_to_correlation(&cov)
}

/// Least-squares slope of `y` on `x`. NaN when `x` has no spread.
pub fn least_squares_slope(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return f64::NAN;
    }
    let mx = x[..n].iter().sum::<f64>() / n as f64;
    let my = y[..n].iter().sum::<f64>() / n as f64;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (a, b) in x[..n].iter().zip(&y[..n]) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx) * (a - mx);
    }
    if sxx == 0.0 {
        f64::NAN
    } else {
        sxy / sxx
    }
}
