//! Linear algebra helpers for Gaussian covariance handling.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn cholesky_factor(cov: &DMatrix<f64>) -> Option<DMatrix<f64>>
//!     pub fn gaussian_log_normalizer(chol: &DMatrix<f64>) -> f64
//!     pub fn mahalanobis_squared(chol: &DMatrix<f64>, residual: &DVector<f64>) -> f64
//!
//! Strategy for the factor:
//! 1) Symmetrize P ← 0.5 (P + Pᵀ)
//! 2) Cholesky
//! 3) Jittered Cholesky (geometric ramp, bounded)
use std::f64::consts::PI;

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector};

const INITIAL_JITTER: f64 = 1e-12;
const MAX_JITTER: f64 = 1e-8;

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Lower-triangular L with `cov ≈ L Lᵀ`.
///
/// Round-off asymmetry is removed first. If plain Cholesky fails, a diagonal jitter
/// is ramped geometrically up to a small bound; a matrix that still fails is not
/// positive definite and `None` is returned.
pub fn cholesky_factor(cov: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    if !cov.is_square() || cov.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let p = symmetrize(cov);
    if let Some(ch) = Cholesky::new(p.clone()) {
        return Some(ch.l());
    }
    let n = p.nrows();
    let mut jitter = INITIAL_JITTER;
    while jitter <= MAX_JITTER {
        let mut pj = p.clone();
        for i in 0..n {
            pj[(i, i)] += jitter;
        }
        if let Some(ch) = Cholesky::new(pj) {
            return Some(ch.l());
        }
        jitter *= 10.0;
    }
    None
}

/// log of the multivariate normal normalizing constant, -½ (n ln 2π + ln |Σ|),
/// from the Cholesky factor of Σ.
pub fn gaussian_log_normalizer(chol: &DMatrix<f64>) -> f64 {
    let n = chol.nrows() as f64;
    let half_log_det: f64 = chol.diagonal().iter().map(|l| l.ln()).sum();
    -0.5 * n * (2.0 * PI).ln() - half_log_det
}

/// rᵀ Σ⁻¹ r using the Cholesky factor of Σ (one triangular solve).
pub fn mahalanobis_squared(chol: &DMatrix<f64>, residual: &DVector<f64>) -> f64 {
    match chol.solve_lower_triangular(residual) {
        Some(z) => z.norm_squared(),
        None => f64::INFINITY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn factor_reconstructs_covariance() {
        let cov = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let l = cholesky_factor(&cov).unwrap();
        let back = &l * l.transpose();
        for (a, b) in back.iter().zip(cov.iter()) {
            assert_approx_eq!(a, b, 1e-12);
        }
    }

    #[test]
    fn indefinite_matrix_has_no_factor() {
        let cov = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, -1.0]);
        assert!(cholesky_factor(&cov).is_none());
    }

    #[test]
    fn non_square_matrix_has_no_factor() {
        assert!(cholesky_factor(&DMatrix::zeros(2, 3)).is_none());
    }

    #[test]
    fn identity_normalizer_and_distance() {
        let l = cholesky_factor(&DMatrix::identity(2, 2)).unwrap();
        assert_approx_eq!(gaussian_log_normalizer(&l), -(2.0 * PI).ln(), 1e-12);
        let r = DVector::from_vec(vec![3.0, 4.0]);
        assert_approx_eq!(mahalanobis_squared(&l, &r), 25.0, 1e-12);
    }

    #[test]
    fn symmetrize_removes_asymmetry() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 1.0]);
        let s = symmetrize(&m);
        assert_eq!(s[(0, 1)], 1.0);
        assert_eq!(s[(1, 0)], 1.0);
    }
}
