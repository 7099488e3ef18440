//! Gaussian prior over the state at time zero.
use nalgebra::{DMatrix, DVector, DVectorView};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::InitialDistribution;
use crate::error::{PgError, Result};
use crate::linalg::{cholesky_factor, gaussian_log_normalizer, mahalanobis_squared};

/// `x_0 ~ Normal(mean, covariance)`
#[derive(Clone, Debug)]
pub struct GaussianInitialDistribution {
    mean: DVector<f64>,
    covariance: DMatrix<f64>,
    chol: DMatrix<f64>,
    log_normalizer: f64,
}

impl GaussianInitialDistribution {
    /// # Errors
    /// * `DimensionMismatch` if the covariance is not `dim × dim`.
    /// * `InvalidParameter` if the mean is not finite or the covariance is not
    ///   symmetric positive definite.
    pub fn new(mean: DVector<f64>, covariance: DMatrix<f64>) -> Result<Self> {
        let dim = mean.len();
        if dim == 0 {
            return Err(PgError::invalid("mean", "state dimension must be at least 1"));
        }
        PgError::check_dim("initial covariance rows", dim, covariance.nrows())?;
        PgError::check_dim("initial covariance columns", dim, covariance.ncols())?;
        if mean.iter().any(|v| !v.is_finite()) {
            return Err(PgError::invalid("mean", "must be finite"));
        }
        let chol = cholesky_factor(&covariance).ok_or_else(|| {
            PgError::invalid("covariance", "must be symmetric positive definite")
        })?;
        let log_normalizer = gaussian_log_normalizer(&chol);
        Ok(GaussianInitialDistribution {
            mean,
            covariance,
            chol,
            log_normalizer,
        })
    }
    /// Independent components with a shared variance.
    pub fn isotropic(mean: DVector<f64>, variance: f64) -> Result<Self> {
        let dim = mean.len();
        Self::new(mean, DMatrix::identity(dim, dim) * variance)
    }
    pub fn mean(&self) -> &DVector<f64> {
        &self.mean
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
}

impl InitialDistribution for GaussianInitialDistribution {
    fn state_dim(&self) -> usize {
        self.mean.len()
    }
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64> {
        let z: DVector<f64> =
            DVector::from_fn(self.mean.len(), |_, _| StandardNormal.sample(&mut *rng));
        &self.mean + &self.chol * z
    }
    fn log_density(&self, state: DVectorView<'_, f64>) -> f64 {
        if state.len() != self.mean.len() {
            return f64::NEG_INFINITY;
        }
        let residual = state - &self.mean;
        self.log_normalizer - 0.5 * mahalanobis_squared(&self.chol, &residual)
    }
}
