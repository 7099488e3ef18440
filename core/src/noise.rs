//! Conjugate update of the process-noise variance.
//!
//! With an Inverse-Gamma prior on each diagonal entry of the process-noise covariance
//! and Gaussian one-step residuals $e_t = (A x_t - x_{t+1})_d$, the posterior is again
//! Inverse-Gamma:
//!
//! $$
//! \sigma_d^2 \mid x \sim \mathcal{IG}\left(\alpha_0 + \frac{T-1}{2},\ \beta_0 + \frac{1}{2}\sum_{t=0}^{T-2} e_t^2\right)
//! $$
//!
//! and is drawn as the reciprocal of a Gamma(shape, 1/scale) variate.
use nalgebra::DVector;
use rand::Rng;
use rand_distr::{Distribution, Gamma};
use serde::{Deserialize, Serialize};

use crate::TransitionModel;
use crate::error::{PgError, Result};
use crate::trajectory::Trajectory;

/// Inverse-Gamma prior shared by every state dimension.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct InverseGammaPrior {
    pub alpha0: f64,
    pub beta0: f64,
}

impl Default for InverseGammaPrior {
    fn default() -> Self {
        InverseGammaPrior {
            alpha0: 0.1,
            beta0: 0.1,
        }
    }
}

impl InverseGammaPrior {
    pub fn new(alpha0: f64, beta0: f64) -> Result<Self> {
        let prior = InverseGammaPrior { alpha0, beta0 };
        prior.validate()?;
        Ok(prior)
    }
    /// Both hyperparameters must be finite and strictly positive.
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha0.is_finite() && self.alpha0 > 0.0) {
            return Err(PgError::invalid(
                "alpha0",
                format!("must be finite and > 0, got {}", self.alpha0),
            ));
        }
        if !(self.beta0.is_finite() && self.beta0 > 0.0) {
            return Err(PgError::invalid(
                "beta0",
                format!("must be finite and > 0, got {}", self.beta0),
            ));
        }
        Ok(())
    }
    /// Posterior (shape, scale) after `count` residuals with squared sum `sum_sq`.
    pub fn posterior(&self, count: usize, sum_sq: f64) -> (f64, f64) {
        (
            self.alpha0 + count as f64 / 2.0,
            self.beta0 + sum_sq / 2.0,
        )
    }
    /// Draw one variance from IG(shape, scale).
    fn draw<R: Rng + ?Sized>(shape: f64, scale: f64, rng: &mut R) -> Result<f64> {
        let gamma = Gamma::new(shape, 1.0 / scale).map_err(|e| {
            PgError::invalid("prior", format!("gamma({shape}, 1/{scale}): {e}"))
        })?;
        Ok(1.0 / gamma.sample(rng))
    }
}

/// Draw a new per-dimension process-noise variance given a latent trajectory.
///
/// The residuals are one-step-ahead prediction errors of `proposal` along
/// `trajectory`; with a single time step there are none and the draw comes from the
/// prior. Neither the proposal nor the trajectory is modified.
///
/// # Errors
/// * `DimensionMismatch` if the trajectory does not match the proposal's state dimension.
/// * `InvalidParameter` for an empty trajectory or an invalid prior.
pub fn resample_transition_noise<P, R>(
    proposal: &P,
    trajectory: &Trajectory,
    prior: &InverseGammaPrior,
    rng: &mut R,
) -> Result<DVector<f64>>
where
    P: TransitionModel,
    R: Rng + ?Sized,
{
    prior.validate()?;
    PgError::check_dim("trajectory state", proposal.state_dim(), trajectory.dim())?;
    if trajectory.is_empty() {
        return Err(PgError::invalid("trajectory", "must have at least one time step"));
    }
    let transitions = trajectory.len() - 1;
    let previous: Vec<usize> = (0..transitions).collect();
    let predicted = proposal.predict(trajectory, &previous)?;
    let observed = trajectory.as_matrix().columns(1, transitions);
    let residuals = predicted - observed;

    let mut variance = DVector::zeros(trajectory.dim());
    for d in 0..trajectory.dim() {
        let sum_sq = residuals.row(d).norm_squared();
        let (shape, scale) = prior.posterior(transitions, sum_sq);
        variance[d] = InverseGammaPrior::draw(shape, scale, rng)?;
    }
    Ok(variance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::{LinearGaussianDynamics, ProcessNoise};
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::DMatrix;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn random_walk() -> LinearGaussianDynamics {
        LinearGaussianDynamics::new(
            DMatrix::identity(2, 2),
            ProcessNoise::isotropic(2, 1.0).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn prior_rejects_non_positive_hyperparameters() {
        assert!(InverseGammaPrior::new(0.0, 0.1).is_err());
        assert!(InverseGammaPrior::new(0.1, -1.0).is_err());
        assert!(InverseGammaPrior::new(0.1, f64::NAN).is_err());
        assert_eq!(InverseGammaPrior::default(), InverseGammaPrior::new(0.1, 0.1).unwrap());
    }

    #[test]
    fn posterior_parameters() {
        let (shape, scale) = InverseGammaPrior::default().posterior(9, 4.0);
        assert_approx_eq!(shape, 4.6, 1e-12);
        assert_approx_eq!(scale, 2.1, 1e-12);
    }

    #[test]
    fn exact_trajectory_concentrates_near_zero() {
        let proposal = random_walk();
        let traj = Trajectory::from_rows(&vec![vec![1.0, -1.0]; 2000]).unwrap();
        let mut rng = StdRng::seed_from_u64(5);
        let var = resample_transition_noise(&proposal, &traj, &InverseGammaPrior::default(), &mut rng)
            .unwrap();
        assert!(var.iter().all(|&v| v > 0.0 && v < 1e-3));
    }

    #[test]
    fn single_step_draws_from_prior() {
        let proposal = random_walk();
        let traj = Trajectory::from_rows(&[vec![0.0, 0.0]]).unwrap();
        let prior = InverseGammaPrior::new(10.0, 9.0).unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        let n = 4000;
        let mean = (0..n)
            .map(|_| resample_transition_noise(&proposal, &traj, &prior, &mut rng).unwrap()[0])
            .sum::<f64>()
            / n as f64;
        // IG mean = beta / (alpha - 1)
        assert_approx_eq!(mean, 1.0, 0.05);
    }

    #[test]
    fn proposal_is_left_untouched() {
        let proposal = random_walk();
        let traj = Trajectory::from_rows(&[vec![0.0, 0.0], vec![3.0, 3.0]]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        resample_transition_noise(&proposal, &traj, &InverseGammaPrior::default(), &mut rng)
            .unwrap();
        assert_eq!(proposal.process_noise().sigma()[0], 1.0);
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let traj = Trajectory::zeros(3, 4);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            resample_transition_noise(&random_walk(), &traj, &InverseGammaPrior::default(), &mut rng),
            Err(PgError::DimensionMismatch { .. })
        ));
    }
}
