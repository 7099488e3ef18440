//! Linear-Gaussian observation model
//!
//! $$
//! y_t = C x_t + v_t, \qquad v_t \sim \mathcal{N}(0, \mathrm{diag}(\eta^2))
//! $$
//!
//! `eta` is a per-observation-dimension standard deviation. Particle weights are
//! computed directly in log form; the density itself is never formed.
use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector, DVectorView};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::ObservationModel;
use crate::error::{PgError, Result};
use crate::population::ParticlePopulation;
use crate::trajectory::ObservationSequence;

#[derive(Clone, Debug)]
pub struct LinearGaussianLikelihood {
    observation_matrix: DMatrix<f64>,
    eta: DVector<f64>,
    /// Σ_o ln η_o + (O/2) ln 2π
    log_normalizer: f64,
}

impl LinearGaussianLikelihood {
    /// # Errors
    /// * `DimensionMismatch` if `eta` does not have one entry per observation row.
    /// * `InvalidParameter` for non-positive or non-finite noise, or a non-finite matrix.
    pub fn new(observation_matrix: DMatrix<f64>, eta: DVector<f64>) -> Result<Self> {
        PgError::check_dim("observation noise", observation_matrix.nrows(), eta.len())?;
        if observation_matrix.nrows() == 0 || observation_matrix.ncols() == 0 {
            return Err(PgError::invalid(
                "observation_matrix",
                "must have at least one row and column",
            ));
        }
        if observation_matrix.iter().any(|v| !v.is_finite()) {
            return Err(PgError::invalid(
                "observation_matrix",
                "matrix entries must be finite",
            ));
        }
        if let Some(bad) = eta.iter().find(|e| !(e.is_finite() && **e > 0.0)) {
            return Err(PgError::invalid(
                "eta",
                format!("observation noise must be finite and > 0, got {bad}"),
            ));
        }
        let log_normalizer =
            eta.iter().map(|e| e.ln()).sum::<f64>() + 0.5 * eta.len() as f64 * (2.0 * PI).ln();
        Ok(LinearGaussianLikelihood {
            observation_matrix,
            eta,
            log_normalizer,
        })
    }
    /// Same noise level on every observation dimension.
    pub fn isotropic(observation_matrix: DMatrix<f64>, eta: f64) -> Result<Self> {
        let rows = observation_matrix.nrows();
        Self::new(observation_matrix, DVector::from_element(rows, eta))
    }
    pub fn observation_matrix(&self) -> &DMatrix<f64> {
        &self.observation_matrix
    }
    pub fn eta(&self) -> &DVector<f64> {
        &self.eta
    }
}

impl ObservationModel for LinearGaussianLikelihood {
    fn state_dim(&self) -> usize {
        self.observation_matrix.ncols()
    }
    fn observation_dim(&self) -> usize {
        self.observation_matrix.nrows()
    }

    fn log_likelihood(
        &self,
        state: DVectorView<'_, f64>,
        observation: DVectorView<'_, f64>,
    ) -> f64 {
        let predicted = &self.observation_matrix * state;
        let quad: f64 = observation
            .iter()
            .zip(predicted.iter())
            .zip(self.eta.iter())
            .map(|((y, m), e)| ((y - m) / e).powi(2))
            .sum();
        -0.5 * quad - self.log_normalizer
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        population: &ParticlePopulation,
        observations: &mut ObservationSequence,
        t: usize,
        particle: usize,
        rng: &mut R,
    ) -> Result<()> {
        PgError::check_dim("observation", self.observation_dim(), observations.dim())?;
        PgError::check_dim("observed state", self.state_dim(), population.state_dim())?;
        if t >= observations.len() || t >= population.num_steps() {
            return Err(PgError::invalid(
                "time_step",
                format!("{t} outside the observation sequence"),
            ));
        }
        if particle >= population.num_particles() {
            return Err(PgError::invalid(
                "particle",
                format!("{particle} outside [0, {})", population.num_particles()),
            ));
        }
        let mean = &self.observation_matrix * population.state(t, particle);
        let noise = DVector::from_fn(self.observation_dim(), |o, _| {
            let z: f64 = StandardNormal.sample(&mut *rng);
            self.eta[o] * z
        });
        observations.set_state(t, &(mean + noise));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::Trajectory;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn identity_model(eta: f64) -> LinearGaussianLikelihood {
        LinearGaussianLikelihood::isotropic(DMatrix::identity(2, 2), eta).unwrap()
    }

    #[test]
    fn log_likelihood_matches_closed_form() {
        let lik = identity_model(0.2);
        let x = DVector::from_vec(vec![1.0, 2.0]);
        let y = DVector::from_vec(vec![1.2, 2.0]);
        let expected = -0.5 * 1.0 - 2.0 * 0.2_f64.ln() - (2.0 * PI).ln();
        assert_approx_eq!(lik.log_likelihood(x.column(0), y.column(0)), expected, 1e-12);
    }

    #[test]
    fn far_observations_stay_finite_in_log_space() {
        let lik = identity_model(0.01);
        let x = DVector::from_vec(vec![0.0, 0.0]);
        let y = DVector::from_vec(vec![50.0, -50.0]);
        let lw = lik.log_likelihood(x.column(0), y.column(0));
        assert!(lw.is_finite());
        assert!(lw < -1e6);
    }

    #[test]
    fn log_weight_covers_every_particle_in_order() {
        let lik = identity_model(0.5);
        let mut pop = ParticlePopulation::new(1, 3, 2).unwrap();
        for i in 0..3 {
            pop.set_state(0, i, &DVector::from_vec(vec![i as f64, 0.0])).unwrap();
        }
        let obs = Trajectory::from_rows(&[vec![0.0, 0.0]]).unwrap();
        let lw = lik.log_weight(&pop, &obs, 0);
        assert_eq!(lw.len(), 3);
        for i in 0..3 {
            assert_approx_eq!(lw[i], lik.log_likelihood(pop.state(0, i), obs.state(0)), 1e-15);
        }
        assert!(lw[0] > lw[1] && lw[1] > lw[2]);
    }

    #[test]
    fn sample_writes_observation_near_state() {
        let lik = identity_model(1e-6);
        let mut pop = ParticlePopulation::new(2, 1, 2).unwrap();
        pop.set_state(1, 0, &DVector::from_vec(vec![3.0, -1.0])).unwrap();
        let mut obs = Trajectory::zeros(2, 2);
        let mut rng = StdRng::seed_from_u64(8);
        lik.sample(&pop, &mut obs, 1, 0, &mut rng).unwrap();
        assert_approx_eq!(obs.state(1)[0], 3.0, 1e-4);
        assert_approx_eq!(obs.state(1)[1], -1.0, 1e-4);
        assert!(lik.sample(&pop, &mut obs, 2, 0, &mut rng).is_err());
        assert!(lik.sample(&pop, &mut obs, 0, 1, &mut rng).is_err());
    }

    #[test]
    fn invalid_noise_is_rejected() {
        assert!(LinearGaussianLikelihood::isotropic(DMatrix::identity(2, 2), 0.0).is_err());
        assert!(matches!(
            LinearGaussianLikelihood::new(DMatrix::identity(2, 2), DVector::from_vec(vec![0.1])),
            Err(PgError::DimensionMismatch { .. })
        ));
    }
}
