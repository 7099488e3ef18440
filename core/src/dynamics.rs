//! Linear-Gaussian transition model
//!
//! $$
//! x_{t+1} = A x_t + w_t, \qquad w_t \sim \mathcal{N}(0, \mathrm{diag}(\sigma^2))
//! $$
//!
//! The dynamics matrix is fixed for the life of the model. The per-dimension noise
//! standard deviation is carried by [`ProcessNoise`] and is the only part the Gibbs
//! sampler changes between sweeps.
use std::f64::consts::PI;

use nalgebra::{DMatrix, DVector, DVectorView};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::TransitionModel;
use crate::error::{PgError, Result};
use crate::population::ParticlePopulation;
use crate::trajectory::Trajectory;

/// Diagonal process noise, stored as per-dimension standard deviations.
#[derive(Clone, Debug, PartialEq)]
pub struct ProcessNoise {
    sigma: DVector<f64>,
}

impl ProcessNoise {
    /// # Errors
    /// `InvalidParameter` unless every standard deviation is finite and strictly positive.
    pub fn new(sigma: DVector<f64>) -> Result<Self> {
        if sigma.is_empty() {
            return Err(PgError::invalid("sigma", "must have at least one dimension"));
        }
        if let Some(bad) = sigma.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(PgError::invalid(
                "sigma",
                format!("standard deviations must be finite and > 0, got {bad}"),
            ));
        }
        Ok(ProcessNoise { sigma })
    }
    pub fn isotropic(dim: usize, sigma: f64) -> Result<Self> {
        Self::new(DVector::from_element(dim, sigma))
    }
    /// From per-dimension variances (σ = √var).
    pub fn from_variance(variance: &DVector<f64>) -> Result<Self> {
        Self::new(variance.map(f64::sqrt))
    }
    pub fn dim(&self) -> usize {
        self.sigma.len()
    }
    pub fn sigma(&self) -> &DVector<f64> {
        &self.sigma
    }
    pub fn variance(&self) -> DVector<f64> {
        self.sigma.map(|s| s * s)
    }
    /// ln N(residual | 0, diag(σ²))
    fn log_density(&self, residual: impl Iterator<Item = f64>) -> f64 {
        let half_log_two_pi = 0.5 * (2.0 * PI).ln();
        residual
            .zip(self.sigma.iter())
            .map(|(r, s)| {
                let z = r / s;
                -0.5 * z * z - s.ln() - half_log_two_pi
            })
            .sum()
    }
}

#[derive(Clone, Debug)]
pub struct LinearGaussianDynamics {
    dynamics: DMatrix<f64>,
    noise: ProcessNoise,
}

impl LinearGaussianDynamics {
    /// # Errors
    /// `DimensionMismatch` when `dynamics` is not square or does not match the noise
    /// dimension, `InvalidParameter` for non-finite entries.
    pub fn new(dynamics: DMatrix<f64>, noise: ProcessNoise) -> Result<Self> {
        PgError::check_dim("dynamics matrix columns", dynamics.nrows(), dynamics.ncols())?;
        PgError::check_dim("process noise", dynamics.nrows(), noise.dim())?;
        if dynamics.iter().any(|v| !v.is_finite()) {
            return Err(PgError::invalid("dynamics", "matrix entries must be finite"));
        }
        Ok(LinearGaussianDynamics { dynamics, noise })
    }
    /// Planar rotation by `angle` plus `offset · I`, the demo dynamics.
    pub fn rotational(angle: f64, offset: f64, noise: ProcessNoise) -> Result<Self> {
        let (sin, cos) = angle.sin_cos();
        let dynamics = DMatrix::from_row_slice(2, 2, &[cos, -sin, sin, cos])
            + DMatrix::identity(2, 2) * offset;
        Self::new(dynamics, noise)
    }
    pub fn dynamics(&self) -> &DMatrix<f64> {
        &self.dynamics
    }
}

impl TransitionModel for LinearGaussianDynamics {
    fn state_dim(&self) -> usize {
        self.dynamics.nrows()
    }

    fn sample_next<R: Rng + ?Sized>(
        &self,
        population: &mut ParticlePopulation,
        t: usize,
        ancestors: &[usize],
        rng: &mut R,
    ) -> Result<()> {
        let n = population.num_particles();
        let dim = self.state_dim();
        PgError::check_dim("propagated state", dim, population.state_dim())?;
        PgError::check_dim("ancestor indices", n, ancestors.len())?;
        if t + 1 >= population.num_steps() {
            return Err(PgError::invalid(
                "time_step",
                format!("cannot propagate past the last step ({t} + 1)"),
            ));
        }
        if let Some(&bad) = ancestors.iter().find(|&&a| a >= n) {
            return Err(PgError::invalid(
                "ancestor",
                format!("index {bad} outside [0, {n})"),
            ));
        }
        let free: Vec<usize> = population.free_slots().collect();
        let previous = population.states_at(t);
        let gathered = DMatrix::from_fn(dim, free.len(), |d, k| previous[(d, ancestors[free[k]])]);
        let means = &self.dynamics * gathered;
        for (k, &i) in free.iter().enumerate() {
            let noise = DVector::from_fn(dim, |d, _| {
                let z: f64 = StandardNormal.sample(&mut *rng);
                self.noise.sigma[d] * z
            });
            population.set_state(t + 1, i, &(means.column(k) + noise))?;
        }
        Ok(())
    }

    fn predict(&self, states: &Trajectory, time_indices: &[usize]) -> Result<DMatrix<f64>> {
        PgError::check_dim("predicted state", self.state_dim(), states.dim())?;
        if let Some(&bad) = time_indices.iter().find(|&&t| t >= states.len()) {
            return Err(PgError::invalid(
                "time_indices",
                format!("index {bad} outside trajectory of length {}", states.len()),
            ));
        }
        let selected = DMatrix::from_fn(self.state_dim(), time_indices.len(), |d, k| {
            states.as_matrix()[(d, time_indices[k])]
        });
        Ok(&self.dynamics * selected)
    }

    fn log_transition_density(
        &self,
        prev: DVectorView<'_, f64>,
        next: DVectorView<'_, f64>,
    ) -> f64 {
        let mean = &self.dynamics * prev;
        self.noise
            .log_density(next.iter().zip(mean.iter()).map(|(x, m)| x - m))
    }

    fn process_noise(&self) -> &ProcessNoise {
        &self.noise
    }

    fn set_process_noise(&mut self, noise: ProcessNoise) -> Result<()> {
        PgError::check_dim("process noise", self.state_dim(), noise.dim())?;
        self.noise = noise;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::f64::consts::PI;

    fn model(sigma: f64) -> LinearGaussianDynamics {
        let noise = ProcessNoise::isotropic(2, sigma).unwrap();
        LinearGaussianDynamics::rotational(PI / 12.0, 0.01, noise).unwrap()
    }

    #[test]
    fn process_noise_rejects_non_positive_sigma() {
        for bad in [0.0, -0.1, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                ProcessNoise::new(DVector::from_vec(vec![0.1, bad])),
                Err(PgError::InvalidParameter { .. })
            ));
        }
        let noise = ProcessNoise::from_variance(&DVector::from_vec(vec![0.04, 0.09])).unwrap();
        assert_approx_eq!(noise.sigma()[0], 0.2, 1e-12);
        assert_approx_eq!(noise.variance()[1], 0.09, 1e-12);
    }

    #[test]
    fn set_sigma_keeps_previous_noise_on_error() {
        let mut dyn_model = model(0.1);
        assert!(dyn_model.set_sigma(DVector::from_vec(vec![0.0, 0.1])).is_err());
        assert_eq!(dyn_model.process_noise().sigma()[0], 0.1);
        assert!(matches!(
            dyn_model.set_sigma(DVector::from_vec(vec![0.1, 0.1, 0.1])),
            Err(PgError::DimensionMismatch { .. })
        ));
        dyn_model.set_sigma(DVector::from_vec(vec![0.3, 0.4])).unwrap();
        assert_eq!(dyn_model.process_noise().sigma()[1], 0.4);
    }

    #[test]
    fn predict_applies_dynamics_without_noise() {
        let dyn_model = model(0.1);
        let traj = Trajectory::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let pred = dyn_model.predict(&traj, &[0, 1]).unwrap();
        let (sin, cos) = (PI / 12.0).sin_cos();
        assert_approx_eq!(pred[(0, 0)], cos + 0.01, 1e-12);
        assert_approx_eq!(pred[(1, 0)], sin, 1e-12);
        assert_approx_eq!(pred[(0, 1)], -sin, 1e-12);
        assert!(dyn_model.predict(&traj, &[2]).is_err());
    }

    #[test]
    fn sample_next_follows_ancestors_and_skips_pinned_slot() {
        let dyn_model = model(1e-9);
        let reference = Trajectory::from_rows(&[vec![5.0, 5.0], vec![7.0, 7.0]]).unwrap();
        let mut pop = ParticlePopulation::conditioned(3, &reference).unwrap();
        pop.set_state(0, 1, &DVector::from_vec(vec![1.0, 0.0])).unwrap();
        pop.set_state(0, 2, &DVector::from_vec(vec![0.0, 1.0])).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        dyn_model.sample_next(&mut pop, 0, &[1, 2, 1], &mut rng).unwrap();
        // pinned slot keeps the reference
        assert_eq!(pop.state(1, 0)[0], 7.0);
        let expected_1 = dyn_model.dynamics() * DVector::from_vec(vec![0.0, 1.0]);
        let expected_2 = dyn_model.dynamics() * DVector::from_vec(vec![1.0, 0.0]);
        assert_approx_eq!(pop.state(1, 1)[0], expected_1[0], 1e-6);
        assert_approx_eq!(pop.state(1, 2)[1], expected_2[1], 1e-6);
    }

    #[test]
    fn sample_next_validates_inputs() {
        let dyn_model = model(0.1);
        let mut pop = ParticlePopulation::new(2, 2, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(dyn_model.sample_next(&mut pop, 1, &[0, 1], &mut rng).is_err());
        assert!(dyn_model.sample_next(&mut pop, 0, &[0, 2], &mut rng).is_err());
        assert!(dyn_model.sample_next(&mut pop, 0, &[0], &mut rng).is_err());
    }

    #[test]
    fn propagated_noise_has_configured_spread() {
        let dyn_model = model(0.5);
        let n = 5000;
        let mut pop = ParticlePopulation::new(2, n, 2).unwrap();
        let ancestors = vec![0; n];
        let mut rng = StdRng::seed_from_u64(21);
        dyn_model.sample_next(&mut pop, 0, &ancestors, &mut rng).unwrap();
        let xs: Vec<f64> = (0..n).map(|i| pop.state(1, i)[0]).collect();
        let mean = xs.iter().sum::<f64>() / n as f64;
        let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert_approx_eq!(mean, 0.0, 0.05);
        assert_approx_eq!(var.sqrt(), 0.5, 0.03);
    }

    #[test]
    fn transition_density_peaks_at_prediction() {
        let dyn_model = model(0.1);
        let prev = DVector::from_vec(vec![1.0, 2.0]);
        let mean = dyn_model.dynamics() * &prev;
        let at_mean = dyn_model.log_transition_density(prev.column(0), mean.column(0));
        let expected = -2.0 * (0.1_f64.ln() + 0.5 * (2.0 * PI).ln());
        assert_approx_eq!(at_mean, expected, 1e-12);
        let shifted = &mean + DVector::from_vec(vec![0.1, 0.0]);
        let off = dyn_model.log_transition_density(prev.column(0), shifted.column(0));
        assert_approx_eq!(at_mean - off, 0.5, 1e-9);
    }
}
