//! Particle population arena.
//!
//! States, weights and ancestor indices for every (time step, particle) pair of one
//! filtering pass. Per time step the states are held as a `state_dim × num_particles`
//! matrix (column i is particle i) so that propagation is a single matrix product over
//! the gathered ancestor columns.
//!
//! A population is either *conditioned* on a reference trajectory, in which case
//! [`REFERENCE_SLOT`] holds the reference state at every time step and can never be
//! overwritten, or *unconditioned* (used to simulate data from the model).
use nalgebra::{DMatrix, DVector, DVectorView};

use crate::error::{PgError, Result, WeightStage};
use crate::resampling::{effective_sample_size, normalize_log_weights};
use crate::trajectory::Trajectory;

/// Particle slot that carries the reference trajectory.
pub const REFERENCE_SLOT: usize = 0;

#[derive(Clone, Debug)]
pub struct ParticlePopulation {
    num_steps: usize,
    num_particles: usize,
    state_dim: usize,
    states: Vec<DMatrix<f64>>,
    log_weights: Vec<DVector<f64>>,
    weights: Vec<DVector<f64>>,
    /// `ancestors[t][i]` indexes the population at t-1; identity at t = 0.
    ancestors: Vec<Vec<usize>>,
    pinned: Option<usize>,
}

impl ParticlePopulation {
    /// Unconditioned population of zero states with uniform weights.
    pub fn new(num_steps: usize, num_particles: usize, state_dim: usize) -> Result<Self> {
        if num_steps == 0 {
            return Err(PgError::invalid("num_steps", "must be at least 1"));
        }
        if num_particles == 0 {
            return Err(PgError::invalid("num_particles", "must be at least 1"));
        }
        let uniform = 1.0 / num_particles as f64;
        Ok(ParticlePopulation {
            num_steps,
            num_particles,
            state_dim,
            states: vec![DMatrix::zeros(state_dim, num_particles); num_steps],
            log_weights: vec![DVector::from_element(num_particles, uniform.ln()); num_steps],
            weights: vec![DVector::from_element(num_particles, uniform); num_steps],
            ancestors: vec![(0..num_particles).collect(); num_steps],
            pinned: None,
        })
    }

    /// Population whose [`REFERENCE_SLOT`] is pinned to `reference` at every time step.
    pub fn conditioned(num_particles: usize, reference: &Trajectory) -> Result<Self> {
        if !reference.is_finite() {
            return Err(PgError::invalid(
                "reference",
                "reference trajectory contains non-finite values",
            ));
        }
        let mut population = Self::new(reference.len(), num_particles, reference.dim())?;
        for t in 0..reference.len() {
            population.states[t].set_column(REFERENCE_SLOT, &reference.state(t));
        }
        population.pinned = Some(REFERENCE_SLOT);
        Ok(population)
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }
    pub fn num_particles(&self) -> usize {
        self.num_particles
    }
    pub fn state_dim(&self) -> usize {
        self.state_dim
    }
    pub fn reference_slot(&self) -> Option<usize> {
        self.pinned
    }
    pub fn is_pinned(&self, particle: usize) -> bool {
        self.pinned == Some(particle)
    }
    /// Particle slots that propagation is allowed to write.
    pub fn free_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.num_particles).filter(move |&i| !self.is_pinned(i))
    }

    pub fn states_at(&self, t: usize) -> &DMatrix<f64> {
        &self.states[t]
    }
    pub fn state(&self, t: usize, particle: usize) -> DVectorView<'_, f64> {
        self.states[t].column(particle)
    }
    /// Write one particle state.
    ///
    /// # Errors
    /// * `InvalidParameter` when the slot is pinned to the reference.
    /// * `DimensionMismatch` on a wrongly sized state.
    /// * `NonFiniteState` if any component is NaN or infinite.
    pub fn set_state(&mut self, t: usize, particle: usize, state: &DVector<f64>) -> Result<()> {
        if self.is_pinned(particle) {
            return Err(PgError::invalid(
                "particle",
                format!("slot {particle} is pinned to the reference trajectory"),
            ));
        }
        PgError::check_dim("particle state", self.state_dim, state.len())?;
        if state.iter().any(|v| !v.is_finite()) {
            return Err(PgError::NonFiniteState {
                time_step: t,
                particle,
            });
        }
        self.states[t].set_column(particle, state);
        Ok(())
    }

    pub fn log_weights_at(&self, t: usize) -> &DVector<f64> {
        &self.log_weights[t]
    }
    /// Normalized weights at `t` (sum to one).
    pub fn weights_at(&self, t: usize) -> &DVector<f64> {
        &self.weights[t]
    }
    /// Store raw log-weights at `t` and their log-sum-exp normalization.
    ///
    /// # Errors
    /// `DegenerateWeights` when every log-weight is -inf or any is NaN. The previous
    /// weights are left untouched in that case.
    pub fn set_log_weights(&mut self, t: usize, log_weights: Vec<f64>) -> Result<()> {
        PgError::check_dim("log-weights", self.num_particles, log_weights.len())?;
        let normalized =
            normalize_log_weights(&log_weights).ok_or(PgError::DegenerateWeights {
                time_step: t,
                stage: WeightStage::Reweight,
            })?;
        self.log_weights[t] = DVector::from_vec(log_weights);
        self.weights[t] = DVector::from_vec(normalized);
        Ok(())
    }
    pub fn effective_sample_size(&self, t: usize) -> f64 {
        effective_sample_size(self.weights[t].as_slice())
    }

    pub fn ancestors_at(&self, t: usize) -> &[usize] {
        &self.ancestors[t]
    }
    /// Record the ancestors (indices into t-1) of the particles at `t`.
    pub fn set_ancestors(&mut self, t: usize, ancestors: Vec<usize>) -> Result<()> {
        if t == 0 || t >= self.num_steps {
            return Err(PgError::invalid(
                "time_step",
                format!("ancestors can only be set for 1..{}, got {t}", self.num_steps),
            ));
        }
        PgError::check_dim("ancestor indices", self.num_particles, ancestors.len())?;
        if let Some(&bad) = ancestors.iter().find(|&&a| a >= self.num_particles) {
            return Err(PgError::invalid(
                "ancestor",
                format!("index {bad} outside [0, {})", self.num_particles),
            ));
        }
        self.ancestors[t] = ancestors;
        Ok(())
    }

    /// Particle index at every time step on the lineage ending at `final_particle`.
    pub fn lineage(&self, final_particle: usize) -> Vec<usize> {
        let mut path = vec![0; self.num_steps];
        let mut idx = final_particle;
        for t in (0..self.num_steps).rev() {
            path[t] = idx;
            idx = self.ancestors[t][idx];
        }
        path
    }
    /// Walk ancestor pointers back from `final_particle` at the last time step.
    pub fn trace_lineage(&self, final_particle: usize) -> Trajectory {
        let mut traj = Trajectory::zeros(self.state_dim, self.num_steps);
        for (t, idx) in self.lineage(final_particle).into_iter().enumerate() {
            traj.set_state(t, &self.states[t].column(idx).into_owned());
        }
        traj
    }
}
