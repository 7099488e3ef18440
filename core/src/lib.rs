//! Particle Gibbs toolbox for linear-Gaussian state-space models
//!
//! This crate implements Bayesian inference over the latent trajectory and the process-noise variance of a
//! state-space model using a blocked Gibbs sampler. The trajectory block is updated with a conditional particle
//! filter with ancestor sampling (a "particle Gibbs" kernel), the noise block with a closed-form Inverse-Gamma
//! update. The output is a chain of sampled trajectories from which posterior means and credible bands can be
//! computed downstream.
//!
//! Built on:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): state vectors, dynamics and observation matrices, covariance factors.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): every random draw,
//!   funneled through one explicitly passed generator so that runs are reproducible from a seed.
//! - [`rayon`](https://crates.io/crates/rayon): per-particle weight evaluation within a filtering pass.
//!
//! ## Crate overview
//!
//! - [error]: the `PgError` taxonomy shared by every component.
//! - [config]: JSON/YAML/TOML readers and writers for configuration structs.
//! - [trajectory]: time-indexed sequences of vectors (latent trajectories and observation sequences).
//! - [initial], [dynamics], [measurements]: the Gaussian prior on the first state, the linear-Gaussian transition
//!   model and the linear-Gaussian observation model.
//! - [population]: the particle arena indexed by (time step, particle).
//! - [resampling]: log-sum-exp normalization, effective sample size and ancestor resampling schemes.
//! - [conditional]: the conditional particle filter with ancestor sampling.
//! - [noise]: the conjugate process-noise variance update.
//! - [gibbs]: the sweep loop, its configuration and the resulting sample chain.
//! - [sim]: synthetic data generation and CSV persistence.
//!
//! ## Model
//!
//! $$
//! x_0 \sim \mathcal{N}(\mu_0, \Sigma_0), \qquad
//! x_{t+1} \mid x_t \sim \mathcal{N}(A x_t, \mathrm{diag}(\sigma^2)), \qquad
//! y_t \mid x_t \sim \mathcal{N}(C x_t, \eta^2 I)
//! $$
//!
//! with an Inverse-Gamma prior $\sigma_d^2 \sim \mathcal{IG}(\alpha_0, \beta_0)$ on every state dimension.
//!
//! ## Sampler
//!
//! One Gibbs sweep draws $x_{0:T-1} \mid y_{0:T-1}, \sigma^2$ with the conditional particle filter, conditioned on the
//! previous sweep's trajectory, and then $\sigma^2 \mid x_{0:T-1}$ in closed form:
//!
//! $$
//! \sigma_d^2 \sim \mathcal{IG}\left(\alpha_0 + \frac{T-1}{2},\ \beta_0 + \frac{1}{2} \sum_{t=0}^{T-2} \left(A x_t - x_{t+1}\right)_d^2\right)
//! $$
//!
//! The components meet at three traits: [InitialDistribution], [TransitionModel] and [ObservationModel]. The
//! filter and the Gibbs sampler are generic over them; the linear-Gaussian implementations in this crate are one
//! instance.
pub mod conditional;
pub mod config;
pub mod dynamics;
pub mod error;
pub mod gibbs;
pub mod initial;
pub mod linalg;
pub mod measurements;
pub mod noise;
pub mod population;
pub mod resampling;
pub mod sim;
pub mod trajectory;

use nalgebra::{DMatrix, DVector, DVectorView};
use rand::Rng;
use rayon::prelude::*;

pub use crate::conditional::ConditionalParticleFilter;
pub use crate::config::ConfigFile;
pub use crate::dynamics::{LinearGaussianDynamics, ProcessNoise};
pub use crate::error::{PgError, Result};
pub use crate::gibbs::{GibbsChain, GibbsConfig, GibbsSampler, PosteriorSummary};
pub use crate::initial::GaussianInitialDistribution;
pub use crate::measurements::LinearGaussianLikelihood;
pub use crate::noise::{InverseGammaPrior, resample_transition_noise};
pub use crate::population::{ParticlePopulation, REFERENCE_SLOT};
pub use crate::resampling::ResamplingStrategy;
pub use crate::trajectory::{ObservationSequence, Trajectory};

/// Distribution of the latent state at time zero.
pub trait InitialDistribution: Sync {
    fn state_dim(&self) -> usize;
    /// Draw one state.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> DVector<f64>;
    fn log_density(&self, state: DVectorView<'_, f64>) -> f64;
    fn density(&self, state: DVectorView<'_, f64>) -> f64 {
        self.log_density(state).exp()
    }
}

/// Proposal for the next latent state given the previous one.
///
/// The proposal owns its process-noise parameters; they are only ever replaced
/// wholesale through [TransitionModel::set_process_noise] or [TransitionModel::set_sigma].
pub trait TransitionModel: Sync {
    fn state_dim(&self) -> usize;
    /// Propagate every free slot of `population` from `t` to `t + 1`.
    ///
    /// Slot `i` at `t + 1` is drawn given the state of slot `ancestors[i]` at `t`. Slots
    /// pinned to a reference trajectory are left untouched.
    fn sample_next<R: Rng + ?Sized>(
        &self,
        population: &mut ParticlePopulation,
        t: usize,
        ancestors: &[usize],
        rng: &mut R,
    ) -> Result<()>;
    /// Noise-free one-step prediction from `states` at each of `time_indices`.
    ///
    /// Column `k` of the result is the predictive mean of the state following
    /// `states[time_indices[k]]`.
    fn predict(&self, states: &Trajectory, time_indices: &[usize]) -> Result<DMatrix<f64>>;
    /// `ln p(next | prev)`
    fn log_transition_density(&self, prev: DVectorView<'_, f64>, next: DVectorView<'_, f64>)
    -> f64;
    fn process_noise(&self) -> &ProcessNoise;
    fn set_process_noise(&mut self, noise: ProcessNoise) -> Result<()>;
    /// Replace the per-dimension noise standard deviation.
    ///
    /// # Errors
    /// `InvalidParameter` for zero, negative or non-finite entries; the previous
    /// noise stays in place.
    fn set_sigma(&mut self, sigma: DVector<f64>) -> Result<()> {
        self.set_process_noise(ProcessNoise::new(sigma)?)
    }
}

/// Observation density used to weight particles.
pub trait ObservationModel: Sync {
    fn state_dim(&self) -> usize;
    fn observation_dim(&self) -> usize;
    /// `ln p(observation | state)`
    fn log_likelihood(&self, state: DVectorView<'_, f64>, observation: DVectorView<'_, f64>)
    -> f64;
    /// Draw a synthetic observation for one particle at `t` and store it in `observations`.
    fn sample<R: Rng + ?Sized>(
        &self,
        population: &ParticlePopulation,
        observations: &mut ObservationSequence,
        t: usize,
        particle: usize,
        rng: &mut R,
    ) -> Result<()>;
    /// Log-density of the observation at `t` for every particle of the population.
    ///
    /// Evaluated on the rayon pool; the output is in particle order.
    fn log_weight(
        &self,
        population: &ParticlePopulation,
        observations: &ObservationSequence,
        t: usize,
    ) -> Vec<f64> {
        let states = population.states_at(t);
        let observation = observations.state(t);
        (0..states.ncols())
            .into_par_iter()
            .map(|i| self.log_likelihood(states.column(i), observation))
            .collect()
    }
}

/// The three model components of a state-space model.
#[derive(Clone, Debug)]
pub struct StateSpaceModel<I, P, L> {
    pub initial: I,
    pub proposal: P,
    pub likelihood: L,
}

impl<I, P, L> StateSpaceModel<I, P, L>
where
    I: InitialDistribution,
    P: TransitionModel,
    L: ObservationModel,
{
    /// Bundle the components after checking that their state dimensions agree.
    pub fn new(initial: I, proposal: P, likelihood: L) -> Result<Self> {
        let dim = initial.state_dim();
        PgError::check_dim("transition model state", dim, proposal.state_dim())?;
        PgError::check_dim("observation model state", dim, likelihood.state_dim())?;
        Ok(StateSpaceModel {
            initial,
            proposal,
            likelihood,
        })
    }
    pub fn state_dim(&self) -> usize {
        self.initial.state_dim()
    }
    pub fn observation_dim(&self) -> usize {
        self.likelihood.observation_dim()
    }
    /// Check an observation sequence against the model.
    pub fn validate_observations(&self, observations: &ObservationSequence) -> Result<()> {
        PgError::check_dim("observation", self.observation_dim(), observations.dim())?;
        if observations.is_empty() {
            return Err(PgError::invalid(
                "observations",
                "at least one time step is required",
            ));
        }
        if !observations.is_finite() {
            return Err(PgError::invalid("observations", "must be finite"));
        }
        Ok(())
    }
}
