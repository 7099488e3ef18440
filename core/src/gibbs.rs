//! Blocked Gibbs sampler over (trajectory, process-noise variance).
//!
//! Each sweep
//!
//! 1. re-initializes the [`ConditionalParticleFilter`] with the current reference
//!    (a zero trajectory on the first sweep unless one is supplied),
//! 2. draws a trajectory with one filtering pass,
//! 3. draws the process-noise variance from its conjugate posterior and pushes
//!    `sqrt(variance)` into the transition model,
//! 4. appends the trajectory to the [`GibbsChain`] and makes it the next reference.
//!
//! Every random draw of a run comes from one `StdRng` seeded from
//! [`GibbsConfig::seed`], so a run is reproducible bit for bit.
use std::sync::atomic::AtomicBool;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::conditional::ConditionalParticleFilter;
use crate::config::ConfigFile;
use crate::error::{PgError, Result};
use crate::noise::{InverseGammaPrior, resample_transition_noise};
use crate::resampling::ResamplingStrategy;
use crate::trajectory::{ObservationSequence, Trajectory};
use crate::{InitialDistribution, ObservationModel, StateSpaceModel, TransitionModel};

fn default_num_particles() -> usize {
    100
}
fn default_num_sweeps() -> usize {
    100
}
fn default_seed() -> u64 {
    42
}

/// Run-level settings of the sampler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GibbsConfig {
    /// Particles per filtering pass, including the reference slot.
    #[serde(default = "default_num_particles")]
    pub num_particles: usize,
    /// Number of sweeps, i.e. trajectories in the chain.
    #[serde(default = "default_num_sweeps")]
    pub num_sweeps: usize,
    #[serde(default)]
    pub resampling: ResamplingStrategy,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Total number of failed sweeps that may be retried over the whole run.
    #[serde(default)]
    pub max_sweep_restarts: usize,
    #[serde(default)]
    pub prior: InverseGammaPrior,
}

impl Default for GibbsConfig {
    fn default() -> Self {
        GibbsConfig {
            num_particles: default_num_particles(),
            num_sweeps: default_num_sweeps(),
            resampling: ResamplingStrategy::default(),
            seed: default_seed(),
            max_sweep_restarts: 0,
            prior: InverseGammaPrior::default(),
        }
    }
}

impl ConfigFile for GibbsConfig {}

impl GibbsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(PgError::invalid("num_particles", "must be at least 1"));
        }
        if self.num_sweeps == 0 {
            return Err(PgError::invalid("num_sweeps", "must be at least 1"));
        }
        self.prior.validate()
    }
}

/// Append-only record of a sampler run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GibbsChain {
    trajectories: Vec<Trajectory>,
    noise_variances: Vec<DVector<f64>>,
    restarts: usize,
    cancelled_at: Option<usize>,
}

impl GibbsChain {
    fn push(&mut self, trajectory: Trajectory, noise_variance: DVector<f64>) {
        self.trajectories.push(trajectory);
        self.noise_variances.push(noise_variance);
    }
    /// Number of completed sweeps.
    pub fn len(&self) -> usize {
        self.trajectories.len()
    }
    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }
    pub fn trajectories(&self) -> &[Trajectory] {
        &self.trajectories
    }
    /// Noise variance drawn at the end of each sweep.
    pub fn noise_variances(&self) -> &[DVector<f64>] {
        &self.noise_variances
    }
    pub fn last(&self) -> Option<&Trajectory> {
        self.trajectories.last()
    }
    /// Sweeps that were retried after a recoverable failure.
    pub fn restarts(&self) -> usize {
        self.restarts
    }
    /// Sweep that was running when the run was cancelled, if it was.
    pub fn cancelled_at(&self) -> Option<usize> {
        self.cancelled_at
    }
    pub fn into_trajectories(self) -> Vec<Trajectory> {
        self.trajectories
    }

    /// Per-time, per-dimension posterior mean and standard deviation over the
    /// sweeps after `burn_in`.
    ///
    /// # Errors
    /// `InvalidParameter` if no sweep remains after the burn-in.
    pub fn summary(&self, burn_in: usize) -> Result<PosteriorSummary> {
        let kept = self.trajectories.get(burn_in..).unwrap_or(&[]);
        let Some(first) = kept.first() else {
            return Err(PgError::invalid(
                "burn_in",
                format!("{burn_in} leaves no samples in a chain of {}", self.len()),
            ));
        };
        let n = kept.len() as f64;
        let mean = kept
            .iter()
            .fold(DMatrix::zeros(first.dim(), first.len()), |acc, s| acc + s.as_matrix())
            / n;
        let variance = kept
            .iter()
            .fold(DMatrix::zeros(first.dim(), first.len()), |acc, s| {
                acc + (s.as_matrix() - &mean).map(|e| e * e)
            })
            / n;
        Ok(PosteriorSummary {
            mean: Trajectory::new(mean),
            std: Trajectory::new(variance.map(f64::sqrt)),
            samples: kept.len(),
        })
    }
}

/// Posterior mean and (population) standard deviation of the latent trajectory.
#[derive(Clone, Debug, PartialEq)]
pub struct PosteriorSummary {
    pub mean: Trajectory,
    pub std: Trajectory,
    /// Sweeps averaged over.
    pub samples: usize,
}

impl PosteriorSummary {
    /// mean - std
    pub fn lower(&self) -> Trajectory {
        Trajectory::new(self.mean.as_matrix() - self.std.as_matrix())
    }
    /// mean + std
    pub fn upper(&self) -> Trajectory {
        Trajectory::new(self.mean.as_matrix() + self.std.as_matrix())
    }
}

pub struct GibbsSampler<I, P, L> {
    model: StateSpaceModel<I, P, L>,
    config: GibbsConfig,
    filter: ConditionalParticleFilter,
    rng: StdRng,
}

impl<I, P, L> GibbsSampler<I, P, L>
where
    I: InitialDistribution,
    P: TransitionModel,
    L: ObservationModel,
{
    /// # Errors
    /// `InvalidParameter` if the configuration does not validate.
    pub fn new(model: StateSpaceModel<I, P, L>, config: GibbsConfig) -> Result<Self> {
        config.validate()?;
        let filter = ConditionalParticleFilter::new(config.num_particles, config.resampling)?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(GibbsSampler {
            model,
            config,
            filter,
            rng,
        })
    }
    pub fn model(&self) -> &StateSpaceModel<I, P, L> {
        &self.model
    }
    pub fn into_model(self) -> StateSpaceModel<I, P, L> {
        self.model
    }
    pub fn config(&self) -> &GibbsConfig {
        &self.config
    }
    /// The filter of the most recent sweep, for inspecting its population.
    pub fn filter(&self) -> &ConditionalParticleFilter {
        &self.filter
    }

    /// Run all sweeps starting from a zero reference trajectory.
    pub fn run(&mut self, observations: &ObservationSequence) -> Result<GibbsChain> {
        let reference = Trajectory::zeros(self.model.state_dim(), observations.len());
        self.run_sweeps(observations, reference, None)
    }

    /// Run all sweeps starting from `reference`.
    pub fn run_from(
        &mut self,
        observations: &ObservationSequence,
        reference: Trajectory,
    ) -> Result<GibbsChain> {
        self.run_sweeps(observations, reference, None)
    }

    /// Run until finished or until `cancel` is set.
    ///
    /// A cancelled run returns the sweeps completed so far; the interrupted sweep is
    /// discarded and recorded in [`GibbsChain::cancelled_at`].
    pub fn run_cancellable(
        &mut self,
        observations: &ObservationSequence,
        cancel: &AtomicBool,
    ) -> Result<GibbsChain> {
        let reference = Trajectory::zeros(self.model.state_dim(), observations.len());
        self.run_sweeps(observations, reference, Some(cancel))
    }

    fn run_sweeps(
        &mut self,
        observations: &ObservationSequence,
        mut reference: Trajectory,
        cancel: Option<&AtomicBool>,
    ) -> Result<GibbsChain> {
        self.model.validate_observations(observations)?;
        info!(
            "particle Gibbs: {} sweeps, {} particles, {} steps, {:?} resampling, seed {}",
            self.config.num_sweeps,
            self.config.num_particles,
            observations.len(),
            self.config.resampling,
            self.config.seed
        );
        let mut chain = GibbsChain::default();
        let mut restarts_left = self.config.max_sweep_restarts;
        let mut sweep = 0;
        while sweep < self.config.num_sweeps {
            match self.sweep(observations, &reference, cancel) {
                Ok((trajectory, variance)) => {
                    debug!("sweep {sweep}: noise variance {:?}", variance.as_slice());
                    reference = trajectory.clone();
                    chain.push(trajectory, variance);
                    sweep += 1;
                }
                Err(PgError::Cancelled { time_step }) => {
                    info!("cancelled during sweep {sweep} at time step {time_step}");
                    chain.cancelled_at = Some(sweep);
                    break;
                }
                Err(e) if e.is_recoverable() && restarts_left > 0 => {
                    restarts_left -= 1;
                    chain.restarts += 1;
                    warn!("sweep {sweep} failed ({e}); restarting, {restarts_left} restarts left");
                }
                Err(e) => {
                    return Err(PgError::SweepFailed {
                        sweep,
                        source: Box::new(e),
                    });
                }
            }
        }
        info!(
            "particle Gibbs finished: {} sweeps, {} restarts, final sigma {:?}",
            chain.len(),
            chain.restarts,
            self.model.proposal.process_noise().sigma().as_slice()
        );
        Ok(chain)
    }

    /// One filter pass followed by one noise update.
    fn sweep(
        &mut self,
        observations: &ObservationSequence,
        reference: &Trajectory,
        cancel: Option<&AtomicBool>,
    ) -> Result<(Trajectory, DVector<f64>)> {
        self.filter.initialize(&self.model, observations, reference)?;
        let trajectory = match cancel {
            Some(flag) => {
                self.filter
                    .sample_cancellable(&self.model, observations, &mut self.rng, flag)?
            }
            None => self.filter.sample(&self.model, observations, &mut self.rng)?,
        };
        let variance = resample_transition_noise(
            &self.model.proposal,
            &trajectory,
            &self.config.prior,
            &mut self.rng,
        )?;
        self.model.proposal.set_sigma(variance.map(f64::sqrt))?;
        Ok((trajectory, variance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::{LinearGaussianDynamics, ProcessNoise};
    use crate::initial::GaussianInitialDistribution;
    use crate::measurements::LinearGaussianLikelihood;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    fn model()
    -> StateSpaceModel<GaussianInitialDistribution, LinearGaussianDynamics, LinearGaussianLikelihood>
    {
        let noise = ProcessNoise::isotropic(2, 0.1).unwrap();
        StateSpaceModel::new(
            GaussianInitialDistribution::isotropic(DVector::from_element(2, 1.0), 1.0).unwrap(),
            LinearGaussianDynamics::rotational(PI / 12.0, 0.01, noise).unwrap(),
            LinearGaussianLikelihood::isotropic(DMatrix::identity(2, 2), 0.2).unwrap(),
        )
        .unwrap()
    }

    fn observations(len: usize) -> Trajectory {
        let rows: Vec<Vec<f64>> = (0..len)
            .map(|t| {
                let a = t as f64 * PI / 12.0;
                vec![a.cos(), a.sin()]
            })
            .collect();
        Trajectory::from_rows(&rows).unwrap()
    }

    fn small_config() -> GibbsConfig {
        GibbsConfig {
            num_particles: 20,
            num_sweeps: 5,
            ..GibbsConfig::default()
        }
    }

    #[test]
    fn config_defaults_and_validation() {
        let cfg = GibbsConfig::default();
        assert_eq!(cfg.num_particles, 100);
        assert_eq!(cfg.num_sweeps, 100);
        assert_eq!(cfg.seed, 42);
        assert_eq!(cfg.resampling, ResamplingStrategy::Systematic);
        assert!(cfg.validate().is_ok());
        let bad = GibbsConfig {
            num_sweeps: 0,
            ..GibbsConfig::default()
        };
        assert!(GibbsSampler::new(model(), bad).is_err());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: GibbsConfig =
            serde_json::from_str(r#"{"num_particles": 7, "resampling": "residual"}"#).unwrap();
        assert_eq!(cfg.num_particles, 7);
        assert_eq!(cfg.resampling, ResamplingStrategy::Residual);
        assert_eq!(cfg.num_sweeps, 100);
        assert_eq!(cfg.prior, InverseGammaPrior::default());
    }

    #[test]
    fn config_file_roundtrip() {
        let cfg = GibbsConfig {
            num_particles: 33,
            max_sweep_restarts: 2,
            resampling: ResamplingStrategy::Stratified,
            ..GibbsConfig::default()
        };
        for ext in ["json", "yaml", "toml"] {
            let path = std::env::temp_dir().join(format!("pgibbs_config_roundtrip.{ext}"));
            cfg.to_file(&path).unwrap();
            let loaded = GibbsConfig::from_file(&path).unwrap();
            assert_eq!(loaded, cfg, "{ext}");
        }
        let bad = std::env::temp_dir().join("pgibbs_config.ini");
        assert!(cfg.to_file(&bad).is_err());
    }

    #[test]
    fn run_fills_chain_and_updates_noise() {
        let obs = observations(20);
        let mut sampler = GibbsSampler::new(model(), small_config()).unwrap();
        let chain = sampler.run(&obs).unwrap();
        assert_eq!(chain.len(), 5);
        assert_eq!(chain.noise_variances().len(), 5);
        assert_eq!(chain.restarts(), 0);
        assert!(chain.cancelled_at().is_none());
        for traj in chain.trajectories() {
            assert_eq!(traj.len(), 20);
            assert!(traj.is_finite());
        }
        let last_var = chain.noise_variances().last().unwrap();
        let sigma = sampler.model().proposal.process_noise().sigma();
        for d in 0..2 {
            assert!(last_var[d] > 0.0);
            assert_approx_eq!(sigma[d] * sigma[d], last_var[d], 1e-12);
        }
    }

    #[test]
    fn reference_is_carried_between_sweeps() {
        let obs = observations(15);
        let mut sampler = GibbsSampler::new(model(), small_config()).unwrap();
        let chain = sampler.run(&obs).unwrap();
        let pop = sampler.filter().population().unwrap();
        let previous = &chain.trajectories()[chain.len() - 2];
        for t in 0..15 {
            assert_eq!(pop.state(t, crate::REFERENCE_SLOT), previous.state(t));
        }
    }

    #[test]
    fn cancelled_run_returns_completed_sweeps() {
        let obs = observations(10);
        let mut sampler = GibbsSampler::new(model(), small_config()).unwrap();
        let cancel = AtomicBool::new(true);
        let chain = sampler.run_cancellable(&obs, &cancel).unwrap();
        assert!(chain.is_empty());
        assert_eq!(chain.cancelled_at(), Some(0));
    }

    #[test]
    fn summary_uses_population_std() {
        let chain = GibbsChain {
            trajectories: vec![
                Trajectory::from_rows(&[vec![100.0]]).unwrap(),
                Trajectory::from_rows(&[vec![1.0]]).unwrap(),
                Trajectory::from_rows(&[vec![3.0]]).unwrap(),
            ],
            noise_variances: vec![DVector::from_element(1, 1.0); 3],
            restarts: 0,
            cancelled_at: None,
        };
        let summary = chain.summary(1).unwrap();
        assert_eq!(summary.samples, 2);
        assert_approx_eq!(summary.mean.state(0)[0], 2.0, 1e-12);
        assert_approx_eq!(summary.std.state(0)[0], 1.0, 1e-12);
        let lower = summary.lower();
        let upper = summary.upper();
        assert_approx_eq!(lower.state(0)[0], 1.0, 1e-12);
        assert_approx_eq!(upper.state(0)[0], 3.0, 1e-12);
        assert!(chain.summary(3).is_err());
    }
}
