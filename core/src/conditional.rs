//! Conditional particle filter with ancestor sampling
//!
//! One pass of the filter draws a latent trajectory from (approximately) its
//! posterior given the observations, while conditioning on a reference trajectory
//! held fixed in [`REFERENCE_SLOT`](crate::population::REFERENCE_SLOT). For every
//! transition t → t+1 the reference slot first redraws its ancestor from
//!
//! $$
//! P(a = i) \propto w_t^i \, p(x^{ref}_{t+1} \mid x_t^i)
//! $$
//!
//! and the free slots then draw theirs with the configured [`ResamplingStrategy`],
//! conditioned on that ancestor. Ancestor sampling lets the sampled trajectory break
//! away from the reference's history and keeps the Gibbs chain mixing even with few
//! particles.
//!
//! All weights stay in log space. A step whose log-weights carry no mass (all -inf or
//! NaN) ends the pass with [`PgError::DegenerateWeights`]; there is no uniform
//! fallback.
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};
use rand::Rng;
use rayon::prelude::*;

use crate::error::{PgError, Result, WeightStage};
use crate::population::ParticlePopulation;
use crate::resampling::{ResamplingStrategy, normalize_log_weights, sample_categorical};
use crate::trajectory::{ObservationSequence, Trajectory};
use crate::{InitialDistribution, ObservationModel, StateSpaceModel, TransitionModel};

#[derive(Clone, Debug)]
pub struct ConditionalParticleFilter {
    num_particles: usize,
    resampling: ResamplingStrategy,
    population: Option<ParticlePopulation>,
}

impl ConditionalParticleFilter {
    /// # Errors
    /// `InvalidParameter` when `num_particles` is zero.
    pub fn new(num_particles: usize, resampling: ResamplingStrategy) -> Result<Self> {
        if num_particles == 0 {
            return Err(PgError::invalid("num_particles", "must be at least 1"));
        }
        Ok(ConditionalParticleFilter {
            num_particles,
            resampling,
            population: None,
        })
    }
    pub fn num_particles(&self) -> usize {
        self.num_particles
    }
    pub fn resampling(&self) -> ResamplingStrategy {
        self.resampling
    }
    /// Population of the most recent pass, if any.
    pub fn population(&self) -> Option<&ParticlePopulation> {
        self.population.as_ref()
    }

    /// Prepare a fresh population pinned to `reference`.
    ///
    /// # Errors
    /// * `DimensionMismatch` when the reference and observation lengths differ, or
    ///   either does not match the model dimensions.
    /// * `InvalidParameter` for an empty or non-finite observation sequence or a
    ///   non-finite reference.
    pub fn initialize<I, P, L>(
        &mut self,
        model: &StateSpaceModel<I, P, L>,
        observations: &ObservationSequence,
        reference: &Trajectory,
    ) -> Result<()>
    where
        I: InitialDistribution,
        P: TransitionModel,
        L: ObservationModel,
    {
        model.validate_observations(observations)?;
        PgError::check_dim("reference length", observations.len(), reference.len())?;
        PgError::check_dim("reference state", model.state_dim(), reference.dim())?;
        self.population = Some(ParticlePopulation::conditioned(
            self.num_particles,
            reference,
        )?);
        Ok(())
    }

    /// Run one filtering pass and return the sampled trajectory.
    pub fn sample<I, P, L, R>(
        &mut self,
        model: &StateSpaceModel<I, P, L>,
        observations: &ObservationSequence,
        rng: &mut R,
    ) -> Result<Trajectory>
    where
        I: InitialDistribution,
        P: TransitionModel,
        L: ObservationModel,
        R: Rng + ?Sized,
    {
        self.run_pass(model, observations, rng, None)
    }

    /// As [`sample`](Self::sample), but checks `cancel` before every transition and
    /// stops with [`PgError::Cancelled`] once it is set.
    pub fn sample_cancellable<I, P, L, R>(
        &mut self,
        model: &StateSpaceModel<I, P, L>,
        observations: &ObservationSequence,
        rng: &mut R,
        cancel: &AtomicBool,
    ) -> Result<Trajectory>
    where
        I: InitialDistribution,
        P: TransitionModel,
        L: ObservationModel,
        R: Rng + ?Sized,
    {
        self.run_pass(model, observations, rng, Some(cancel))
    }

    fn run_pass<I, P, L, R>(
        &mut self,
        model: &StateSpaceModel<I, P, L>,
        observations: &ObservationSequence,
        rng: &mut R,
        cancel: Option<&AtomicBool>,
    ) -> Result<Trajectory>
    where
        I: InitialDistribution,
        P: TransitionModel,
        L: ObservationModel,
        R: Rng + ?Sized,
    {
        let resampling = self.resampling;
        let population = self.population.as_mut().ok_or(PgError::Uninitialized)?;
        PgError::check_dim(
            "observation sequence length",
            population.num_steps(),
            observations.len(),
        )?;
        let num_steps = population.num_steps();
        let num_particles = population.num_particles();
        let free: Vec<usize> = population.free_slots().collect();

        for &i in &free {
            let state = model.initial.sample(rng);
            population.set_state(0, i, &state)?;
        }
        let log_weights = model.likelihood.log_weight(population, observations, 0);
        population.set_log_weights(0, log_weights)?;
        let mut min_ess = population.effective_sample_size(0);
        trace!("t=0 ess={:.2}", min_ess);

        for t in 0..num_steps - 1 {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                debug!("filtering pass cancelled before time step {}", t + 1);
                return Err(PgError::Cancelled { time_step: t + 1 });
            }
            let mut ancestors = vec![0; num_particles];
            let weights = population.weights_at(t).as_slice();
            let resampled = match population.reference_slot() {
                Some(slot) => {
                    let anchor =
                        sample_reference_ancestor(&model.proposal, population, t, slot, rng)?;
                    ancestors[slot] = anchor;
                    resampling.sample_conditional(weights, anchor, free.len(), rng)
                }
                None => resampling.sample_indices(weights, free.len(), rng),
            };
            for (&i, a) in free.iter().zip(resampled) {
                ancestors[i] = a;
            }
            model
                .proposal
                .sample_next(population, t, &ancestors, rng)?;
            population.set_ancestors(t + 1, ancestors)?;

            let log_weights = model.likelihood.log_weight(population, observations, t + 1);
            population.set_log_weights(t + 1, log_weights)?;
            let ess = population.effective_sample_size(t + 1);
            trace!("t={} ess={:.2}", t + 1, ess);
            min_ess = min_ess.min(ess);
        }
        debug!(
            "filtering pass complete: {} steps, {} particles, min ess {:.2}",
            num_steps, num_particles, min_ess
        );

        let final_particle = sample_categorical(population.weights_at(num_steps - 1).as_slice(), rng);
        Ok(population.trace_lineage(final_particle))
    }
}

/// Draw the ancestor at `t` of the reference slot at `t + 1`.
///
/// Log-weights and transition densities are evaluated on the rayon pool in particle
/// order; the single categorical draw is made on the caller's generator.
fn sample_reference_ancestor<P, R>(
    proposal: &P,
    population: &ParticlePopulation,
    t: usize,
    slot: usize,
    rng: &mut R,
) -> Result<usize>
where
    P: TransitionModel,
    R: Rng + ?Sized,
{
    let target = population.state(t + 1, slot);
    let log_weights = population.log_weights_at(t);
    let scores: Vec<f64> = (0..population.num_particles())
        .into_par_iter()
        .map(|i| log_weights[i] + proposal.log_transition_density(population.state(t, i), target))
        .collect();
    let weights = normalize_log_weights(&scores).ok_or(PgError::DegenerateWeights {
        time_step: t + 1,
        stage: WeightStage::AncestorSampling,
    })?;
    Ok(sample_categorical(&weights, rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::{LinearGaussianDynamics, ProcessNoise};
    use crate::initial::GaussianInitialDistribution;
    use crate::measurements::LinearGaussianLikelihood;
    use crate::population::REFERENCE_SLOT;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{DMatrix, DVector, DVectorView};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::f64::consts::PI;

    type Model = StateSpaceModel<
        GaussianInitialDistribution,
        LinearGaussianDynamics,
        LinearGaussianLikelihood,
    >;

    fn model() -> Model {
        let noise = ProcessNoise::isotropic(2, 0.1).unwrap();
        StateSpaceModel::new(
            GaussianInitialDistribution::isotropic(DVector::from_element(2, 1.0), 1.0).unwrap(),
            LinearGaussianDynamics::rotational(PI / 12.0, 0.01, noise).unwrap(),
            LinearGaussianLikelihood::isotropic(DMatrix::identity(2, 2), 0.2).unwrap(),
        )
        .unwrap()
    }

    fn ramp(len: usize) -> Trajectory {
        let rows: Vec<Vec<f64>> = (0..len)
            .map(|t| vec![(t as f64 * 0.1).cos(), (t as f64 * 0.1).sin()])
            .collect();
        Trajectory::from_rows(&rows).unwrap()
    }

    #[test]
    fn sample_before_initialize_fails() {
        let mut filter = ConditionalParticleFilter::new(10, ResamplingStrategy::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let err = filter.sample(&model(), &ramp(5), &mut rng).unwrap_err();
        assert!(matches!(err, PgError::Uninitialized));
    }

    #[test]
    fn zero_particles_are_rejected() {
        assert!(ConditionalParticleFilter::new(0, ResamplingStrategy::Multinomial).is_err());
    }

    #[test]
    fn reference_length_must_match_observations() {
        let mut filter = ConditionalParticleFilter::new(10, ResamplingStrategy::default()).unwrap();
        let err = filter
            .initialize(&model(), &ramp(5), &Trajectory::zeros(2, 4))
            .unwrap_err();
        assert!(matches!(err, PgError::DimensionMismatch { .. }));
        let err = filter
            .initialize(&model(), &ramp(5), &Trajectory::zeros(3, 5))
            .unwrap_err();
        assert!(matches!(err, PgError::DimensionMismatch { .. }));
    }

    #[test]
    fn pass_keeps_reference_and_valid_ancestors() {
        let model = model();
        let observations = ramp(30);
        let reference = ramp(30);
        let mut filter = ConditionalParticleFilter::new(25, ResamplingStrategy::Stratified).unwrap();
        let mut rng = StdRng::seed_from_u64(17);
        filter.initialize(&model, &observations, &reference).unwrap();
        let traj = filter.sample(&model, &observations, &mut rng).unwrap();
        assert_eq!(traj.len(), 30);
        assert_eq!(traj.dim(), 2);
        assert!(traj.is_finite());

        let pop = filter.population().unwrap();
        for t in 0..30 {
            assert_eq!(pop.state(t, REFERENCE_SLOT), reference.state(t));
            assert_approx_eq!(pop.weights_at(t).sum(), 1.0, 1e-9);
            assert!(pop.weights_at(t).iter().all(|&w| w >= 0.0));
            assert!(pop.ancestors_at(t).iter().all(|&a| a < 25));
        }
    }

    #[test]
    fn single_particle_returns_reference() {
        let model = model();
        let observations = ramp(10);
        let reference = ramp(10);
        let mut filter = ConditionalParticleFilter::new(1, ResamplingStrategy::default()).unwrap();
        filter.initialize(&model, &observations, &reference).unwrap();
        let traj = filter
            .sample(&model, &observations, &mut StdRng::seed_from_u64(2))
            .unwrap();
        assert_eq!(traj, reference);
    }

    #[test]
    fn single_step_sequence_is_supported() {
        let model = model();
        let observations = ramp(1);
        let mut filter = ConditionalParticleFilter::new(8, ResamplingStrategy::Residual).unwrap();
        filter
            .initialize(&model, &observations, &Trajectory::zeros(2, 1))
            .unwrap();
        let traj = filter
            .sample(&model, &observations, &mut StdRng::seed_from_u64(4))
            .unwrap();
        assert_eq!(traj.len(), 1);
    }

    #[test]
    fn cancelled_pass_reports_time_step() {
        let model = model();
        let observations = ramp(10);
        let mut filter = ConditionalParticleFilter::new(5, ResamplingStrategy::default()).unwrap();
        filter
            .initialize(&model, &observations, &Trajectory::zeros(2, 10))
            .unwrap();
        let cancel = AtomicBool::new(true);
        let err = filter
            .sample_cancellable(&model, &observations, &mut StdRng::seed_from_u64(1), &cancel)
            .unwrap_err();
        assert!(matches!(err, PgError::Cancelled { time_step: 1 }));
    }

    /// Assigns zero likelihood to everything.
    struct Impossible;

    impl ObservationModel for Impossible {
        fn state_dim(&self) -> usize {
            2
        }
        fn observation_dim(&self) -> usize {
            2
        }
        fn log_likelihood(&self, _: DVectorView<'_, f64>, _: DVectorView<'_, f64>) -> f64 {
            f64::NEG_INFINITY
        }
        fn sample<R: Rng + ?Sized>(
            &self,
            _: &ParticlePopulation,
            _: &mut ObservationSequence,
            _: usize,
            _: usize,
            _: &mut R,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn zero_likelihood_is_fatal() {
        let base = model();
        let model = StateSpaceModel::new(base.initial, base.proposal, Impossible).unwrap();
        let observations = ramp(4);
        let mut filter = ConditionalParticleFilter::new(5, ResamplingStrategy::default()).unwrap();
        filter
            .initialize(&model, &observations, &Trajectory::zeros(2, 4))
            .unwrap();
        let err = filter
            .sample(&model, &observations, &mut StdRng::seed_from_u64(3))
            .unwrap_err();
        assert!(matches!(
            err,
            PgError::DegenerateWeights {
                time_step: 0,
                stage: WeightStage::Reweight
            }
        ));
    }
}
