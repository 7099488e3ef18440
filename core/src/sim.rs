//! Synthetic data generation and CSV persistence.
//!
//! [`generate`] simulates a latent trajectory and its observations from any
//! [`StateSpaceModel`] by driving the same `sample_next`/`sample` contracts the
//! filter uses, with a single unconditioned particle. The remaining functions read
//! and write the CSV files consumed and produced by the `pgibbs` binary:
//!
//! | file               | columns                          |
//! |--------------------|----------------------------------|
//! | trajectory/series  | `t,x0,x1,...`                    |
//! | chain              | `sweep,t,x0,x1,...`              |
//! | noise              | `sweep,var0,var1,...`            |
//! | summary            | `t,dim,mean,std,lower,upper`     |
use std::error::Error;
use std::f64::consts::PI;
use std::io;
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ConfigFile;
use crate::dynamics::{LinearGaussianDynamics, ProcessNoise};
use crate::error::{PgError, Result};
use crate::gibbs::{GibbsChain, PosteriorSummary};
use crate::initial::GaussianInitialDistribution;
use crate::measurements::LinearGaussianLikelihood;
use crate::population::ParticlePopulation;
use crate::trajectory::{ObservationSequence, Trajectory};
use crate::{InitialDistribution, ObservationModel, StateSpaceModel, TransitionModel};

/// The planar rotational model used by `pgibbs generate` and `pgibbs demo`.
pub type RotationalModel =
    StateSpaceModel<GaussianInitialDistribution, LinearGaussianDynamics, LinearGaussianLikelihood>;

fn default_num_steps() -> usize {
    100
}
fn default_rotation() -> f64 {
    PI / 12.0
}
fn default_offset() -> f64 {
    0.01
}
fn default_sigma() -> f64 {
    0.1
}
fn default_eta() -> f64 {
    0.2
}
fn default_one() -> f64 {
    1.0
}
fn default_scenario_seed() -> u64 {
    7
}

/// Parameters of the two-dimensional rotational scenario.
///
/// `A = R(rotation) + offset · I`, `C = I`, isotropic process noise `sigma` and
/// observation noise `eta` (both standard deviations), and `x_0 ~ N(initial_mean · 1,
/// initial_variance · I)`. When `proposal_rotation` is set, the sampler infers with
/// that rotation instead of the one the data was generated with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScenarioConfig {
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    #[serde(default = "default_rotation")]
    pub rotation: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposal_rotation: Option<f64>,
    #[serde(default = "default_offset")]
    pub offset: f64,
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    #[serde(default = "default_eta")]
    pub eta: f64,
    #[serde(default = "default_one")]
    pub initial_mean: f64,
    #[serde(default = "default_one")]
    pub initial_variance: f64,
    #[serde(default = "default_scenario_seed")]
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig {
            num_steps: default_num_steps(),
            rotation: default_rotation(),
            proposal_rotation: None,
            offset: default_offset(),
            sigma: default_sigma(),
            eta: default_eta(),
            initial_mean: default_one(),
            initial_variance: default_one(),
            seed: default_scenario_seed(),
        }
    }
}

impl ConfigFile for ScenarioConfig {}

/// Build the rotational model described by `scenario`.
pub fn rotational_model(scenario: &ScenarioConfig) -> Result<RotationalModel> {
    let initial = GaussianInitialDistribution::isotropic(
        DVector::from_element(2, scenario.initial_mean),
        scenario.initial_variance,
    )?;
    let noise = ProcessNoise::isotropic(2, scenario.sigma)?;
    let dynamics = LinearGaussianDynamics::rotational(scenario.rotation, scenario.offset, noise)?;
    let likelihood = LinearGaussianLikelihood::isotropic(DMatrix::identity(2, 2), scenario.eta)?;
    StateSpaceModel::new(initial, dynamics, likelihood)
}

/// The model the sampler runs with: the generating model, rotated by
/// `proposal_rotation` when one is given.
pub fn inference_model(scenario: &ScenarioConfig) -> Result<RotationalModel> {
    match scenario.proposal_rotation {
        Some(rotation) => rotational_model(&ScenarioConfig {
            rotation,
            ..scenario.clone()
        }),
        None => rotational_model(scenario),
    }
}

/// A simulated latent trajectory and the observations drawn along it.
#[derive(Clone, Debug)]
pub struct SyntheticData {
    pub trajectory: Trajectory,
    pub observations: ObservationSequence,
}

/// Simulate `num_steps` steps from the model.
pub fn generate<I, P, L, R>(
    model: &StateSpaceModel<I, P, L>,
    num_steps: usize,
    rng: &mut R,
) -> Result<SyntheticData>
where
    I: InitialDistribution,
    P: TransitionModel,
    L: ObservationModel,
    R: Rng + ?Sized,
{
    let mut population = ParticlePopulation::new(num_steps, 1, model.state_dim())?;
    let mut observations = Trajectory::zeros(model.observation_dim(), num_steps);
    let first = model.initial.sample(rng);
    population.set_state(0, 0, &first)?;
    model.likelihood.sample(&population, &mut observations, 0, 0, rng)?;
    for t in 0..num_steps - 1 {
        model.proposal.sample_next(&mut population, t, &[0], rng)?;
        model
            .likelihood
            .sample(&population, &mut observations, t + 1, 0, rng)?;
    }
    Ok(SyntheticData {
        trajectory: population.trace_lineage(0),
        observations,
    })
}

/// Fraction of time steps at which every component of `estimate` lies within
/// `tolerance` of `truth`.
pub fn fraction_within(estimate: &Trajectory, truth: &Trajectory, tolerance: f64) -> Result<f64> {
    PgError::check_dim("estimate length", truth.len(), estimate.len())?;
    PgError::check_dim("estimate state", truth.dim(), estimate.dim())?;
    if truth.is_empty() {
        return Ok(0.0);
    }
    let hits = (0..truth.len())
        .filter(|&t| {
            (estimate.state(t) - truth.state(t))
                .iter()
                .all(|e| e.abs() <= tolerance)
        })
        .count();
    Ok(hits as f64 / truth.len() as f64)
}

fn header(prefix: &[&str], label: &str, dim: usize) -> Vec<String> {
    prefix
        .iter()
        .map(|s| s.to_string())
        .chain((0..dim).map(|d| format!("{label}{d}")))
        .collect()
}

/// Write one row per time step: `t,x0,x1,...`.
pub fn write_series<P: AsRef<Path>>(path: P, series: &Trajectory) -> io::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(header(&["t"], "x", series.dim()))?;
    for (t, row) in series.to_rows().into_iter().enumerate() {
        let mut record = vec![t.to_string()];
        record.extend(row.iter().map(f64::to_string));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a series written by [`write_series`]. The `t` column is ignored; rows are
/// taken in file order.
pub fn read_series<P: AsRef<Path>>(path: P) -> std::result::Result<Trajectory, Box<dyn Error>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row = record
            .iter()
            .skip(1)
            .map(|field| field.trim().parse::<f64>())
            .collect::<std::result::Result<Vec<f64>, _>>()?;
        rows.push(row);
    }
    if rows.is_empty() {
        return Err("series file contains no rows".into());
    }
    Ok(Trajectory::from_rows(&rows)?)
}

/// Every trajectory of the chain: `sweep,t,x0,x1,...`.
pub fn write_chain<P: AsRef<Path>>(path: P, chain: &GibbsChain) -> io::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    let dim = chain.last().map(Trajectory::dim).unwrap_or(0);
    writer.write_record(header(&["sweep", "t"], "x", dim))?;
    for (sweep, trajectory) in chain.trajectories().iter().enumerate() {
        for (t, row) in trajectory.to_rows().into_iter().enumerate() {
            let mut record = vec![sweep.to_string(), t.to_string()];
            record.extend(row.iter().map(f64::to_string));
            writer.write_record(&record)?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Noise variance drawn in each sweep: `sweep,var0,var1,...`.
pub fn write_noise<P: AsRef<Path>>(path: P, chain: &GibbsChain) -> io::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    let dim = chain.noise_variances().first().map(|v| v.len()).unwrap_or(0);
    writer.write_record(header(&["sweep"], "var", dim))?;
    for (sweep, variance) in chain.noise_variances().iter().enumerate() {
        let mut record = vec![sweep.to_string()];
        record.extend(variance.iter().map(f64::to_string));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// One (time step, dimension) entry of a posterior summary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub t: usize,
    pub dim: usize,
    pub mean: f64,
    pub std: f64,
    pub lower: f64,
    pub upper: f64,
}

impl SummaryRecord {
    /// Flatten a summary, time-major.
    pub fn from_summary(summary: &PosteriorSummary) -> Vec<Self> {
        let mut records = Vec::with_capacity(summary.mean.len() * summary.mean.dim());
        for t in 0..summary.mean.len() {
            for d in 0..summary.mean.dim() {
                let mean = summary.mean.state(t)[d];
                let std = summary.std.state(t)[d];
                records.push(SummaryRecord {
                    t,
                    dim: d,
                    mean,
                    std,
                    lower: mean - std,
                    upper: mean + std,
                });
            }
        }
        records
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    pub fn from_csv<P: AsRef<Path>>(path: P) -> std::result::Result<Vec<Self>, Box<dyn Error>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
}
