//! Error types for the particle Gibbs sampler.
//!
//! Numerical failures inside a filtering pass are never retried or masked here. They
//! propagate to [`crate::gibbs::GibbsSampler`], which wraps them with the sweep index.
use std::fmt;

use thiserror::Error;

/// Which weighting step of a filtering pass produced a degenerate distribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeightStage {
    /// Observation reweighting of the population at a time step.
    Reweight,
    /// Ancestor sampling for the reference slot.
    AncestorSampling,
}
impl fmt::Display for WeightStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WeightStage::Reweight => write!(f, "reweighting"),
            WeightStage::AncestorSampling => write!(f, "ancestor sampling"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PgError {
    /// Every log-weight at a time step was -inf (or NaN).
    #[error("degenerate particle weights at time step {time_step} during {stage}")]
    DegenerateWeights { time_step: usize, stage: WeightStage },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("dimension mismatch for {context}: expected {expected}, got {actual}")]
    DimensionMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("non-finite state for particle {particle} at time step {time_step}")]
    NonFiniteState { time_step: usize, particle: usize },

    #[error("conditional particle filter used before initialize()")]
    Uninitialized,

    #[error("filtering pass cancelled at time step {time_step}")]
    Cancelled { time_step: usize },

    #[error("sweep {sweep} failed: {source}")]
    SweepFailed {
        sweep: usize,
        #[source]
        source: Box<PgError>,
    },
}

pub type Result<T> = std::result::Result<T, PgError>;

impl PgError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        PgError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn check_dim(context: &'static str, expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(PgError::DimensionMismatch {
                context,
                expected,
                actual,
            })
        }
    }

    /// Numerical failures that an explicit sweep restart may recover from.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PgError::DegenerateWeights { .. } | PgError::NonFiniteState { .. }
        )
    }

    /// Time step at which the failure happened, looking through `SweepFailed`.
    pub fn time_step(&self) -> Option<usize> {
        match self {
            PgError::DegenerateWeights { time_step, .. }
            | PgError::NonFiniteState { time_step, .. }
            | PgError::Cancelled { time_step } => Some(*time_step),
            PgError::SweepFailed { source, .. } => source.time_step(),
            _ => None,
        }
    }

    /// Sweep index for failures surfaced by the Gibbs sampler.
    pub fn sweep(&self) -> Option<usize> {
        match self {
            PgError::SweepFailed { sweep, .. } => Some(*sweep),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_failure_exposes_time_step_and_sweep() {
        let err = PgError::SweepFailed {
            sweep: 7,
            source: Box::new(PgError::DegenerateWeights {
                time_step: 12,
                stage: WeightStage::Reweight,
            }),
        };
        assert_eq!(err.sweep(), Some(7));
        assert_eq!(err.time_step(), Some(12));
        assert!(!err.is_recoverable());
        let msg = err.to_string();
        assert!(msg.contains("sweep 7"));
        assert!(msg.contains("time step 12"));
    }

    #[test]
    fn check_dim_reports_context() {
        assert!(PgError::check_dim("state", 2, 2).is_ok());
        match PgError::check_dim("state", 2, 3) {
            Err(PgError::DimensionMismatch {
                context,
                expected,
                actual,
            }) => {
                assert_eq!(context, "state");
                assert_eq!(expected, 2);
                assert_eq!(actual, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
