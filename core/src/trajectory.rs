//! Time-indexed sequences of vectors.
//!
//! A [`Trajectory`] stores one vector per time step as the columns of a `dim × len`
//! matrix. The same type carries latent state trajectories and observation sequences.
use nalgebra::{DMatrix, DVector, DVectorView};

use crate::error::{PgError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct Trajectory {
    values: DMatrix<f64>,
}

/// Observation sequences share the trajectory layout (column t is y_t).
pub type ObservationSequence = Trajectory;

impl Trajectory {
    /// Wrap a `dim × len` matrix whose column t is the vector at time t.
    pub fn new(values: DMatrix<f64>) -> Self {
        Trajectory { values }
    }
    pub fn zeros(dim: usize, len: usize) -> Self {
        Trajectory {
            values: DMatrix::zeros(dim, len),
        }
    }
    /// Build a trajectory from one row per time step.
    ///
    /// # Errors
    /// `DimensionMismatch` if the rows do not all have the same length.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let dim = rows.first().map(|r| r.len()).unwrap_or(0);
        for row in rows {
            PgError::check_dim("trajectory row", dim, row.len())?;
        }
        Ok(Trajectory {
            values: DMatrix::from_fn(dim, rows.len(), |d, t| rows[t][d]),
        })
    }
    /// Number of time steps.
    pub fn len(&self) -> usize {
        self.values.ncols()
    }
    pub fn is_empty(&self) -> bool {
        self.values.ncols() == 0
    }
    /// Dimension of each vector.
    pub fn dim(&self) -> usize {
        self.values.nrows()
    }
    pub fn state(&self, t: usize) -> DVectorView<'_, f64> {
        self.values.column(t)
    }
    pub fn set_state(&mut self, t: usize, state: &DVector<f64>) {
        self.values.set_column(t, state);
    }
    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.values
    }
    pub fn into_matrix(self) -> DMatrix<f64> {
        self.values
    }
    /// One row per time step, for persistence.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        self.values
            .column_iter()
            .map(|c| c.iter().copied().collect())
            .collect()
    }
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}
