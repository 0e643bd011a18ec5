//! Error type shared by every stage of PSF calibration.

use thiserror::Error;

/// Errors raised by the interpolators, the shape descriptor, the persistence
/// layer and the calibration loops.
#[derive(Debug, Error)]
pub enum PsfError {
    /// Declared schema does not match the data, or an invalid combination of
    /// options was requested (e.g. optimising a fixed explicit kernel).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Fewer training samples than the algorithm needs.
    #[error("insufficient data: need at least {required} stars, got {got}")]
    InsufficientData { required: usize, got: usize },

    /// The adaptive-moment fit of a star stamp failed.
    #[error("shape fit failed: {0}")]
    FitFailure(String),

    /// The joint-mode search ran out of function calls before converging.
    #[error("optimizer exhausted its budget of {calls} calls without converging")]
    OptimizerNonConvergence { calls: usize },

    /// A persisted table does not have the layout the reader expects.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// `interpolate` was called before `solve`.
    #[error("interpolator has not been solved")]
    NotSolved,

    /// A matrix factorization failed (e.g. a covariance that is not
    /// positive definite even after jitter).
    #[error("linear algebra failure: {0}")]
    LinearAlgebra(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PsfError>;
