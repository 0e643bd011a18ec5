//! Calibration loops tying a pixel model to a spatial interpolant.
//!
//! - [`calibrate_iterative`]: alternate independent per-star fits with a
//!   global interpolant solve until the total chi-square settles.
//! - [`JointCalibration`]: minimise one objective over model globals and
//!   interpolant coefficients at once.

pub mod iterative;
pub mod joint;

pub use iterative::{
    calibrate_iterative, FitFailurePolicy, IterationRecord, IterativeConfig, IterativeResult,
};
pub use joint::{JointCalibration, JointConfig, JointFitResult, JointStatus};
