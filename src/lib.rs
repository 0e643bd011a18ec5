//! # focalpsf
//!
//! Calibration of a **spatially varying point-spread function** across a
//! telescope focal plane.
//!
//! Each observed star carries a small pixel stamp. A pixel [`Model`] fits a
//! short parameter vector to every stamp (size, shear, centroid offset), and
//! an [`Interp`] learns how those parameters vary with focal-plane position
//! so the PSF can be predicted anywhere, including at positions with no
//! star.
//!
//! ## Features
//!
//! - **Shape descriptors**: adaptive second moments reduced to a fixed
//!   six-element vector `[flux, du, dv, size, e1, e2]`
//! - **Nearest-neighbour interpolation**: exact recovery at training
//!   positions, k-d tree lookup in any attribute space
//! - **Gaussian-process interpolation**: per-dimension GP regression with an
//!   optional PCA-reduced target space and a composable kernel algebra
//!   (`1.0 * RBF(0.3, (0.1, 1e3)) + WhiteKernel(1e-5)`)
//! - **Bounded optimisation**: Nelder–Mead on the GP log marginal
//!   likelihood, Levenberg–Marquardt on the joint descriptor residuals
//! - **Two calibration loops**: alternating per-star fit / global solve,
//!   and a joint minimisation over model globals and interpolant
//!   coefficients
//! - **Persistence**: every solved interpolator writes a self-describing
//!   table; tables serialize with [rkyv](https://docs.rs/rkyv)
//!
//! ## Example
//!
//! ```no_run
//! use focalpsf::{
//!     calibrate_iterative, DescriptorConfig, GaussianModel, IterativeConfig,
//!     RegressionInterp, GpConfig, ShapeDescriptor, Star,
//! };
//!
//! # fn stars() -> Vec<Star> { Vec::new() }
//! let model = GaussianModel::new(ShapeDescriptor::new(DescriptorConfig::default()));
//! let mut interp = RegressionInterp::new(GpConfig {
//!     optimize: true,
//!     ..Default::default()
//! })
//! .unwrap();
//!
//! let result = calibrate_iterative(&model, &mut interp, &stars(), &IterativeConfig::default())
//!     .unwrap();
//! println!(
//!     "{} iterations, chisq = {:?}, {} stars dropped",
//!     result.iterations,
//!     result.final_chisq(),
//!     result.dropped.len()
//! );
//! ```
//!
//! ## Calibration overview
//!
//! 1. **Local fit**: measure each stamp and convert the moments to model
//!    parameters
//! 2. **Solve**: train the interpolator on the fitted parameter vectors
//! 3. **Install**: replace each star's parameters with the interpolated
//!    prediction and re-fit the flux
//! 4. **Check**: stop when the total chi-square settles
//!
//! The joint loop instead minimises the weighted descriptor residual between
//! observed and rendered stamps over all free parameters at once.

pub mod calibrate;
pub mod descriptor;
pub mod error;
pub mod interp;
pub mod model;
pub mod optimize;
pub mod persist;
pub mod star;

pub use calibrate::{
    calibrate_iterative, FitFailurePolicy, IterationRecord, IterativeConfig, IterativeResult,
    JointCalibration, JointConfig, JointFitResult, JointStatus,
};
pub use descriptor::{DescriptorConfig, Moments, ShapeDescriptor, DESCRIPTOR_LEN, DESCRIPTOR_NAMES};
pub use error::{PsfError, Result};
pub use interp::gp::kernel::Kernel;
pub use interp::{
    build_interp, read_interp, ExactNeighborInterp, GpConfig, Interp, InterpConfig, InterpKind,
    ModeTableInterp, RegressionInterp,
};
pub use model::{GaussianModel, Model, ParamUpdate, ParameterBlock, Update};
pub use optimize::{
    Bound, BoundedMinimizer, LeastSquares, LeastSquaresConfig, MinimizeOutcome, NelderMead,
    NelderMeadConfig,
};
pub use persist::{Table, TableStore};
pub use star::*;
