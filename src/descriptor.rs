//! Shape descriptor: adaptive second moments of a star stamp.
//!
//! The stamp is weighted by an elliptical Gaussian whose centre and covariance
//! are iterated until they match the star itself:
//!
//! 1. Accumulate `w·I`, first and second moments about the current centre,
//!    with `w = exp(-½ dᵀ M⁻¹ d)`.
//! 2. Move the centre by twice the weighted mean offset.
//! 3. Replace `M` by twice the weighted covariance.
//! 4. Stop when centre and `M` change by less than the tolerance.
//!
//! At the fixed point a Gaussian profile has `M` equal to its own covariance,
//! so the descriptor is exact for Gaussians and a robust size/shape summary for
//! everything else. Pixels with zero weight are ignored.
//!
//! The descriptor vector is `[flux, du, dv, size, e1, e2]`:
//! `size = det(M)^¼`, `e1 = (Mxx − Myy)/(Mxx + Myy)`, `e2 = 2Mxy/(Mxx + Myy)`,
//! with centroid and size in sky units.

use nalgebra::Matrix2;
use tracing::debug;

use crate::error::{PsfError, Result};
use crate::star::{Stamp, Star, StarFit};

/// Length of the descriptor vector.
pub const DESCRIPTOR_LEN: usize = 6;

/// Component names of the descriptor vector, in order.
pub const DESCRIPTOR_NAMES: [&str; DESCRIPTOR_LEN] = ["flux", "du", "dv", "size", "e1", "e2"];

/// Configuration for adaptive-moment measurement.
#[derive(Debug, Clone)]
pub struct DescriptorConfig {
    /// Maximum adaptive iterations. Default 100.
    pub max_iterations: usize,
    /// Convergence threshold on centroid (pixels) and relative moment change.
    /// Default 1e-6.
    pub tolerance: f64,
    /// Maximum allowed centroid excursion from the nominal centre, pixels.
    /// Default 5.0.
    pub max_shift_px: f64,
    /// Starting Gaussian sigma of the weight function, pixels. Default 2.0.
    pub initial_sigma_px: f64,
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            max_shift_px: 5.0,
            initial_sigma_px: 2.0,
        }
    }
}

/// Converged adaptive moments, in sky units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub flux: f64,
    pub du: f64,
    pub dv: f64,
    pub mxx: f64,
    pub mxy: f64,
    pub myy: f64,
    pub iterations: usize,
}

impl Moments {
    /// `det(M)^¼`; equals sigma for a round or sheared Gaussian.
    pub fn size(&self) -> f64 {
        (self.mxx * self.myy - self.mxy * self.mxy).sqrt().sqrt()
    }

    pub fn e1(&self) -> f64 {
        (self.mxx - self.myy) / (self.mxx + self.myy)
    }

    pub fn e2(&self) -> f64 {
        2.0 * self.mxy / (self.mxx + self.myy)
    }

    /// `[flux, du, dv, size, e1, e2]`.
    pub fn to_vector(&self) -> [f64; DESCRIPTOR_LEN] {
        [
            self.flux,
            self.du,
            self.dv,
            self.size(),
            self.e1(),
            self.e2(),
        ]
    }
}

/// Weighted sums over the stamp for one adaptive iteration.
struct WeightedSums {
    s0: f64,
    sx: f64,
    sy: f64,
    sxx: f64,
    sxy: f64,
    syy: f64,
}

/// Reduces star stamps to comparable moment vectors.
#[derive(Debug, Clone, Default)]
pub struct ShapeDescriptor {
    pub config: DescriptorConfig,
}

impl ShapeDescriptor {
    pub fn new(config: DescriptorConfig) -> Self {
        Self { config }
    }

    /// Measure adaptive moments of a stamp.
    pub fn measure(&self, stamp: &Stamp) -> Result<Moments> {
        let cfg = &self.config;
        let s2 = cfg.initial_sigma_px * cfg.initial_sigma_px;
        let mut m = Matrix2::new(s2, 0.0, 0.0, s2);
        let mut x0 = stamp.center_x;
        let mut y0 = stamp.center_y;

        for iter in 0..cfg.max_iterations {
            let sums = weighted_sums(stamp, x0, y0, &m)?;
            let dx_bar = sums.sx / sums.s0;
            let dy_bar = sums.sy / sums.s0;
            let cxx = sums.sxx / sums.s0 - dx_bar * dx_bar;
            let cyy = sums.syy / sums.s0 - dy_bar * dy_bar;
            let cxy = sums.sxy / sums.s0 - dx_bar * dy_bar;
            if cxx <= 0.0 || cyy <= 0.0 || cxx * cyy - cxy * cxy <= 0.0 {
                return Err(PsfError::FitFailure(format!(
                    "second-moment matrix not positive definite at iteration {iter} \
                     (cxx={cxx:.3e}, cyy={cyy:.3e}, cxy={cxy:.3e})"
                )));
            }

            let new_x0 = x0 + 2.0 * dx_bar;
            let new_y0 = y0 + 2.0 * dy_bar;
            let new_m = Matrix2::new(2.0 * cxx, 2.0 * cxy, 2.0 * cxy, 2.0 * cyy);

            let shift = (new_x0 - stamp.center_x).hypot(new_y0 - stamp.center_y);
            let outside = new_x0 < 0.0
                || new_y0 < 0.0
                || new_x0 > (stamp.width - 1) as f64
                || new_y0 > (stamp.height - 1) as f64;
            if !shift.is_finite() || shift > cfg.max_shift_px || outside {
                return Err(PsfError::FitFailure(format!(
                    "centroid diverged: moved {shift:.2} px from the nominal centre"
                )));
            }

            let dm = (new_m - m).abs().max() / (new_m.trace() / 2.0);
            let dc = (new_x0 - x0).abs().max((new_y0 - y0).abs());
            x0 = new_x0;
            y0 = new_y0;
            m = new_m;

            if dc < cfg.tolerance && dm < cfg.tolerance {
                let fin = weighted_sums(stamp, x0, y0, &m)?;
                let scale2 = stamp.scale * stamp.scale;
                debug!(
                    "adaptive moments converged in {} iterations: sigma={:.4} px",
                    iter + 1,
                    (m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(0, 1)]).sqrt().sqrt()
                );
                return Ok(Moments {
                    flux: 2.0 * fin.s0,
                    du: (x0 - stamp.center_x) * stamp.scale,
                    dv: (y0 - stamp.center_y) * stamp.scale,
                    mxx: m[(0, 0)] * scale2,
                    mxy: m[(0, 1)] * scale2,
                    myy: m[(1, 1)] * scale2,
                    iterations: iter + 1,
                });
            }
        }

        Err(PsfError::FitFailure(format!(
            "adaptive moments did not converge in {} iterations",
            cfg.max_iterations
        )))
    }

    /// Descriptor vector of a star's stamp.
    pub fn descriptor(&self, star: &Star) -> Result<[f64; DESCRIPTOR_LEN]> {
        Ok(self.measure(star.stamp()?)?.to_vector())
    }

    /// Attach the descriptor to a star as its fit.
    ///
    /// The returned star's `fit.params` is the descriptor vector; flux and
    /// centre are filled from the moments.
    pub fn fit(&self, star: &Star) -> Result<Star> {
        let moments = self.measure(star.stamp()?)?;
        Ok(star.with_fit(StarFit {
            params: moments.to_vector().to_vec(),
            flux: moments.flux,
            center: (moments.du, moments.dv),
            chisq: None,
            dof: None,
        }))
    }
}

/// Accumulate Gaussian-weighted moments about `(x0, y0)` in pixel units.
fn weighted_sums(stamp: &Stamp, x0: f64, y0: f64, m: &Matrix2<f64>) -> Result<WeightedSums> {
    let minv = m.try_inverse().ok_or_else(|| {
        PsfError::FitFailure("weight covariance is singular".into())
    })?;
    let (a, b, c) = (minv[(0, 0)], minv[(0, 1)], minv[(1, 1)]);

    let mut sums = WeightedSums {
        s0: 0.0,
        sx: 0.0,
        sy: 0.0,
        sxx: 0.0,
        sxy: 0.0,
        syy: 0.0,
    };
    for row in 0..stamp.height {
        let dy = row as f64 - y0;
        for col in 0..stamp.width {
            let idx = row * stamp.width + col;
            if stamp.weight[idx] <= 0.0 {
                continue;
            }
            let dx = col as f64 - x0;
            let rho2 = a * dx * dx + 2.0 * b * dx * dy + c * dy * dy;
            // Beyond 6 sigma the weight is below 1e-7 of the peak.
            if rho2 > 36.0 {
                continue;
            }
            let wi = (-0.5 * rho2).exp() * stamp.pixels[idx];
            sums.s0 += wi;
            sums.sx += wi * dx;
            sums.sy += wi * dy;
            sums.sxx += wi * dx * dx;
            sums.sxy += wi * dx * dy;
            sums.syy += wi * dy * dy;
        }
    }

    if !(sums.s0 > 0.0) {
        return Err(PsfError::FitFailure(format!(
            "non-positive weighted flux ({:.3e})",
            sums.s0
        )));
    }
    Ok(sums)
}
