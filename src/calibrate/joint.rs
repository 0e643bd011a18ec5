//! Joint calibration: one bounded least-squares fit over model globals and
//! interpolant coefficients together.
//!
//! The observed stamps are reduced to shape descriptors once. Each
//! evaluation installs a candidate parameter vector, predicts every star
//! through the interpolant, draws it with the model, measures the drawn stamp
//! and compares:
//!
//! ```text
//! χ² = Σ_stars Σ_i w_i (d_i − t_i)²  /  (n_stars · 6)
//! ```
//!
//! The residuals `√(w_i / (n_stars · 6)) (d_i − t_i)` go to Levenberg-Marquardt.
//! Stars are held sorted by position and then by target descriptor, so the
//! objective and every iterate are the same whatever order the stars were
//! given in.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::descriptor::{DescriptorConfig, ShapeDescriptor, DESCRIPTOR_LEN};
use crate::error::{PsfError, Result};
use crate::interp::Interp;
use crate::model::{Model, ParamUpdate, ParameterBlock};
use crate::optimize::{Bound, LeastSquares, LeastSquaresConfig};
use crate::star::Star;

/// Configuration for [`JointCalibration`].
#[derive(Debug, Clone)]
pub struct JointConfig {
    /// Per-component weights of the descriptor residual; normalised to sum
    /// to one. Default `[0, 0, 0, 0.5, 1, 1]`: flux and centroid ignored,
    /// size down-weighted against shape.
    pub weights: Vec<f64>,
    /// Objective evaluations allowed. Default 300.
    pub max_calls: usize,
    /// Bounds by parameter name; unlisted parameters are unbounded.
    pub bounds: BTreeMap<String, Bound>,
    pub descriptor: DescriptorConfig,
    pub least_squares: LeastSquaresConfig,
}

impl Default for JointConfig {
    fn default() -> Self {
        Self {
            weights: vec![0.0, 0.0, 0.0, 0.5, 1.0, 1.0],
            max_calls: 300,
            bounds: BTreeMap::new(),
            descriptor: DescriptorConfig::default(),
            least_squares: LeastSquaresConfig::default(),
        }
    }
}

/// Residual of each weighted component of a star whose prediction cannot be
/// drawn or measured.
const FAILED_STAR_RESIDUAL: f64 = 1e3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JointStatus {
    Converged,
    /// The call budget ran out; the best iterate found is installed anyway.
    BudgetExhausted,
}

/// Outcome of [`JointCalibration::fit`].
#[derive(Debug, Clone, PartialEq)]
pub struct JointFitResult {
    /// Parameter names, model globals first.
    pub names: Vec<String>,
    /// Best parameter vector, now installed.
    pub x: Vec<f64>,
    /// Normalised objective at `x`.
    pub chisq: f64,
    pub calls: usize,
    pub status: JointStatus,
}

impl JointFitResult {
    /// Treat an exhausted budget as an error.
    pub fn ensure_converged(self) -> Result<Self> {
        match self.status {
            JointStatus::Converged => Ok(self),
            JointStatus::BudgetExhausted => {
                Err(PsfError::OptimizerNonConvergence { calls: self.calls })
            }
        }
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.names.iter().position(|n| n == name).map(|i| self.x[i])
    }
}

/// Joint model + interpolant calibration against a fixed set of stars.
#[derive(Debug)]
pub struct JointCalibration<M, I> {
    model: M,
    interp: I,
    stars: Vec<Star>,
    targets: Vec<[f64; DESCRIPTOR_LEN]>,
    weights: [f64; DESCRIPTOR_LEN],
    descriptor: ShapeDescriptor,
    config: JointConfig,
}

impl<M, I> JointCalibration<M, I>
where
    M: Model + ParameterBlock,
    I: Interp + ParameterBlock,
{
    /// Measure the target descriptors of `stars` and set up the problem.
    pub fn new(model: M, interp: I, stars: Vec<Star>, config: JointConfig) -> Result<Self> {
        if config.weights.len() != DESCRIPTOR_LEN {
            return Err(PsfError::Configuration(format!(
                "joint weights must have {DESCRIPTOR_LEN} entries, got {}",
                config.weights.len()
            )));
        }
        if config.weights.iter().any(|w| !(w.is_finite() && *w >= 0.0)) {
            return Err(PsfError::Configuration(
                "joint weights must be finite and non-negative".into(),
            ));
        }
        let total: f64 = config.weights.iter().sum();
        if !(total > 0.0) {
            return Err(PsfError::Configuration("joint weights sum to zero".into()));
        }
        let mut weights = [0.0; DESCRIPTOR_LEN];
        for (w, c) in weights.iter_mut().zip(&config.weights) {
            *w = c / total;
        }
        if stars.is_empty() {
            return Err(PsfError::InsufficientData {
                required: 1,
                got: 0,
            });
        }

        let descriptor = ShapeDescriptor::new(config.descriptor.clone());
        let mut measured = stars
            .into_iter()
            .map(|s| descriptor.descriptor(&s).map(|t| (s, t)))
            .collect::<Result<Vec<_>>>()?;
        measured.sort_by(|(a, ta), (b, tb)| {
            a.data
                .u
                .total_cmp(&b.data.u)
                .then(a.data.v.total_cmp(&b.data.v))
                .then_with(|| {
                    ta.iter()
                        .zip(tb)
                        .map(|(x, y)| x.total_cmp(y))
                        .find(|o| o.is_ne())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
        });
        let (stars, targets): (Vec<Star>, Vec<_>) = measured.into_iter().unzip();
        debug!("joint calibration: {} target descriptors", targets.len());

        Ok(Self {
            model,
            interp,
            stars,
            targets,
            weights,
            descriptor,
            config,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn interp(&self) -> &I {
        &self.interp
    }

    /// Stars in canonical order.
    pub fn stars(&self) -> &[Star] {
        &self.stars
    }

    pub fn targets(&self) -> &[[f64; DESCRIPTOR_LEN]] {
        &self.targets
    }

    /// Normalised weights actually applied.
    pub fn weights(&self) -> &[f64; DESCRIPTOR_LEN] {
        &self.weights
    }

    pub fn into_parts(self) -> (M, I) {
        (self.model, self.interp)
    }

    /// All free parameter names, model globals first.
    pub fn parameter_names(&self) -> Vec<String> {
        let mut names = self.model.parameter_names();
        names.extend(self.interp.parameter_names());
        names
    }

    pub fn parameter_values(&self) -> Vec<f64> {
        let mut values = self.model.parameter_values();
        values.extend(self.interp.parameter_values());
        values
    }

    /// Install a partial update. Every name is checked before anything is
    /// changed.
    pub fn apply_update(&mut self, update: &ParamUpdate) -> Result<()> {
        let (for_model, rest) = update.partition(&self.model.parameter_names());
        let (for_interp, unknown) = rest.partition(&self.interp.parameter_names());
        if let Some((name, _)) = unknown.fields().first() {
            return Err(PsfError::Configuration(format!(
                "unknown parameter '{name}' in joint update"
            )));
        }
        self.model.apply(&for_model)?;
        self.interp.apply(&for_interp)
    }

    /// Objective at the installed parameters.
    pub fn objective(&self) -> Result<f64> {
        let mut sum = 0.0;
        for (star, target) in self.stars.iter().zip(&self.targets) {
            sum += self.star_term(star, target)?;
        }
        Ok(sum / (self.stars.len() * DESCRIPTOR_LEN) as f64)
    }

    /// Install the full parameter vector `x`, then evaluate.
    pub fn objective_at(&mut self, x: &[f64]) -> Result<f64> {
        self.install(x)?;
        self.objective()
    }

    /// Install the full parameter vector `x`, then return the residual
    /// vector whose squared norm is the objective at `x`.
    pub fn residuals_at(&mut self, x: &[f64]) -> Result<Vec<f64>> {
        self.install(x)?;
        let scale: Vec<f64> = self
            .weights
            .iter()
            .map(|w| (w / (self.stars.len() * DESCRIPTOR_LEN) as f64).sqrt())
            .collect();
        let mut out = Vec::with_capacity(self.stars.len() * DESCRIPTOR_LEN);
        for (star, target) in self.stars.iter().zip(&self.targets) {
            match self.measure_prediction(star)? {
                Some(d) => out.extend(
                    d.iter()
                        .zip(target)
                        .zip(&scale)
                        .map(|((d, t), s)| s * (d - t)),
                ),
                None => out.extend(scale.iter().map(|s| s * FAILED_STAR_RESIDUAL)),
            }
        }
        Ok(out)
    }

    fn install(&mut self, x: &[f64]) -> Result<()> {
        let names = self.parameter_names();
        if x.len() != names.len() {
            return Err(PsfError::Configuration(format!(
                "joint parameter vector has {} entries, expected {}",
                x.len(),
                names.len()
            )));
        }
        self.apply_update(&ParamUpdate::from_values(&names, x))
    }

    /// Descriptor of the star drawn at its predicted parameters, or `None`
    /// when the prediction cannot be drawn or measured.
    fn measure_prediction(&self, star: &Star) -> Result<Option<[f64; DESCRIPTOR_LEN]>> {
        let predicted = self.interp.interpolate(star)?;
        match self
            .model
            .draw(&predicted)
            .and_then(|drawn| self.descriptor.descriptor(&drawn))
        {
            Ok(d) => Ok(Some(d)),
            Err(PsfError::FitFailure(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Weighted descriptor residual of one star. A prediction the model cannot
    /// draw or the descriptor cannot measure is infinitely bad.
    fn star_term(&self, star: &Star, target: &[f64; DESCRIPTOR_LEN]) -> Result<f64> {
        let Some(measured) = self.measure_prediction(star)? else {
            return Ok(f64::INFINITY);
        };
        Ok(measured
            .iter()
            .zip(target)
            .zip(&self.weights)
            .map(|((d, t), w)| w * (d - t) * (d - t))
            .sum())
    }

    /// Fit from the installed parameters by Levenberg-Marquardt.
    ///
    /// The best iterate is installed whether or not the fit converged; an
    /// exhausted budget is reported through [`JointFitResult::status`].
    pub fn fit(&mut self) -> Result<JointFitResult> {
        let names = self.parameter_names();
        let x0 = self.parameter_values();
        let bounds: Vec<Bound> = names
            .iter()
            .map(|n| self.config.bounds.get(n).copied().unwrap_or_else(Bound::unbounded))
            .collect();
        let max_calls = self.config.max_calls;
        let solver = LeastSquares::new(self.config.least_squares.clone());

        let mut failure: Option<PsfError> = None;
        let outcome = {
            let mut residuals = |x: &[f64]| -> Option<Vec<f64>> {
                match self.residuals_at(x) {
                    Ok(r) => Some(r),
                    Err(e) => {
                        failure.get_or_insert(e);
                        None
                    }
                }
            };
            solver.minimize(&mut residuals, &x0, &bounds, max_calls)
        };
        if let Some(e) = failure {
            return Err(e);
        }

        let best = if outcome.x.is_empty() { x0 } else { outcome.x };
        self.install(&best)?;
        let chisq = self.objective()?;
        let status = if outcome.converged {
            JointStatus::Converged
        } else {
            warn!(
                "joint calibration used its budget of {} calls without converging; \
                 installing best iterate (chisq={:.6e})",
                max_calls, chisq
            );
            JointStatus::BudgetExhausted
        };
        info!(
            "joint calibration: chisq={:.6e} after {} calls ({:?})",
            chisq, outcome.calls, status
        );

        Ok(JointFitResult {
            names,
            x: best,
            chisq,
            calls: outcome.calls,
            status,
        })
    }
}
