//! Pixel-level PSF models and named global parameters.
//!
//! The calibration loops see a model only through [`Model`]: `fit` a star's
//! stamp locally, `reflux` it against the current parameters, and `draw` the
//! profile the parameters describe. Objects that expose tunable globals
//! (model hyperparameters, interpolant coefficients) implement
//! [`ParameterBlock`] and accept partial updates through [`ParamUpdate`].
//!
//! [`GaussianModel`] is the reference implementation: an elliptical Gaussian
//! with parameters `[du, dv, size, g1, g2]` plus global offsets for size and
//! shear.

use nalgebra::Matrix2;
use tracing::trace;

use crate::descriptor::ShapeDescriptor;
use crate::error::{PsfError, Result};
use crate::star::{Stamp, Star, StarFit};

/// Pixel-level PSF model.
pub trait Model {
    /// Fit the model to the star's stamp; the result carries params, flux,
    /// centre and chi-square.
    fn fit(&self, star: &Star) -> Result<Star>;

    /// Re-fit only the flux given the star's current params, updating
    /// chi-square and degrees of freedom.
    fn reflux(&self, star: &Star) -> Result<Star>;

    /// Render the star's current params and flux into its stamp.
    fn draw(&self, star: &Star) -> Result<Star>;
}

// ── Partial updates ─────────────────────────────────────────────────────────

/// New value for one named parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Update {
    Set(f64),
    /// Leave the installed value unchanged.
    Keep,
}

/// Explicit per-field update of named parameters. Names not listed are kept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamUpdate {
    fields: Vec<(String, Update)>,
}

impl ParamUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &str, value: f64) -> Self {
        self.fields.push((name.to_string(), Update::Set(value)));
        self
    }

    pub fn keep(mut self, name: &str) -> Self {
        self.fields.push((name.to_string(), Update::Keep));
        self
    }

    /// Set every `names[i]` to `values[i]`.
    pub fn from_values(names: &[String], values: &[f64]) -> Self {
        Self {
            fields: names
                .iter()
                .zip(values)
                .map(|(n, &v)| (n.clone(), Update::Set(v)))
                .collect(),
        }
    }

    pub fn fields(&self) -> &[(String, Update)] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Split into the fields named in `names` and the rest.
    pub fn partition(&self, names: &[String]) -> (ParamUpdate, ParamUpdate) {
        let (mine, rest): (Vec<_>, Vec<_>) = self
            .fields
            .iter()
            .cloned()
            .partition(|(n, _)| names.contains(n));
        (ParamUpdate { fields: mine }, ParamUpdate { fields: rest })
    }

    /// Apply to `values`, whose names are `names`. Later fields win.
    pub fn apply_to(&self, names: &[String], values: &mut [f64]) -> Result<()> {
        for (name, update) in &self.fields {
            let idx = names.iter().position(|n| n == name).ok_or_else(|| {
                PsfError::Configuration(format!("unknown parameter '{name}' in update"))
            })?;
            if let Update::Set(v) = update {
                values[idx] = *v;
            }
        }
        Ok(())
    }
}

/// A set of named scalar parameters that can be read and partially updated.
pub trait ParameterBlock {
    fn parameter_names(&self) -> Vec<String>;
    fn parameter_values(&self) -> Vec<f64>;
    /// Install an update; an unknown name is a configuration error and
    /// leaves the block unchanged.
    fn apply(&mut self, update: &ParamUpdate) -> Result<()>;
}

// ── Elliptical Gaussian ─────────────────────────────────────────────────────

/// Names of [`GaussianModel`]'s per-star parameters.
pub const GAUSSIAN_PARAM_NAMES: [&str; 5] = ["du", "dv", "size", "g1", "g2"];

/// Covariance of a Gaussian of size `sigma` sheared by `(g1, g2)`.
///
/// `det` of the result is `sigma⁴`, so the adaptive-moment size of the
/// profile is `sigma`.
pub fn shear_covariance(sigma: f64, g1: f64, g2: f64) -> Result<Matrix2<f64>> {
    let gsq = g1 * g1 + g2 * g2;
    if !(sigma > 0.0) || gsq >= 1.0 {
        return Err(PsfError::FitFailure(format!(
            "invalid Gaussian shape: size={sigma:.4e}, |g|²={gsq:.4}"
        )));
    }
    let f = sigma * sigma / (1.0 - gsq);
    Ok(Matrix2::new(
        f * ((1.0 + g1).powi(2) + g2 * g2),
        f * 2.0 * g2,
        f * 2.0 * g2,
        f * ((1.0 - g1).powi(2) + g2 * g2),
    ))
}

/// Elliptical Gaussian PSF with global size and shear offsets.
#[derive(Debug, Clone, Default)]
pub struct GaussianModel {
    pub descriptor: ShapeDescriptor,
    /// Added to the per-star `size`, `g1`, `g2`.
    pub globals: [f64; 3],
}

impl GaussianModel {
    pub fn new(descriptor: ShapeDescriptor) -> Self {
        Self {
            descriptor,
            globals: [0.0; 3],
        }
    }

    /// Per-star params with the globals added.
    pub fn effective_params(&self, params: &[f64]) -> Result<[f64; 5]> {
        match params {
            [du, dv, size, g1, g2] => Ok([
                *du,
                *dv,
                size + self.globals[0],
                g1 + self.globals[1],
                g2 + self.globals[2],
            ]),
            _ => Err(PsfError::Configuration(format!(
                "Gaussian model takes 5 parameters, got {}",
                params.len()
            ))),
        }
    }

    /// Unit-flux profile of `params` sampled at the stamp's pixel centres.
    pub fn profile(&self, params: &[f64], stamp: &Stamp) -> Result<Vec<f64>> {
        let [du, dv, size, g1, g2] = self.effective_params(params)?;
        let cov = shear_covariance(size, g1, g2)?;
        let inv = cov
            .try_inverse()
            .ok_or_else(|| PsfError::FitFailure("singular Gaussian covariance".into()))?;
        let norm = stamp.scale * stamp.scale
            / (2.0 * std::f64::consts::PI * cov.determinant().sqrt());

        let mut out = Vec::with_capacity(stamp.width * stamp.height);
        for row in 0..stamp.height {
            for col in 0..stamp.width {
                let (x, y) = stamp.sky_offset(col, row);
                let (x, y) = (x - du, y - dv);
                let rho2 = inv[(0, 0)] * x * x + 2.0 * inv[(0, 1)] * x * y + inv[(1, 1)] * y * y;
                out.push(norm * (-0.5 * rho2).exp());
            }
        }
        Ok(out)
    }
}

impl Model for GaussianModel {
    fn fit(&self, star: &Star) -> Result<Star> {
        let m = self.descriptor.measure(star.stamp()?)?;
        let (e1, e2) = (m.e1(), m.e2());
        // Distortion e to reduced shear g.
        let denom = 1.0 + (1.0 - e1 * e1 - e2 * e2).max(0.0).sqrt();
        let (g1, g2) = (e1 / denom, e2 / denom);
        let params = vec![
            m.du,
            m.dv,
            m.size() - self.globals[0],
            g1 - self.globals[1],
            g2 - self.globals[2],
        ];
        let fitted = star.with_fit(StarFit {
            params,
            flux: m.flux,
            center: (m.du, m.dv),
            chisq: None,
            dof: None,
        });
        self.reflux(&fitted)
    }

    fn reflux(&self, star: &Star) -> Result<Star> {
        let stamp = star.stamp()?;
        let fit = star
            .fit
            .as_ref()
            .ok_or_else(|| PsfError::Configuration("reflux needs fitted parameters".into()))?;
        let model = self.profile(&fit.params, stamp)?;

        let (mut num, mut den) = (0.0, 0.0);
        for ((&p, &w), &i) in model.iter().zip(&stamp.weight).zip(&stamp.pixels) {
            if w > 0.0 {
                num += w * i * p;
                den += w * p * p;
            }
        }
        if !(den > 0.0) {
            return Err(PsfError::FitFailure(
                "model profile has no overlap with unmasked pixels".into(),
            ));
        }
        let flux = num / den;
        let chisq: f64 = model
            .iter()
            .zip(&stamp.weight)
            .zip(&stamp.pixels)
            .filter(|((_, w), _)| **w > 0.0)
            .map(|((&p, &w), &i)| w * (i - flux * p).powi(2))
            .sum();
        let dof = stamp.n_valid().saturating_sub(1);
        trace!("reflux: flux={:.4e} chisq={:.4e} dof={}", flux, chisq, dof);

        Ok(star.with_fit(StarFit {
            flux,
            chisq: Some(chisq),
            dof: Some(dof),
            ..fit.clone()
        }))
    }

    fn draw(&self, star: &Star) -> Result<Star> {
        let stamp = star.stamp()?;
        let fit = star
            .fit
            .as_ref()
            .ok_or_else(|| PsfError::Configuration("draw needs fitted parameters".into()))?;
        let pixels: Vec<f64> = self
            .profile(&fit.params, stamp)?
            .into_iter()
            .map(|p| fit.flux * p)
            .collect();
        let mut drawn = star.clone();
        drawn.data.stamp = Some(stamp.with_pixels(pixels));
        Ok(drawn)
    }
}

impl ParameterBlock for GaussianModel {
    fn parameter_names(&self) -> Vec<String> {
        vec!["size".into(), "g1".into(), "g2".into()]
    }

    fn parameter_values(&self) -> Vec<f64> {
        self.globals.to_vec()
    }

    fn apply(&mut self, update: &ParamUpdate) -> Result<()> {
        let mut values = self.globals;
        update.apply_to(&self.parameter_names(), &mut values)?;
        self.globals = values;
        Ok(())
    }
}
