//! Gaussian-process regression of star parameters over the focal plane.
//!
//! # Algorithm
//!
//! 1. Stack the training targets into an `n × n_target` matrix. When `npca > 0`
//!    project them onto the leading `npca` principal components.
//! 2. Treat each retained dimension as an independent GP over `(u, v)`:
//!    subtract its mean, optionally maximise the log marginal likelihood over
//!    the kernel's free hyperparameters, then solve `(K + εI) α = y` by
//!    Cholesky.
//! 3. Predict with the posterior mean `mean + K(x*, X) α` and, with PCA,
//!    map back to full parameter space.
//!
//! A dimension with zero variance gets a constant predictor and no kernel
//! fit.

pub mod kernel;
pub mod pca;

use std::f64::consts::PI;

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use tracing::debug;

use self::kernel::{Kernel, Point};
use self::pca::Pca;
use super::{record_param_len, require_samples, training_param_len, Interp, InterpKind};
use crate::error::{PsfError, Result};
use crate::optimize::{BoundedMinimizer, NelderMead, NelderMeadConfig};
use crate::persist::{Table, TableStore};
use crate::star::Star;

const LAYOUT_VERSION: i64 = 1;

/// Diagonal jitter added to every training covariance.
pub const JITTER: f64 = 1e-10;

/// Configuration for [`RegressionInterp`].
///
/// The default kernel `1 * RBF(0.3, (0.1, 1e3)) + WhiteKernel(1e-5, (1e-7, 0.1))`
/// is a starting point for the optimiser. Its unit amplitude is far above the
/// spread of typical PSF parameters, so with `optimize = false` it all but
/// interpolates the training fits and carries their measurement noise into
/// every prediction. Without the optimiser, pass a kernel whose amplitude is
/// of the order of the parameter variance and whose `WhiteKernel` level is
/// of the order of the fit noise variance.
#[derive(Debug, Clone)]
pub struct GpConfig {
    /// Requested kernel, also the starting point of the optimiser.
    pub kernel: Kernel,
    /// Number of principal components to regress; 0 regresses every
    /// parameter directly.
    pub npca: usize,
    /// Maximise the log marginal likelihood per dimension.
    pub optimize: bool,
    pub optimizer: NelderMeadConfig,
    /// Function-call budget per dimension. Default 500.
    pub max_calls: usize,
}

impl Default for GpConfig {
    fn default() -> Self {
        Self {
            kernel: Kernel::constant(1.0) * Kernel::rbf(0.3).bounded(1e-1, 1e3)
                + Kernel::white(1e-5).bounded(1e-7, 1e-1),
            npca: 0,
            optimize: false,
            optimizer: NelderMeadConfig::default(),
            max_calls: 500,
        }
    }
}

/// Solved regression state.
#[derive(Debug, Clone)]
struct GpState {
    x: Vec<Point>,
    /// Per retained dimension.
    means: Vec<f64>,
    kernels: Vec<Kernel>,
    /// `n × n_dims`.
    alpha: DMatrix<f64>,
    pca: Option<Pca>,
}

/// Gaussian-process interpolator.
#[derive(Debug, Clone)]
pub struct RegressionInterp {
    config: GpConfig,
    n_target: Option<usize>,
    state: Option<GpState>,
}

impl RegressionInterp {
    pub fn new(config: GpConfig) -> Result<Self> {
        if config.optimize && config.kernel.contains_explicit() {
            return Err(PsfError::Configuration(
                "an explicit covariance table has no hyperparameters to optimise".into(),
            ));
        }
        Ok(Self {
            config,
            n_target: None,
            state: None,
        })
    }

    pub fn config(&self) -> &GpConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Kernel {
        &self.config.kernel
    }

    /// Kernel used for each retained dimension after optimisation.
    pub fn fitted_kernels(&self) -> Option<&[Kernel]> {
        self.state.as_ref().map(|s| s.kernels.as_slice())
    }

    pub fn training_points(&self) -> Option<&[Point]> {
        self.state.as_ref().map(|s| s.x.as_slice())
    }

    pub fn target_means(&self) -> Option<&[f64]> {
        self.state.as_ref().map(|s| s.means.as_slice())
    }

    pub fn alpha(&self) -> Option<&DMatrix<f64>> {
        self.state.as_ref().map(|s| &s.alpha)
    }

    pub fn pca(&self) -> Option<&Pca> {
        self.state.as_ref().and_then(|s| s.pca.as_ref())
    }

    /// Training covariance `K(X, X)` of retained dimension `dim`.
    pub fn training_covariance(&self, dim: usize) -> Option<DMatrix<f64>> {
        let s = self.state.as_ref()?;
        s.kernels.get(dim).map(|k| k.matrix(&s.x))
    }

    fn n_retained(&self, n_target: usize) -> usize {
        if self.config.npca > 0 {
            self.config.npca
        } else {
            n_target
        }
    }

    /// Regress one dimension: optional hyperparameter search, then alpha.
    fn fit_dimension(&self, dim: usize, x: &[Point], y: &DVector<f64>) -> Result<(Kernel, DVector<f64>)> {
        let mut kernel = self.config.kernel.clone();
        let theta0 = kernel.theta();
        if self.config.optimize && !theta0.is_empty() {
            let bounds = kernel.bounds();
            let base = kernel.clone();
            let mut objective = |theta: &[f64]| -> f64 {
                base.with_theta(theta)
                    .and_then(|k| log_marginal_likelihood(&k, x, y))
                    .map(|(lml, _)| -lml)
                    .unwrap_or(f64::INFINITY)
            };
            let mut nm = NelderMead::new(self.config.optimizer.clone());
            let out = nm.minimize(&mut objective, &theta0, &bounds, self.config.max_calls);
            kernel = base.with_theta(&out.x)?;
            debug!(
                "GP dim {}: optimised kernel {} (lml={:.6}, {} calls, converged={})",
                dim, kernel, -out.f, out.calls, out.converged
            );
        }
        let (lml, alpha) = log_marginal_likelihood(&kernel, x, y)?;
        debug!("GP dim {}: log marginal likelihood {:.6}", dim, lml);
        Ok((kernel, alpha))
    }
}

/// Log marginal likelihood of zero-mean targets `y` and the corresponding
/// regression weights `α = (K + εI)⁻¹ y`.
pub fn log_marginal_likelihood(
    kernel: &Kernel,
    x: &[Point],
    y: &DVector<f64>,
) -> Result<(f64, DVector<f64>)> {
    let n = x.len();
    let mut k = kernel.matrix(x);
    for i in 0..n {
        k[(i, i)] += JITTER;
    }
    let chol: Cholesky<f64, Dyn> = Cholesky::new(k).ok_or_else(|| {
        PsfError::LinearAlgebra(format!("kernel matrix not positive definite for {kernel}"))
    })?;
    let alpha = chol.solve(y);
    let log_det: f64 = chol.l_dirty().diagonal().iter().map(|d| 2.0 * d.ln()).sum();
    let lml = -0.5 * y.dot(&alpha) - 0.5 * log_det - 0.5 * n as f64 * (2.0 * PI).ln();
    Ok((lml, alpha))
}

impl Interp for RegressionInterp {
    fn kind(&self) -> InterpKind {
        InterpKind::Gp
    }

    fn initialize(&mut self, stars: &[Star]) -> Result<()> {
        let found = training_param_len(stars, false)?;
        if let Some(n) = found {
            if self.config.npca > n {
                return Err(PsfError::Configuration(format!(
                    "npca = {} exceeds the {n} parameters per star",
                    self.config.npca
                )));
            }
        }
        record_param_len(&mut self.n_target, found)
    }

    fn solve(&mut self, stars: &[Star]) -> Result<()> {
        training_param_len(stars, true)?;
        self.initialize(stars)?;
        let n_target = self.n_target.unwrap_or(0);
        let n_retained = self.n_retained(n_target);
        require_samples(n_retained + 1, stars.len())?;

        let n = stars.len();
        let x: Vec<Point> = stars.iter().map(|s| [s.data.u, s.data.v]).collect();
        let mut y = DMatrix::zeros(n, n_target);
        for (i, star) in stars.iter().enumerate() {
            for (j, p) in star.params()?.iter().enumerate() {
                y[(i, j)] = *p;
            }
        }

        let (z, pca) = if self.config.npca > 0 {
            let pca = Pca::fit(&y, self.config.npca)?;
            (pca.transform(&y), Some(pca))
        } else {
            (y, None)
        };

        let mut means = Vec::with_capacity(n_retained);
        let mut kernels = Vec::with_capacity(n_retained);
        let mut alpha = DMatrix::zeros(n, n_retained);
        for d in 0..n_retained {
            let col = z.column(d);
            let mean = col.mean();
            let centered = col.add_scalar(-mean);
            let spread = centered.amax();
            if spread <= 1e-12 * (1.0 + mean.abs()) {
                debug!("GP dim {}: zero variance, constant predictor {:.6e}", d, mean);
                means.push(mean);
                kernels.push(self.config.kernel.clone());
                continue;
            }
            let (kernel, a) = self.fit_dimension(d, &x, &centered.into_owned())?;
            alpha.set_column(d, &a);
            means.push(mean);
            kernels.push(kernel);
        }

        debug!(
            "GP solved: {} stars, {} targets, {} regressed dimensions",
            n, n_target, n_retained
        );
        self.state = Some(GpState {
            x,
            means,
            kernels,
            alpha,
            pca,
        });
        Ok(())
    }

    fn interpolate(&self, star: &Star) -> Result<Star> {
        let mut out = self.interpolate_list(std::slice::from_ref(star))?;
        out.pop().ok_or(PsfError::NotSolved)
    }

    fn interpolate_list(&self, stars: &[Star]) -> Result<Vec<Star>> {
        let state = self.state.as_ref().ok_or(PsfError::NotSolved)?;
        let query: Vec<Point> = stars.iter().map(|s| [s.data.u, s.data.v]).collect();

        let mut reduced = DMatrix::zeros(query.len(), state.means.len());
        for (d, kernel) in state.kernels.iter().enumerate() {
            let ks = kernel.cross(&query, &state.x);
            let pred = ks * state.alpha.column(d);
            for i in 0..query.len() {
                reduced[(i, d)] = state.means[d] + pred[i];
            }
        }

        Ok(stars
            .iter()
            .enumerate()
            .map(|(i, star)| {
                let z: Vec<f64> = reduced.row(i).iter().copied().collect();
                let params = match &state.pca {
                    Some(pca) => pca.inverse(&z),
                    None => z,
                };
                star.with_fit_params(params)
            })
            .collect())
    }

    fn write(&self, store: &mut TableStore, name: &str) -> Result<()> {
        let state = self.state.as_ref().ok_or(PsfError::NotSolved)?;
        let cfg = &self.config;
        let mut t = Table::with_header(InterpKind::Gp.as_str(), LAYOUT_VERSION);
        t.set_i64("n_target", vec![self.n_target.unwrap_or(0) as i64]);
        t.set_i64("npca", vec![cfg.npca as i64]);
        t.set_i64("optimize", vec![cfg.optimize as i64]);
        t.set_i64("max_calls", vec![cfg.max_calls as i64]);
        t.set_f64(
            "optimizer",
            vec![cfg.optimizer.initial_step, cfg.optimizer.sd_tolerance],
        );

        cfg.kernel.write_columns(&mut t, "kernel");
        t.set_f64("theta", cfg.kernel.theta());
        t.set_i64("n_dims", vec![state.kernels.len() as i64]);
        let n_theta = cfg.kernel.n_theta();
        let mut theta_fit = DMatrix::zeros(state.kernels.len(), n_theta);
        for (d, k) in state.kernels.iter().enumerate() {
            k.write_columns(&mut t, &format!("kernel_fit_{d}"));
            for (j, v) in k.theta().into_iter().enumerate() {
                theta_fit[(d, j)] = v;
            }
        }
        t.set_matrix("theta_fit", &theta_fit);

        let x = DMatrix::from_fn(state.x.len(), 2, |i, j| state.x[i][j]);
        t.set_matrix("X", &x);
        t.set_f64("means", state.means.clone());
        t.set_matrix("alpha", &state.alpha);
        if let Some(pca) = &state.pca {
            t.set_f64("pca_mean", pca.mean.iter().copied().collect());
            t.set_matrix("pca_components", &pca.components);
        }
        store.write_table(name, t);
        Ok(())
    }

    fn read(store: &TableStore, name: &str) -> Result<Self> {
        let t = store.table(name)?;
        t.expect_header(InterpKind::Gp.as_str(), LAYOUT_VERSION)?;
        let bad = |msg: String| PsfError::Serialization(format!("GP table '{name}': {msg}"));
        let opt = match t.get_f64("optimizer")? {
            [step, sd] => NelderMeadConfig {
                initial_step: *step,
                sd_tolerance: *sd,
            },
            _ => return Err(bad("malformed optimizer column".into())),
        };
        let config = GpConfig {
            kernel: Kernel::read_columns(t, "kernel")?,
            npca: t.scalar_usize("npca")?,
            optimize: t.scalar_i64("optimize")? != 0,
            optimizer: opt,
            max_calls: t.scalar_usize("max_calls")?,
        };
        let n_target = t.scalar_usize("n_target")?;
        if config.npca > n_target {
            return Err(bad(format!(
                "npca = {} exceeds {n_target} parameters",
                config.npca
            )));
        }

        let n_dims = t.scalar_usize("n_dims")?;
        let expected_dims = if config.npca > 0 { config.npca } else { n_target };
        if n_dims != expected_dims {
            return Err(bad(format!(
                "{n_dims} regressed dimensions, expected {expected_dims}"
            )));
        }
        let kernels = (0..n_dims)
            .map(|d| Kernel::read_columns(t, &format!("kernel_fit_{d}")))
            .collect::<Result<Vec<_>>>()?;
        let xm = t.get_matrix("X")?;
        if xm.ncols() != 2 {
            return Err(bad(format!("X has {} columns, expected 2", xm.ncols())));
        }
        let x: Vec<Point> = (0..xm.nrows()).map(|i| [xm[(i, 0)], xm[(i, 1)]]).collect();
        let means = t.get_f64("means")?.to_vec();
        let alpha = t.get_matrix("alpha")?;
        if alpha.nrows() != x.len() || alpha.ncols() != n_dims || means.len() != n_dims {
            return Err(bad("inconsistent dimensions".into()));
        }
        let pca = if config.npca > 0 {
            let pca = Pca {
                mean: DVector::from_column_slice(t.get_f64("pca_mean")?),
                components: t.get_matrix("pca_components")?,
            };
            if pca.mean.len() != n_target
                || pca.components.nrows() != config.npca
                || pca.components.ncols() != n_target
            {
                return Err(bad("PCA basis does not match the parameter count".into()));
            }
            Some(pca)
        } else {
            None
        };

        Ok(Self {
            config,
            n_target: Some(n_target),
            state: Some(GpState {
                x,
                means,
                kernels,
                alpha,
                pca,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::star::StarData;

    fn field_stars(n: usize) -> Vec<Star> {
        (0..n)
            .map(|i| {
                let u = (i as f64 * 0.618).fract();
                let v = (i as f64 * 0.7549 + 0.1).fract();
                Star::with_params(
                    StarData::new(u, v),
                    vec![0.5 + 0.1 * (2.0 * u).sin(), 0.02 * v, -0.01 * u * v],
                )
            })
            .collect()
    }

    #[test]
    fn test_reproduces_training_points() {
        let stars = field_stars(30);
        let mut gp = RegressionInterp::new(GpConfig::default()).unwrap();
        gp.solve(&stars).unwrap();
        for s in &stars {
            let p = gp.interpolate(s).unwrap();
            for (a, b) in p.params().unwrap().iter().zip(s.params().unwrap()) {
                assert!((a - b).abs() < 1e-3, "{a} vs {b}");
            }
        }
    }

    #[test]
    fn test_explicit_kernel_with_optimizer_rejected() {
        let table = kernel::TabulatedCovariance::from_fn(1.0, 3, |_, _| 1.0).unwrap();
        let cfg = GpConfig {
            kernel: Kernel::explicit(table),
            optimize: true,
            ..Default::default()
        };
        assert!(matches!(
            RegressionInterp::new(cfg),
            Err(PsfError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_variance_dimension() {
        let stars: Vec<Star> = field_stars(12)
            .into_iter()
            .map(|s| {
                let mut p = s.params().unwrap().to_vec();
                p[1] = 0.25;
                s.with_fit_params(p)
            })
            .collect();
        let mut gp = RegressionInterp::new(GpConfig::default()).unwrap();
        gp.solve(&stars).unwrap();
        let q = Star::new(StarData::new(0.33, 0.77));
        let p = gp.interpolate(&q).unwrap();
        assert_eq!(p.params().unwrap()[1], 0.25);
        assert!(gp.alpha().unwrap().column(1).iter().all(|&a| a == 0.0));
    }

    #[test]
    fn test_minimum_samples() {
        let stars = field_stars(3);
        let mut gp = RegressionInterp::new(GpConfig::default()).unwrap();
        assert!(matches!(
            gp.solve(&stars),
            Err(PsfError::InsufficientData { required: 4, got: 3 })
        ));
        let mut gp = RegressionInterp::new(GpConfig {
            npca: 1,
            ..Default::default()
        })
        .unwrap();
        assert!(gp.solve(&stars[..2]).is_ok());
    }

    #[test]
    fn test_optimizer_stays_in_bounds() {
        let stars = field_stars(25);
        let mut gp = RegressionInterp::new(GpConfig {
            optimize: true,
            max_calls: 200,
            ..Default::default()
        })
        .unwrap();
        gp.solve(&stars).unwrap();
        for k in gp.fitted_kernels().unwrap() {
            for (t, b) in k.theta().iter().zip(k.bounds()) {
                assert!(*t >= b.lower - 1e-12 && *t <= b.upper + 1e-12);
            }
        }
    }

    #[test]
    fn test_read_rejects_corrupt_counts() {
        let stars = field_stars(12);
        let mut gp = RegressionInterp::new(GpConfig {
            npca: 2,
            ..Default::default()
        })
        .unwrap();
        gp.solve(&stars).unwrap();
        let mut store = TableStore::new();
        gp.write(&mut store, "psf").unwrap();
        assert!(RegressionInterp::read(&store, "psf").is_ok());

        for (column, value) in [
            ("npca", -1),
            ("npca", 4),
            ("n_dims", 3),
            ("n_target", -5),
            ("max_calls", -1),
        ] {
            let mut t = store.table("psf").unwrap().clone();
            t.set_i64(column, vec![value]);
            let mut corrupt = TableStore::new();
            corrupt.write_table("psf", t);
            assert!(
                matches!(
                    RegressionInterp::read(&corrupt, "psf"),
                    Err(PsfError::Serialization(_))
                ),
                "{column} = {value} accepted"
            );
        }
    }

    #[test]
    fn test_not_solved() {
        let gp = RegressionInterp::new(GpConfig::default()).unwrap();
        let q = Star::new(StarData::new(0.0, 0.0));
        assert!(matches!(gp.interpolate(&q), Err(PsfError::NotSolved)));
    }
}
