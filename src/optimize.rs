//! Bounded minimisation with a hard budget of objective evaluations.
//!
//! Two shapes of problem come up during calibration:
//!
//! - a scalar objective, the negative log marginal likelihood of the
//!   Gaussian-process hyperparameters. It goes through the
//!   [`BoundedMinimizer`] trait, implemented by [`NelderMead`] on top of
//!   argmin's downhill simplex.
//! - a residual vector whose squared norm is the objective, as in the joint
//!   calibration. [`LeastSquares`] hands it to `levenberg_marquardt` with a
//!   forward-difference Jacobian.
//!
//! Both project every trial point into the box before evaluating it, stop
//! once the evaluation budget is spent, and report the best point evaluated
//! rather than the solver's last iterate.

use std::cell::RefCell;

use argmin::core::{CostFunction, Error as ArgminError, Executor, State, TerminationReason};
use argmin::solver::neldermead::NelderMead as SimplexSolver;
use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{storage::Owned, DMatrix, DVector, Dyn};
use tracing::debug;

/// Closed interval for one parameter. Infinite ends are allowed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    pub lower: f64,
    pub upper: f64,
}

impl Bound {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    pub fn unbounded() -> Self {
        Self {
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }

    #[inline]
    pub fn clamp(&self, x: f64) -> f64 {
        x.max(self.lower).min(self.upper)
    }

    fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

fn project(x: &[f64], bounds: &[Bound]) -> Vec<f64> {
    x.iter().zip(bounds).map(|(v, b)| b.clamp(*v)).collect()
}

/// Result of a bounded minimization.
#[derive(Debug, Clone, PartialEq)]
pub struct MinimizeOutcome {
    /// Best point evaluated.
    pub x: Vec<f64>,
    /// Objective at `x`.
    pub f: f64,
    /// Number of objective evaluations spent.
    pub calls: usize,
    /// `false` when the call budget ran out before the tolerance was met.
    pub converged: bool,
}

/// A bounded minimizer with a function-call budget.
pub trait BoundedMinimizer {
    fn minimize(
        &mut self,
        f: &mut dyn FnMut(&[f64]) -> f64,
        x0: &[f64],
        bounds: &[Bound],
        max_calls: usize,
    ) -> MinimizeOutcome;
}

// ── Evaluation budget ───────────────────────────────────────────────────────

/// Call counter and best-point record shared by both backends.
struct Budget<'a, F: ?Sized> {
    f: &'a mut F,
    bounds: &'a [Bound],
    max_calls: usize,
    calls: usize,
    best_x: Vec<f64>,
    best_f: f64,
    /// Set once the solver was refused an evaluation.
    exhausted: bool,
}

impl<'a, F: ?Sized> Budget<'a, F> {
    fn new(f: &'a mut F, bounds: &'a [Bound], max_calls: usize) -> Self {
        Self {
            f,
            bounds,
            max_calls,
            calls: 0,
            best_x: Vec::new(),
            best_f: f64::INFINITY,
            exhausted: false,
        }
    }

    fn remaining(&self) -> usize {
        self.max_calls.saturating_sub(self.calls)
    }

    /// Count a call at the projection of `x`, or refuse it when the budget
    /// is spent.
    fn admit(&mut self, x: &[f64]) -> Option<Vec<f64>> {
        if self.remaining() == 0 {
            self.exhausted = true;
            return None;
        }
        self.calls += 1;
        Some(project(x, self.bounds))
    }

    fn record(&mut self, x: Vec<f64>, value: f64) {
        let value = if value.is_nan() { f64::INFINITY } else { value };
        if value < self.best_f || self.best_x.is_empty() {
            self.best_f = value;
            self.best_x = x;
        }
    }

    fn outcome(self, converged: bool) -> MinimizeOutcome {
        MinimizeOutcome {
            x: self.best_x,
            f: self.best_f,
            calls: self.calls,
            converged,
        }
    }
}

impl<F: FnMut(&[f64]) -> f64 + ?Sized> Budget<'_, F> {
    /// Objective at the projection of `x`; NaN counts as `+∞`.
    fn eval(&mut self, x: &[f64]) -> Option<f64> {
        let x = self.admit(x)?;
        let mut v = (self.f)(&x);
        if v.is_nan() {
            v = f64::INFINITY;
        }
        self.record(x, v);
        Some(v)
    }
}

impl<F: FnMut(&[f64]) -> Option<Vec<f64>> + ?Sized> Budget<'_, F> {
    /// Residuals at the projection of `x`; `None` when the budget is spent
    /// or the residual function gave up.
    fn residuals(&mut self, x: &[f64]) -> Option<DVector<f64>> {
        let x = self.admit(x)?;
        let r = (self.f)(&x)?;
        let ssq = r.iter().map(|v| v * v).sum::<f64>();
        self.record(x, ssq);
        Some(DVector::from_vec(r))
    }
}

// ── Downhill simplex ────────────────────────────────────────────────────────

/// Configuration for [`NelderMead`].
#[derive(Debug, Clone)]
pub struct NelderMeadConfig {
    /// Initial simplex edge as a fraction of each bound's width, or of
    /// `max(|x0|, 1)` when the bound is infinite. Default 0.1.
    pub initial_step: f64,
    /// Stop when the standard deviation of the objective over the simplex
    /// falls below this. Default 1e-10.
    pub sd_tolerance: f64,
}

impl Default for NelderMeadConfig {
    fn default() -> Self {
        Self {
            initial_step: 0.1,
            sd_tolerance: 1e-10,
        }
    }
}

/// Downhill simplex minimizer with box projection.
#[derive(Debug, Clone, Default)]
pub struct NelderMead {
    pub config: NelderMeadConfig,
}

impl NelderMead {
    pub fn new(config: NelderMeadConfig) -> Self {
        Self { config }
    }

    /// `x0` plus one vertex per axis, stepped inward where the bound allows.
    fn initial_simplex(&self, x0: &[f64], bounds: &[Bound]) -> Vec<Vec<f64>> {
        let mut simplex = vec![x0.to_vec()];
        for (i, b) in bounds.iter().enumerate() {
            let step = if b.width().is_finite() {
                self.config.initial_step * b.width()
            } else {
                self.config.initial_step * x0[i].abs().max(1.0)
            };
            let mut x = x0.to_vec();
            x[i] = if x0[i] + step <= b.upper {
                x0[i] + step
            } else {
                x0[i] - step
            };
            simplex.push(x);
        }
        simplex
    }
}

struct SimplexCost<'b, 'a, F: ?Sized> {
    budget: &'b RefCell<Budget<'a, F>>,
}

impl<F: FnMut(&[f64]) -> f64 + ?Sized> CostFunction for SimplexCost<'_, '_, F> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> std::result::Result<f64, ArgminError> {
        self.budget
            .borrow_mut()
            .eval(x)
            .ok_or_else(|| ArgminError::msg("evaluation budget spent"))
    }
}

impl BoundedMinimizer for NelderMead {
    fn minimize(
        &mut self,
        f: &mut dyn FnMut(&[f64]) -> f64,
        x0: &[f64],
        bounds: &[Bound],
        max_calls: usize,
    ) -> MinimizeOutcome {
        debug_assert_eq!(x0.len(), bounds.len(), "x0 and bounds must have the same length");
        let start = project(x0, bounds);
        let budget = RefCell::new(Budget::new(f, bounds, max_calls));

        if start.is_empty() || max_calls <= 1 {
            let mut b = budget.into_inner();
            b.eval(&start);
            return b.outcome(start.is_empty());
        }

        let run = SimplexSolver::new(self.initial_simplex(&start, bounds))
            .with_sd_tolerance(self.config.sd_tolerance)
            .and_then(|solver| {
                Executor::new(SimplexCost { budget: &budget }, solver)
                    .configure(|state| state.max_iters(max_calls as u64))
                    .run()
            });
        let converged = match run {
            Ok(res) => matches!(
                res.state().get_termination_reason(),
                Some(TerminationReason::SolverConverged)
            ),
            Err(e) => {
                if !budget.borrow().exhausted {
                    debug!("Nelder-Mead stopped early: {e}");
                }
                false
            }
        };

        let outcome = budget.into_inner().outcome(converged);
        debug!(
            "Nelder-Mead: {} calls, f={:.6e}, converged={}",
            outcome.calls, outcome.f, outcome.converged
        );
        outcome
    }
}

// ── Levenberg-Marquardt ─────────────────────────────────────────────────────

/// Configuration for [`LeastSquares`].
#[derive(Debug, Clone)]
pub struct LeastSquaresConfig {
    /// Relative reduction of the sum of squares below which the fit has
    /// converged. Default 1e-8.
    pub ftol: f64,
    /// Relative step size below which the fit has converged. Default 1e-8.
    pub xtol: f64,
    /// Orthogonality of residuals and Jacobian columns. Default 1e-12.
    pub gtol: f64,
    /// Forward-difference step, relative to `max(|x|, 1)`. Default 1e-4.
    pub fd_step: f64,
}

impl Default for LeastSquaresConfig {
    fn default() -> Self {
        Self {
            ftol: 1e-8,
            xtol: 1e-8,
            gtol: 1e-12,
            fd_step: 1e-4,
        }
    }
}

/// Levenberg-Marquardt on a residual vector, with box projection and a
/// finite-difference Jacobian.
#[derive(Debug, Clone, Default)]
pub struct LeastSquares {
    pub config: LeastSquaresConfig,
}

struct ResidualProblem<'b, 'a, F: ?Sized> {
    budget: &'b RefCell<Budget<'a, F>>,
    x: DVector<f64>,
    /// Residuals at `x`, reused by the Jacobian.
    r: RefCell<Option<DVector<f64>>>,
    fd_step: f64,
}

impl<F> LeastSquaresProblem<f64, Dyn, Dyn> for ResidualProblem<'_, '_, F>
where
    F: FnMut(&[f64]) -> Option<Vec<f64>> + ?Sized,
{
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, x: &DVector<f64>) {
        let projected = project(x.as_slice(), self.budget.borrow().bounds);
        self.x = DVector::from_vec(projected);
        *self.r.get_mut() = None;
    }

    fn params(&self) -> DVector<f64> {
        self.x.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        if let Some(r) = self.r.borrow().as_ref() {
            return Some(r.clone());
        }
        let r = self.budget.borrow_mut().residuals(self.x.as_slice())?;
        *self.r.borrow_mut() = Some(r.clone());
        Some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let r0 = self.residuals()?;
        let mut budget = self.budget.borrow_mut();
        let n = self.x.len();
        if budget.remaining() < n {
            budget.exhausted = true;
            return None;
        }

        let mut jac = DMatrix::zeros(r0.len(), n);
        for j in 0..n {
            let b = budget.bounds[j];
            let xj = self.x[j];
            let h = self.fd_step * xj.abs().max(1.0);
            let stepped = if xj + h <= b.upper { xj + h } else { xj - h };
            let h = b.clamp(stepped) - xj;
            if h == 0.0 {
                continue;
            }
            let mut xp = self.x.clone();
            xp[j] += h;
            let rp = budget.residuals(xp.as_slice())?;
            if rp.len() != r0.len() {
                return None;
            }
            jac.set_column(j, &((rp - &r0) / h));
        }
        Some(jac)
    }
}

impl LeastSquares {
    pub fn new(config: LeastSquaresConfig) -> Self {
        Self { config }
    }

    /// Minimise `Σ r(x)²` inside `bounds`. The residual function returns
    /// `None` to abandon the fit; the best point seen so far is still
    /// reported.
    pub fn minimize(
        &self,
        residuals: &mut dyn FnMut(&[f64]) -> Option<Vec<f64>>,
        x0: &[f64],
        bounds: &[Bound],
        max_calls: usize,
    ) -> MinimizeOutcome {
        debug_assert_eq!(x0.len(), bounds.len(), "x0 and bounds must have the same length");
        let cfg = &self.config;
        let start = project(x0, bounds);
        let budget = RefCell::new(Budget::new(residuals, bounds, max_calls));

        let problem = ResidualProblem {
            budget: &budget,
            x: DVector::from_vec(start),
            r: RefCell::new(None),
            fd_step: cfg.fd_step,
        };
        let (solved, report) = LevenbergMarquardt::new()
            .with_ftol(cfg.ftol)
            .with_xtol(cfg.xtol)
            .with_gtol(cfg.gtol)
            .with_patience(max_calls.max(1))
            .minimize(problem);
        drop(solved);

        let converged = report.termination.was_successful() && !budget.borrow().exhausted;
        let outcome = budget.into_inner().outcome(converged);
        debug!(
            "Levenberg-Marquardt: {} calls, sum of squares {:.6e}, {:?}",
            outcome.calls, outcome.f, report.termination
        );
        outcome
    }
}
