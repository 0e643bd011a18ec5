//! Alternating calibration: local per-star fits, then a global interpolant.
//!
//! # Algorithm
//!
//! 1. INIT: initialise the interpolator with the input stars and take the
//!    starting chi-square from their existing fits.
//! 2. REFIT: fit every star independently with the model.
//! 3. SOLVE: train the interpolator on the refit stars.
//! 4. INSTALL: replace each star's params with the interpolated prediction,
//!    then re-fit its flux.
//! 5. CHECK: stop once the total chi-square changes by less than `dof / 10`
//!    (and the previous value was positive) or after `max_iterations`.

use tracing::{debug, info};

use crate::error::{PsfError, Result};
use crate::interp::Interp;
use crate::model::Model;
use crate::star::Star;

/// What to do when a star's local fit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitFailurePolicy {
    /// Remove the star from the working set and record it as dropped.
    #[default]
    Drop,
    /// Return the error.
    Abort,
}

/// Configuration for [`calibrate_iterative`].
#[derive(Debug, Clone)]
pub struct IterativeConfig {
    /// Default 10.
    pub max_iterations: usize,
    pub fit_failure: FitFailurePolicy,
}

impl Default for IterativeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            fit_failure: FitFailurePolicy::Drop,
        }
    }
}

/// Totals after one pass of the loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationRecord {
    pub iteration: usize,
    pub chisq: f64,
    pub dof: usize,
    pub n_stars: usize,
}

/// Outcome of [`calibrate_iterative`].
#[derive(Debug, Clone)]
pub struct IterativeResult {
    /// Surviving stars with interpolated, refluxed fits, in input order.
    pub stars: Vec<Star>,
    pub converged: bool,
    pub iterations: usize,
    pub history: Vec<IterationRecord>,
    /// Input indices of stars removed by [`FitFailurePolicy::Drop`].
    pub dropped: Vec<usize>,
}

impl IterativeResult {
    pub fn final_chisq(&self) -> Option<f64> {
        self.history.last().map(|r| r.chisq)
    }
}

fn chisq_totals<'a>(stars: impl Iterator<Item = &'a Star>) -> (f64, usize) {
    stars.fold((0.0, 0), |(c, d), s| match &s.fit {
        Some(f) => (c + f.chisq.unwrap_or(0.0), d + f.dof.unwrap_or(0)),
        None => (c, d),
    })
}

/// Apply `op` to every working star, handling fit failures per `policy`.
fn for_each_star<F>(
    working: Vec<(usize, Star)>,
    policy: FitFailurePolicy,
    dropped: &mut Vec<usize>,
    stage: &str,
    mut op: F,
) -> Result<Vec<(usize, Star)>>
where
    F: FnMut(&Star) -> Result<Star>,
{
    let mut out = Vec::with_capacity(working.len());
    for (idx, star) in working {
        match op(&star) {
            Ok(s) => out.push((idx, s)),
            Err(PsfError::FitFailure(msg)) if policy == FitFailurePolicy::Drop => {
                debug!("{}: dropping star {} ({})", stage, idx, msg);
                dropped.push(idx);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Run the alternating fit/interpolate loop.
pub fn calibrate_iterative<M, I>(
    model: &M,
    interp: &mut I,
    stars: &[Star],
    config: &IterativeConfig,
) -> Result<IterativeResult>
where
    M: Model + ?Sized,
    I: Interp + ?Sized,
{
    // ── INIT ──
    interp.initialize(stars)?;
    let (mut previous, _) = chisq_totals(stars.iter());
    let mut working: Vec<(usize, Star)> = stars.iter().cloned().enumerate().collect();
    let mut dropped = Vec::new();
    let mut history = Vec::new();
    let mut converged = false;

    for iteration in 0..config.max_iterations {
        // ── REFIT ──
        working = for_each_star(working, config.fit_failure, &mut dropped, "refit", |s| {
            model.fit(s)
        })?;

        // ── SOLVE ──
        let fitted: Vec<Star> = working.iter().map(|(_, s)| s.clone()).collect();
        interp.solve(&fitted)?;

        // ── INSTALL ──
        let predicted = interp.interpolate_list(&fitted)?;
        let installed: Vec<(usize, Star)> = working
            .iter()
            .map(|(i, _)| *i)
            .zip(predicted)
            .collect();
        working = for_each_star(installed, config.fit_failure, &mut dropped, "reflux", |s| {
            model.reflux(s)
        })?;

        // ── CHECK ──
        let (chisq, dof) = chisq_totals(working.iter().map(|(_, s)| s));
        history.push(IterationRecord {
            iteration,
            chisq,
            dof,
            n_stars: working.len(),
        });
        debug!(
            "iteration {}: chisq={:.6e} dof={} stars={} dropped={}",
            iteration,
            chisq,
            dof,
            working.len(),
            dropped.len()
        );

        if previous > 0.0 && (chisq - previous).abs() < dof as f64 / 10.0 {
            converged = true;
            break;
        }
        previous = chisq;
    }

    dropped.sort_unstable();
    info!(
        "iterative calibration: {} iterations, converged={}, {} stars kept, {} dropped",
        history.len(),
        converged,
        working.len(),
        dropped.len()
    );

    Ok(IterativeResult {
        stars: working.into_iter().map(|(_, s)| s).collect(),
        converged,
        iterations: history.len(),
        history,
        dropped,
    })
}
