//! Integration tests for the calibration loops on synthetic Gaussian star
//! fields: held-out validation of the GP interpolator, iterative
//! convergence, and the joint objective and minimisation.


use std::cell::Cell;
use std::collections::BTreeMap;

use focalpsf::model::GAUSSIAN_PARAM_NAMES;
use focalpsf::{
    calibrate_iterative, Bound, GaussianModel, GpConfig, Interp, IterativeConfig,
    JointCalibration, JointConfig, JointFitResult, JointStatus, Kernel, Model, ModeTableInterp,
    ParamUpdate, ParameterBlock, PsfError, RegressionInterp, Star, StarFit,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngExt, SeedableRng};

/// Mode table fitted to the local fits of `stars`.
fn fitted_table(model: &GaussianModel, stars: &[Star]) -> anyhow::Result<ModeTableInterp> {
    let fitted = stars
        .iter()
        .map(|s| model.fit(s))
        .collect::<focalpsf::Result<Vec<_>>>()?;
    let mut table = ModeTableInterp::new(&GAUSSIAN_PARAM_NAMES)?;
    table.solve(&fitted)?;
    Ok(table)
}

fn fit_flux(star: &Star) -> f64 {
    star.fit.as_ref().map_or(f64::NAN, |f| f.flux)
}

/// Noisy training stars over the whole field, noiseless held-out stars in its
/// central half. Each held-out star is fitted and refluxed, predicted by the
/// GP, and the prediction refluxed against the held-out image: the flux must
/// agree to 3e-3 and the redrawn image to 1% of the peak.
#[test]
fn test_gp_validates_on_held_out_stars() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let mut rng = StdRng::seed_from_u64(2024);
    let model = GaussianModel::default();

    let training = test_stars::random_positions(80, &mut rng)
        .into_iter()
        .map(|(u, v)| {
            let flux = 100.0 + 50.0 * rng.random::<f64>();
            test_stars::observed_star(u, v, flux, 0.03, &mut rng)
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let fitted = training
        .iter()
        .map(|s| model.fit(s))
        .collect::<focalpsf::Result<Vec<_>>>()?;

    let held_out = test_stars::random_positions(12, &mut rng)
        .into_iter()
        .map(|(u, v)| test_stars::observed_star(0.5 * u, 0.5 * v, 1.0, 0.0, &mut rng))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let s0 = held_out
        .iter()
        .map(|s| model.fit(s))
        .collect::<focalpsf::Result<Vec<_>>>()?;

    // Without the optimiser the kernel has to carry the parameter scale and
    // the fit noise itself.
    let tuned = Kernel::constant(1e-3) * Kernel::rbf(0.8) + Kernel::white(1e-5);

    for npca in [0, 5] {
        for optimize in [false, true] {
            let kernel = if optimize {
                GpConfig::default().kernel
            } else {
                tuned.clone()
            };
            let mut gp = RegressionInterp::new(GpConfig {
                kernel,
                npca,
                optimize,
                max_calls: 300,
                ..Default::default()
            })?;
            gp.solve(&fitted)?;

            for (s0, s1) in s0.iter().zip(gp.interpolate_list(&s0)?) {
                let s1 = model.reflux(&s1)?;
                let (f0, f1) = (fit_flux(s0), fit_flux(&s1));
                assert!(
                    ((f1 - f0) / f0).abs() < 3e-3,
                    "npca={npca} optimize={optimize}: flux {f1} vs {f0}"
                );

                let image0 = &s0.stamp()?.pixels;
                let drawn = model.draw(&s1)?;
                let image1 = &drawn.stamp()?.pixels;
                let peak = image0.iter().fold(0.0_f64, |m, p| m.max(p.abs()));
                let worst = image0
                    .iter()
                    .zip(image1)
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0_f64, f64::max);
                assert!(
                    worst < 0.01 * peak,
                    "npca={npca} optimize={optimize}: image differs by {worst} (peak {peak})"
                );
            }
        }
    }
    Ok(())
}

#[test]
fn test_iterative_gp_calibration_converges() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let mut rng = StdRng::seed_from_u64(11);
    let noise = 0.05;
    let stars = test_stars::random_positions(30, &mut rng)
        .into_iter()
        .map(|(u, v)| test_stars::observed_star(u, v, 100.0, noise, &mut rng))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let model = GaussianModel::default();
    let mut gp = RegressionInterp::new(GpConfig::default())?;
    let result = calibrate_iterative(&model, &mut gp, &stars, &IterativeConfig::default())?;

    assert!(result.converged);
    assert!(result.iterations <= 10);
    assert!(result.dropped.is_empty());
    assert_eq!(result.stars.len(), stars.len());

    let last = result.history.last().unwrap();
    let reduced = last.chisq / last.dof as f64;
    assert!(reduced < 1.5, "reduced chisq {reduced}");

    // Installed params are the interpolated ones, close to the truth.
    for s in &result.stars {
        let truth = test_stars::true_params(s.data.u, s.data.v);
        let size = s.params()?[2];
        assert!((size - truth[2]).abs() < 1e-2, "size {size} vs {}", truth[2]);
        let flux = s.fit.as_ref().map(|f| f.flux).unwrap_or(0.0);
        assert!((flux - 100.0).abs() < 2.0, "flux {flux}");
    }
    Ok(())
}

/// Fits `[u]` with a chi-square that grows tenfold on every call.
struct DivergingModel {
    chisq: Cell<f64>,
}

impl Model for DivergingModel {
    fn fit(&self, star: &Star) -> focalpsf::Result<Star> {
        let mut fit = StarFit::new(vec![star.data.u]);
        fit.chisq = Some(self.chisq.get());
        fit.dof = Some(1);
        self.chisq.set(self.chisq.get() * 10.0);
        Ok(star.with_fit(fit))
    }

    fn reflux(&self, star: &Star) -> focalpsf::Result<Star> {
        Ok(star.clone())
    }

    fn draw(&self, star: &Star) -> focalpsf::Result<Star> {
        Ok(star.clone())
    }
}

#[test]
fn test_iterative_stops_after_max_iterations() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(3);
    let stars: Vec<Star> = test_stars::random_positions(10, &mut rng)
        .into_iter()
        .map(|(u, v)| test_stars::blank_star(u, v, 1.0))
        .collect();
    let model = DivergingModel {
        chisq: Cell::new(1.0),
    };
    let mut interp = focalpsf::ExactNeighborInterp::new(2)?;
    let result = calibrate_iterative(&model, &mut interp, &stars, &IterativeConfig::default())?;
    assert!(!result.converged);
    assert_eq!(result.iterations, 10);
    assert_eq!(result.history.len(), 10);
    Ok(())
}

#[test]
fn test_joint_is_independent_of_star_order() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let mut rng = StdRng::seed_from_u64(17);
    let stars = test_stars::observed_field(8, 50.0, &mut rng)?;
    let model = GaussianModel::default();
    let table = fitted_table(&model, &stars)?;
    let (names, coeffs) = (table.parameter_names(), table.parameter_values());
    let start = ParamUpdate::new().set("size", 0.02).set("g1", -0.01);
    let config = JointConfig {
        max_calls: 120,
        ..Default::default()
    };

    let mut order = stars.clone();
    let mut reference: Option<(f64, JointFitResult)> = None;
    for round in 0..6 {
        if round > 0 {
            order.shuffle(&mut rng);
        }
        // Same coefficients in every round, whatever order they were fitted in.
        let mut table = ModeTableInterp::new(&GAUSSIAN_PARAM_NAMES)?;
        table.apply(&ParamUpdate::from_values(&names, &coeffs))?;
        let mut joint = JointCalibration::new(model.clone(), table, order.clone(), config.clone())?;
        joint.apply_update(&start)?;

        let objective = joint.objective()?;
        let result = joint.fit()?;
        match &reference {
            None => reference = Some((objective, result)),
            Some((objective0, result0)) => {
                assert_eq!(objective.to_bits(), objective0.to_bits(), "round {round}");
                assert_eq!(&result, result0, "round {round}");
            }
        }
    }
    Ok(())
}

#[test]
fn test_joint_partial_update() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(23);
    let stars = test_stars::observed_field(6, 50.0, &mut rng)?;
    let model = GaussianModel::default();
    let mut joint = JointCalibration::new(
        model.clone(),
        fitted_table(&model, &stars)?,
        stars,
        JointConfig::default(),
    )?;

    let names = joint.parameter_names();
    assert_eq!(&names[..3], &["size", "g1", "g2"]);
    assert_eq!(names.len(), 3 + 3 * GAUSSIAN_PARAM_NAMES.len());

    let before = joint.parameter_values();
    joint.apply_update(
        &ParamUpdate::new()
            .set("g1", 0.01)
            .keep("size")
            .set("size_x", 0.2),
    )?;
    let after = joint.parameter_values();
    for (i, name) in names.iter().enumerate() {
        match name.as_str() {
            "g1" => assert_eq!(after[i], 0.01),
            "size_x" => assert_eq!(after[i], 0.2),
            _ => assert_eq!(after[i], before[i], "{name} changed"),
        }
    }
    assert_eq!(joint.model().parameter_values(), vec![0.0, 0.01, 0.0]);

    // One unknown name rejects the whole update.
    let err = joint.apply_update(&ParamUpdate::new().set("size", 0.3).set("bogus", 1.0));
    assert!(matches!(err, Err(PsfError::Configuration(_))));
    assert_eq!(joint.parameter_values(), after);
    Ok(())
}

#[test]
fn test_joint_budget_exhaustion_installs_best_iterate() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let mut rng = StdRng::seed_from_u64(31);
    let stars = test_stars::observed_field(8, 50.0, &mut rng)?;
    let model = GaussianModel::default();
    let mut table = fitted_table(&model, &stars)?;
    // Start away from the solution.
    table.apply(&ParamUpdate::new().set("size_d", 0.45).set("g1_x", 0.0))?;

    let mut bounds = BTreeMap::new();
    bounds.insert("size".to_string(), Bound::new(-0.01, 0.01));
    let config = JointConfig {
        max_calls: 30,
        bounds,
        ..Default::default()
    };
    let mut joint = JointCalibration::new(model, table, stars, config)?;
    let initial = joint.objective()?;

    let result = joint.fit()?;
    assert_eq!(result.status, JointStatus::BudgetExhausted);
    assert!(result.calls <= 30);
    assert!(result.chisq <= initial, "{} > {initial}", result.chisq);

    // The best iterate is what is installed.
    assert_eq!(joint.parameter_values(), result.x);
    assert_eq!(joint.objective()?, result.chisq);
    let size = result.value("size").unwrap();
    assert!((-0.01..=0.01).contains(&size));

    assert!(matches!(
        result.ensure_converged(),
        Err(PsfError::OptimizerNonConvergence { .. })
    ));
    Ok(())
}
