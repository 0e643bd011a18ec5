//! Integration tests for the interpolators: recovery at training positions,
//! target selection, tabulated kernels, and persistence through the table
//! store.


use focalpsf::interp::gp::kernel::TabulatedCovariance;
use focalpsf::{
    read_interp, ExactNeighborInterp, GpConfig, Interp, InterpKind, Kernel, ModeTableInterp,
    RegressionInterp, Star, StarData, TableStore,
};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

/// Training stars carrying arbitrary 3-vectors at random positions.
fn random_training_set(n: usize, rng: &mut StdRng) -> Vec<Star> {
    test_stars::random_positions(n, rng)
        .into_iter()
        .map(|(u, v)| {
            let params = vec![rng.random::<f64>(), rng.random::<f64>(), rng.random::<f64>()];
            Star::with_params(StarData::new(u, v), params)
        })
        .collect()
}

/// Training stars whose parameters vary smoothly over the focal plane.
fn smooth_training_set(n: usize, rng: &mut StdRng) -> Vec<Star> {
    test_stars::random_positions(n, rng)
        .into_iter()
        .map(|(u, v)| Star::with_params(StarData::new(u, v), test_stars::true_params(u, v)))
        .collect()
}

fn query_stars(n: usize, rng: &mut StdRng) -> Vec<Star> {
    test_stars::random_positions(n, rng)
        .into_iter()
        .map(|(u, v)| Star::new(StarData::new(u, v)))
        .collect()
}

#[test]
fn test_knn_exact_recovery() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let mut rng = StdRng::seed_from_u64(42);
    let stars = random_training_set(100, &mut rng);

    let mut knn = ExactNeighborInterp::new(1)?;
    knn.solve(&stars)?;
    for star in &stars {
        let predicted = knn.interpolate(star)?;
        assert_eq!(predicted.params()?, star.params()?);
        assert_eq!(predicted.data, star.data);
    }
    Ok(())
}

#[test]
fn test_knn_target_subset_and_disk_roundtrip() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let mut rng = StdRng::seed_from_u64(7);
    let stars = random_training_set(60, &mut rng);
    let queries = query_stars(20, &mut rng);

    let mut full = ExactNeighborInterp::new(4)?;
    full.solve(&stars)?;
    let mut subset = ExactNeighborInterp::new(4)?.build(&["u", "v"], Some(&[1]));
    subset.solve(&stars)?;
    assert_eq!(subset.training_targets().map(|y| y.ncols()), Some(1));

    for q in &queries {
        let all = full.interpolate(q)?;
        let one = subset.interpolate(q)?;
        assert_eq!(one.params()?.to_vec(), vec![all.params()?[1]]);
    }

    // ── Through a file ──
    let path = std::env::temp_dir().join(format!("focalpsf_knn_{}.rkyv", std::process::id()));
    let mut store = TableStore::new();
    subset.write(&mut store, "psf")?;
    store.save_to_file(&path)?;
    let loaded = TableStore::load_from_file(&path)?;
    std::fs::remove_file(&path)?;

    let back = read_interp(&loaded, "psf")?;
    assert_eq!(back.kind(), InterpKind::Knn);
    for q in &queries {
        assert_eq!(back.interpolate(q)?.params()?, subset.interpolate(q)?.params()?);
    }
    Ok(())
}

#[test]
fn test_gp_roundtrip_preserves_state() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let mut rng = StdRng::seed_from_u64(1234);
    let stars = smooth_training_set(40, &mut rng);

    let mut gp = RegressionInterp::new(GpConfig {
        optimize: true,
        max_calls: 150,
        ..Default::default()
    })?;
    gp.solve(&stars)?;

    let mut store = TableStore::new();
    gp.write(&mut store, "psf")?;
    let store = TableStore::from_rkyv_bytes(&store.to_rkyv_bytes()?)?;
    let back = RegressionInterp::read(&store, "psf")?;

    assert_eq!(back.kernel().theta(), gp.kernel().theta());
    let fitted = gp.fitted_kernels().unwrap();
    let fitted_back = back.fitted_kernels().unwrap();
    assert_eq!(fitted.len(), 5);
    for (a, b) in fitted.iter().zip(fitted_back) {
        for (ta, tb) in a.theta().iter().zip(b.theta()) {
            assert!((ta - tb).abs() < 1e-12, "theta {ta} vs {tb}");
        }
    }
    for d in 0..5 {
        let k = gp.training_covariance(d).unwrap();
        let k_back = back.training_covariance(d).unwrap();
        assert!((k - k_back).amax() < 1e-12, "K(X, X) differs for dim {d}");
    }
    assert!((gp.alpha().unwrap() - back.alpha().unwrap()).amax() < 1e-12);
    assert_eq!(gp.training_points(), back.training_points());
    assert_eq!(gp.target_means(), back.target_means());

    for q in &query_stars(10, &mut rng) {
        let a = gp.interpolate(q)?;
        let b = back.interpolate(q)?;
        for (pa, pb) in a.params()?.iter().zip(b.params()?) {
            assert!((pa - pb).abs() < 1e-12);
        }
    }
    Ok(())
}

#[test]
fn test_gp_pca_with_parsed_kernel() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let mut rng = StdRng::seed_from_u64(99);
    let stars = smooth_training_set(50, &mut rng);

    let kernel: Kernel =
        "1.0 * AnisotropicRBF([[2.0, 0.0], [0.0, 2.0]]) + WhiteKernel(1e-6)".parse()?;
    let mut gp = RegressionInterp::new(GpConfig {
        kernel,
        npca: 4,
        ..Default::default()
    })?;
    gp.solve(&stars)?;
    assert_eq!(gp.pca().map(|p| p.n_components()), Some(4));

    // The field is spanned by (u, v, uv, v²), so four components lose nothing.
    for s in &stars {
        let p = gp.interpolate(s)?;
        for (a, b) in p.params()?.iter().zip(s.params()?) {
            assert!((a - b).abs() < 2e-3, "{a} vs {b}");
        }
    }

    let mut store = TableStore::new();
    gp.write(&mut store, "psf")?;
    let back = read_interp(&store, "psf")?;
    assert_eq!(back.kind(), InterpKind::Gp);
    let q = Star::new(StarData::new(0.25, -0.4));
    assert_eq!(back.interpolate(&q)?.params()?, gp.interpolate(&q)?.params()?);
    Ok(())
}

/// A tabulated squared exponential stands in for `RBF(0.3)` with and without
/// PCA, and the tabulated kernel survives the table store unchanged.
#[test]
fn test_gp_explicit_kernel() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let mut rng = StdRng::seed_from_u64(314);
    let stars = smooth_training_set(50, &mut rng);
    let table = TabulatedCovariance::from_fn(2.0, 201, |du, dv| {
        (-0.5 * (du * du + dv * dv) / (0.3 * 0.3)).exp()
    })?;
    let kernel = Kernel::explicit(table) + Kernel::white(1e-5);

    for npca in [0, 4] {
        let mut gp = RegressionInterp::new(GpConfig {
            kernel: kernel.clone(),
            npca,
            ..Default::default()
        })?;
        gp.solve(&stars)?;

        for s in &stars {
            let p = gp.interpolate(s)?;
            for (a, b) in p.params()?.iter().zip(s.params()?) {
                assert!((a - b).abs() < 2e-3, "npca={npca}: {a} vs {b}");
            }
        }

        let mut store = TableStore::new();
        gp.write(&mut store, "psf")?;
        let store = TableStore::from_rkyv_bytes(&store.to_rkyv_bytes()?)?;
        let back = RegressionInterp::read(&store, "psf")?;
        assert_eq!(back.kernel(), gp.kernel());
        assert_eq!(back.fitted_kernels(), gp.fitted_kernels());
        for q in &query_stars(10, &mut rng) {
            assert_eq!(back.interpolate(q)?.params()?, gp.interpolate(q)?.params()?);
        }
    }
    Ok(())
}

#[test]
fn test_read_interp_dispatch() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(5);
    let stars = smooth_training_set(20, &mut rng);
    let mut store = TableStore::new();

    let mut knn = ExactNeighborInterp::new(3)?;
    knn.solve(&stars)?;
    knn.write(&mut store, "knn")?;

    let mut gp = RegressionInterp::new(GpConfig::default())?;
    gp.solve(&stars)?;
    gp.write(&mut store, "gp")?;

    let mut table = ModeTableInterp::new(&["du", "dv", "size", "g1", "g2"])?;
    table.solve(&stars)?;
    table.write(&mut store, "table")?;

    for (name, kind) in [
        ("knn", InterpKind::Knn),
        ("gp", InterpKind::Gp),
        ("table", InterpKind::ModeTable),
    ] {
        assert_eq!(read_interp(&store, name)?.kind(), kind);
    }
    assert!(read_interp(&store, "missing").is_err());
    Ok(())
}
