//! Per-mode constant and linear-gradient table over the focal plane.
//!
//! For each named mode `m` the prediction at `(u, v)` is
//!
//! ```text
//! p_m(u, v) = ref_m(u, v) + d_m + x_m·u + y_m·v
//! ```
//!
//! where `ref` is an optional reference interpolant (for example a
//! nearest-neighbour table of design values). The `(d, x, y)` coefficients are
//! either fitted by linear least squares in [`solve`](Interp::solve) or set
//! directly through [`ParameterBlock`] as named values `"{mode}_d"`,
//! `"{mode}_x"` and `"{mode}_y"`.

use nalgebra::DMatrix;
use tracing::debug;

use super::{read_interp, record_param_len, require_samples, training_param_len, Interp, InterpKind};
use crate::error::{PsfError, Result};
use crate::model::{ParamUpdate, ParameterBlock};
use crate::persist::{Table, TableStore};
use crate::star::Star;

const LAYOUT_VERSION: i64 = 1;
const MIN_SAMPLES: usize = 3;
const COEFF_SUFFIXES: [&str; 3] = ["d", "x", "y"];

#[derive(Debug)]
pub struct ModeTableInterp {
    modes: Vec<String>,
    /// `n_modes × 3`, columns `[d, x, y]`.
    coeffs: DMatrix<f64>,
    reference: Option<Box<dyn Interp>>,
    solved: bool,
}

impl ModeTableInterp {
    pub fn new(modes: &[&str]) -> Result<Self> {
        if modes.is_empty() {
            return Err(PsfError::Configuration("mode table needs at least one mode".into()));
        }
        for (i, m) in modes.iter().enumerate() {
            if modes[..i].contains(m) {
                return Err(PsfError::Configuration(format!("duplicate mode '{m}'")));
            }
        }
        Ok(Self {
            modes: modes.iter().map(|m| m.to_string()).collect(),
            coeffs: DMatrix::zeros(modes.len(), 3),
            reference: None,
            solved: false,
        })
    }

    /// Add a solved reference interpolant predicting one value per mode.
    pub fn with_reference(mut self, reference: Box<dyn Interp>) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn modes(&self) -> &[String] {
        &self.modes
    }

    pub fn coefficients(&self) -> &DMatrix<f64> {
        &self.coeffs
    }

    pub fn reference(&self) -> Option<&dyn Interp> {
        self.reference.as_deref()
    }

    fn reference_params(&self, star: &Star) -> Result<Vec<f64>> {
        let Some(reference) = &self.reference else {
            return Ok(vec![0.0; self.modes.len()]);
        };
        let predicted = reference.interpolate(star)?;
        let p = predicted.params()?;
        if p.len() != self.modes.len() {
            return Err(PsfError::Configuration(format!(
                "reference interpolant predicts {} values for {} modes",
                p.len(),
                self.modes.len()
            )));
        }
        Ok(p.to_vec())
    }

    fn check_len(&self, found: Option<usize>) -> Result<()> {
        match found {
            Some(n) if n != self.modes.len() => Err(PsfError::Configuration(format!(
                "stars carry {n} parameters but the table has {} modes",
                self.modes.len()
            ))),
            _ => Ok(()),
        }
    }
}

impl Interp for ModeTableInterp {
    fn kind(&self) -> InterpKind {
        InterpKind::ModeTable
    }

    fn initialize(&mut self, stars: &[Star]) -> Result<()> {
        let found = training_param_len(stars, false)?;
        self.check_len(found)?;
        let mut n = Some(self.modes.len());
        record_param_len(&mut n, found)
    }

    fn solve(&mut self, stars: &[Star]) -> Result<()> {
        require_samples(MIN_SAMPLES, stars.len())?;
        training_param_len(stars, true)?;
        self.initialize(stars)?;

        let n = stars.len();
        let n_modes = self.modes.len();
        let mut a_mat = DMatrix::zeros(n, 3);
        let mut b_mat = DMatrix::zeros(n, n_modes);
        for (row, star) in stars.iter().enumerate() {
            a_mat[(row, 0)] = 1.0;
            a_mat[(row, 1)] = star.data.u;
            a_mat[(row, 2)] = star.data.v;
            let reference = self.reference_params(star)?;
            for (m, (p, r)) in star.params()?.iter().zip(&reference).enumerate() {
                b_mat[(row, m)] = p - r;
            }
        }

        let svd = a_mat.svd(true, true);
        let sol = svd
            .solve(&b_mat, 1e-12)
            .map_err(|e| PsfError::LinearAlgebra(format!("mode table least squares: {e}")))?;
        self.coeffs = sol.transpose();
        self.solved = true;
        debug!("mode table solved: {} stars, {} modes", n, n_modes);
        Ok(())
    }

    fn interpolate(&self, star: &Star) -> Result<Star> {
        if !self.solved {
            return Err(PsfError::NotSolved);
        }
        let (u, v) = (star.data.u, star.data.v);
        let params: Vec<f64> = self
            .reference_params(star)?
            .into_iter()
            .enumerate()
            .map(|(m, r)| r + self.coeffs[(m, 0)] + self.coeffs[(m, 1)] * u + self.coeffs[(m, 2)] * v)
            .collect();
        Ok(star.with_fit_params(params))
    }

    fn write(&self, store: &mut TableStore, name: &str) -> Result<()> {
        if !self.solved {
            return Err(PsfError::NotSolved);
        }
        let mut t = Table::with_header(InterpKind::ModeTable.as_str(), LAYOUT_VERSION);
        t.set_str("modes", self.modes.clone());
        t.set_matrix("coeffs", &self.coeffs);
        let ref_name = format!("{name}_reference");
        match &self.reference {
            Some(r) => {
                t.set_i64("has_reference", vec![1]);
                r.write(store, &ref_name)?;
            }
            None => {
                t.set_i64("has_reference", vec![0]);
                store.remove_table(&ref_name);
            }
        }
        store.write_table(name, t);
        Ok(())
    }

    fn read(store: &TableStore, name: &str) -> Result<Self> {
        let t = store.table(name)?;
        t.expect_header(InterpKind::ModeTable.as_str(), LAYOUT_VERSION)?;
        let modes = t.get_str("modes")?.to_vec();
        let coeffs = t.get_matrix("coeffs")?;
        if coeffs.shape() != (modes.len(), 3) {
            return Err(PsfError::Serialization(format!(
                "mode table '{name}' has coefficient shape {:?} for {} modes",
                coeffs.shape(),
                modes.len()
            )));
        }
        let reference = if t.scalar_i64("has_reference")? != 0 {
            Some(read_interp(store, &format!("{name}_reference"))?)
        } else {
            None
        };
        Ok(Self {
            modes,
            coeffs,
            reference,
            solved: true,
        })
    }
}

impl ParameterBlock for ModeTableInterp {
    fn parameter_names(&self) -> Vec<String> {
        self.modes
            .iter()
            .flat_map(|m| COEFF_SUFFIXES.iter().map(move |s| format!("{m}_{s}")))
            .collect()
    }

    fn parameter_values(&self) -> Vec<f64> {
        let mut out = Vec::with_capacity(self.coeffs.len());
        for m in 0..self.modes.len() {
            out.extend(self.coeffs.row(m).iter());
        }
        out
    }

    /// Installing coefficients counts as solving the table.
    fn apply(&mut self, update: &ParamUpdate) -> Result<()> {
        let mut values = self.parameter_values();
        update.apply_to(&self.parameter_names(), &mut values)?;
        for (i, v) in values.into_iter().enumerate() {
            self.coeffs[(i / 3, i % 3)] = v;
        }
        self.solved = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::ExactNeighborInterp;
    use crate::star::StarData;

    fn plane_stars() -> Vec<Star> {
        (0..12)
            .map(|i| {
                let u = (i % 4) as f64 * 0.3 - 0.4;
                let v = (i / 4) as f64 * 0.5 - 0.5;
                Star::with_params(
                    StarData::new(u, v),
                    vec![0.6 + 0.1 * u - 0.05 * v, 0.01 - 0.02 * v],
                )
            })
            .collect()
    }

    #[test]
    fn test_solve_recovers_plane() {
        let mut mt = ModeTableInterp::new(&["size", "g1"]).unwrap();
        mt.solve(&plane_stars()).unwrap();
        let c = mt.coefficients();
        assert!((c[(0, 0)] - 0.6).abs() < 1e-12);
        assert!((c[(0, 1)] - 0.1).abs() < 1e-12);
        assert!((c[(0, 2)] + 0.05).abs() < 1e-12);
        assert!((c[(1, 2)] + 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_parameter_names_and_partial_update() {
        let mut mt = ModeTableInterp::new(&["size", "g1"]).unwrap();
        mt.solve(&plane_stars()).unwrap();
        assert_eq!(
            mt.parameter_names(),
            vec!["size_d", "size_x", "size_y", "g1_d", "g1_x", "g1_y"]
        );
        let before = mt.parameter_values();
        mt.apply(&ParamUpdate::new().set("g1_x", 0.5).keep("size_d"))
            .unwrap();
        let after = mt.parameter_values();
        for i in 0..6 {
            if i == 4 {
                assert_eq!(after[i], 0.5);
            } else {
                assert_eq!(after[i], before[i], "coefficient {i} changed");
            }
        }
        assert!(mt.apply(&ParamUpdate::new().set("g2_d", 1.0)).is_err());
    }

    #[test]
    fn test_reference_is_added() {
        let stars = plane_stars();
        let mut reference = ExactNeighborInterp::new(1).unwrap();
        reference.solve(&stars).unwrap();
        let mut mt = ModeTableInterp::new(&["size", "g1"])
            .unwrap()
            .with_reference(Box::new(reference));
        // Targets equal the reference, so the fitted residual table is zero.
        mt.solve(&stars).unwrap();
        assert!(mt.coefficients().amax() < 1e-12);
        mt.apply(&ParamUpdate::new().set("size_d", 0.1)).unwrap();
        let p = mt.interpolate(&stars[5]).unwrap();
        let expect = stars[5].params().unwrap()[0] + 0.1;
        assert!((p.params().unwrap()[0] - expect).abs() < 1e-12);
    }

    #[test]
    fn test_minimum_and_unsolved() {
        let mut mt = ModeTableInterp::new(&["size", "g1"]).unwrap();
        let q = Star::new(StarData::new(0.0, 0.0));
        assert!(matches!(mt.interpolate(&q), Err(PsfError::NotSolved)));
        assert!(matches!(
            mt.solve(&plane_stars()[..2]),
            Err(PsfError::InsufficientData { required: 3, got: 2 })
        ));
    }

    #[test]
    fn test_roundtrip_with_reference() {
        let stars = plane_stars();
        let mut reference = ExactNeighborInterp::new(2).unwrap();
        reference.solve(&stars).unwrap();
        let mut mt = ModeTableInterp::new(&["size", "g1"])
            .unwrap()
            .with_reference(Box::new(reference));
        mt.apply(&ParamUpdate::new().set("size_x", 0.2)).unwrap();

        let mut store = TableStore::new();
        mt.write(&mut store, "psf").unwrap();
        assert!(store.contains("psf_reference"));
        let back = ModeTableInterp::read(&store, "psf").unwrap();
        assert_eq!(back.coefficients(), mt.coefficients());
        let q = Star::new(StarData::new(0.13, -0.21));
        assert_eq!(
            back.interpolate(&q).unwrap().params().unwrap(),
            mt.interpolate(&q).unwrap().params().unwrap()
        );
    }
}
