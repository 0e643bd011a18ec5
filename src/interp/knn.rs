//! Nearest-neighbour interpolation.
//!
//! Stores the training attributes and targets verbatim and predicts the mean
//! target of the `k` nearest training stars in attribute space. With `k = 1`
//! a query that coincides with a training star returns that star's stored
//! vector exactly.

use nalgebra::DMatrix;
use tracing::debug;

use super::kdtree::KdTree;
use super::{
    attribute_row, record_param_len, require_samples, training_param_len, Interp, InterpKind,
};
use crate::error::{PsfError, Result};
use crate::persist::{Table, TableStore};
use crate::star::Star;

const LAYOUT_VERSION: i64 = 1;
const MIN_SAMPLES: usize = 2;

#[derive(Debug, Clone)]
struct KnnState {
    /// `n × n_attr` training attributes.
    x: DMatrix<f64>,
    /// `n × n_selected` training targets.
    y: DMatrix<f64>,
    tree: KdTree,
}

impl KnnState {
    fn new(x: DMatrix<f64>, y: DMatrix<f64>) -> Self {
        let tree = KdTree::build(&row_major(&x), x.ncols());
        Self { x, y, tree }
    }
}

/// Mean-of-k-nearest-neighbours interpolator.
#[derive(Debug, Clone)]
pub struct ExactNeighborInterp {
    n_neighbors: usize,
    attr_interp: Vec<String>,
    /// Selected parameter indices; `None` selects all of them.
    attr_target: Option<Vec<usize>>,
    n_target: Option<usize>,
    state: Option<KnnState>,
}

impl ExactNeighborInterp {
    /// Unsolved interpolator over `(u, v)` and every parameter.
    pub fn new(n_neighbors: usize) -> Result<Self> {
        if n_neighbors == 0 {
            return Err(PsfError::Configuration(
                "nearest-neighbour count must be at least 1".into(),
            ));
        }
        Ok(Self {
            n_neighbors,
            attr_interp: vec!["u".into(), "v".into()],
            attr_target: None,
            n_target: None,
            state: None,
        })
    }

    /// Fix the attribute and target schema.
    pub fn build(mut self, attr_interp: &[&str], attr_target: Option<&[usize]>) -> Self {
        self.attr_interp = attr_interp.iter().map(|s| s.to_string()).collect();
        self.attr_target = attr_target.map(<[usize]>::to_vec);
        self
    }

    pub fn n_neighbors(&self) -> usize {
        self.n_neighbors
    }

    pub fn attr_interp(&self) -> &[String] {
        &self.attr_interp
    }

    pub fn attr_target(&self) -> Option<&[usize]> {
        self.attr_target.as_deref()
    }

    /// Training attribute matrix, once solved.
    pub fn training_attributes(&self) -> Option<&DMatrix<f64>> {
        self.state.as_ref().map(|s| &s.x)
    }

    /// Training target matrix (selected columns only), once solved.
    pub fn training_targets(&self) -> Option<&DMatrix<f64>> {
        self.state.as_ref().map(|s| &s.y)
    }

    fn target_indices(&self, n_target: usize) -> Result<Vec<usize>> {
        match &self.attr_target {
            None => Ok((0..n_target).collect()),
            Some(idx) => {
                if let Some(&bad) = idx.iter().find(|&&i| i >= n_target) {
                    return Err(PsfError::Configuration(format!(
                        "target index {bad} out of range for {n_target} parameters"
                    )));
                }
                Ok(idx.clone())
            }
        }
    }
}

impl Interp for ExactNeighborInterp {
    fn kind(&self) -> InterpKind {
        InterpKind::Knn
    }

    fn initialize(&mut self, stars: &[Star]) -> Result<()> {
        if self.attr_interp.is_empty() {
            return Err(PsfError::Configuration(
                "nearest-neighbour search needs at least one attribute".into(),
            ));
        }
        let found = training_param_len(stars, false)?;
        if let Some(n) = found {
            self.target_indices(n)?;
        }
        for star in stars {
            attribute_row(star, &self.attr_interp)?;
        }
        record_param_len(&mut self.n_target, found)
    }

    fn solve(&mut self, stars: &[Star]) -> Result<()> {
        require_samples(MIN_SAMPLES, stars.len())?;
        training_param_len(stars, true)?;
        self.initialize(stars)?;
        let n_target = self.n_target.unwrap_or(0);
        let targets = self.target_indices(n_target)?;

        let n = stars.len();
        let mut x = DMatrix::zeros(n, self.attr_interp.len());
        let mut y = DMatrix::zeros(n, targets.len());
        for (i, star) in stars.iter().enumerate() {
            for (j, a) in attribute_row(star, &self.attr_interp)?.into_iter().enumerate() {
                x[(i, j)] = a;
            }
            let params = star.params()?;
            for (j, &t) in targets.iter().enumerate() {
                y[(i, j)] = params[t];
            }
        }

        self.state = Some(KnnState::new(x, y));
        debug!(
            "kNN solved: {} stars, {} attributes, {} targets, k={}",
            n,
            self.attr_interp.len(),
            targets.len(),
            self.n_neighbors
        );
        Ok(())
    }

    fn interpolate(&self, star: &Star) -> Result<Star> {
        let state = self.state.as_ref().ok_or(PsfError::NotSolved)?;
        let query = attribute_row(star, &self.attr_interp)?;
        let k = self.n_neighbors.min(state.tree.len());
        let neighbors = state.tree.k_nearest(&query, k);

        let mut pred = vec![0.0; state.y.ncols()];
        if neighbors.len() == 1 {
            // Copy rather than average so exact matches return the stored bits.
            let i = neighbors[0].0;
            for (j, p) in pred.iter_mut().enumerate() {
                *p = state.y[(i, j)];
            }
        } else {
            for &(i, _) in &neighbors {
                for (j, p) in pred.iter_mut().enumerate() {
                    *p += state.y[(i, j)];
                }
            }
            let inv = 1.0 / neighbors.len() as f64;
            pred.iter_mut().for_each(|p| *p *= inv);
        }
        Ok(star.with_fit_params(pred))
    }

    fn write(&self, store: &mut TableStore, name: &str) -> Result<()> {
        let state = self.state.as_ref().ok_or(PsfError::NotSolved)?;
        let mut t = Table::with_header(InterpKind::Knn.as_str(), LAYOUT_VERSION);
        t.set_i64("n_neighbors", vec![self.n_neighbors as i64]);
        t.set_i64("n_target", vec![self.n_target.unwrap_or(0) as i64]);
        t.set_str("attr_interp", self.attr_interp.clone());
        match &self.attr_target {
            Some(idx) => t.set_i64("attr_target", idx.iter().map(|&i| i as i64).collect()),
            None => t.set_i64("attr_target_all", vec![1]),
        }
        t.set_matrix("X", &state.x);
        t.set_matrix("y", &state.y);
        store.write_table(name, t);
        Ok(())
    }

    fn read(store: &TableStore, name: &str) -> Result<Self> {
        let t = store.table(name)?;
        t.expect_header(InterpKind::Knn.as_str(), LAYOUT_VERSION)?;
        let bad = |msg: String| PsfError::Serialization(format!("kNN table '{name}': {msg}"));

        let n_neighbors = t.scalar_usize("n_neighbors")?;
        if n_neighbors == 0 {
            return Err(bad("neighbour count is zero".into()));
        }
        let n_target = t.scalar_usize("n_target")?;
        let attr_target = if t.has_column("attr_target") {
            let idx = t.get_usize("attr_target")?;
            if let Some(&i) = idx.iter().find(|&&i| i >= n_target) {
                return Err(bad(format!(
                    "target index {i} out of range for {n_target} parameters"
                )));
            }
            Some(idx)
        } else {
            None
        };
        let attr_interp = t.get_str("attr_interp")?.to_vec();
        let n_selected = attr_target.as_ref().map_or(n_target, Vec::len);

        let x = t.get_matrix("X")?;
        let y = t.get_matrix("y")?;
        if attr_interp.is_empty() || x.ncols() != attr_interp.len() {
            return Err(bad(format!(
                "{} attribute columns for attributes {attr_interp:?}",
                x.ncols()
            )));
        }
        if y.ncols() != n_selected {
            return Err(bad(format!(
                "{} target columns, expected {n_selected}",
                y.ncols()
            )));
        }
        if x.nrows() != y.nrows() {
            return Err(bad(format!(
                "{} attribute rows but {} target rows",
                x.nrows(),
                y.nrows()
            )));
        }
        Ok(Self {
            n_neighbors,
            attr_interp,
            attr_target,
            n_target: Some(n_target),
            state: Some(KnnState::new(x, y)),
        })
    }
}

fn row_major(m: &DMatrix<f64>) -> Vec<f64> {
    let mut out = Vec::with_capacity(m.len());
    for r in 0..m.nrows() {
        out.extend(m.row(r).iter());
    }
    out
}
