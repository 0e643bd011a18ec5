//! Principal-component reduction of the target matrix.

use nalgebra::{DMatrix, DVector};

use crate::error::{PsfError, Result};

/// Linear map between full parameter space and the leading principal
/// components of the training targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Pca {
    /// Column means of the training targets.
    pub mean: DVector<f64>,
    /// `n_components × n_target`, rows are orthonormal components sorted by
    /// decreasing singular value.
    pub components: DMatrix<f64>,
}

impl Pca {
    /// Fit `n_components` components to the `samples × n_target` matrix `y`.
    ///
    /// Each component's sign is chosen so its largest-magnitude entry is
    /// positive, which makes the fit reproducible across runs.
    pub fn fit(y: &DMatrix<f64>, n_components: usize) -> Result<Self> {
        let (n, t) = y.shape();
        if n_components == 0 || n_components > t.min(n) {
            return Err(PsfError::Configuration(format!(
                "cannot keep {n_components} principal components of a {n}x{t} target matrix"
            )));
        }

        let mean = DVector::from_fn(t, |j, _| y.column(j).mean());
        let mut centered = y.clone();
        for j in 0..t {
            centered.column_mut(j).add_scalar_mut(-mean[j]);
        }

        let svd = centered.svd(false, true);
        let v_t = svd
            .v_t
            .ok_or_else(|| PsfError::LinearAlgebra("PCA: SVD did not return V^T".into()))?;

        let mut order: Vec<usize> = (0..svd.singular_values.len()).collect();
        order.sort_by(|&a, &b| {
            svd.singular_values[b]
                .total_cmp(&svd.singular_values[a])
                .then(a.cmp(&b))
        });

        let mut components = DMatrix::zeros(n_components, t);
        for (row, &k) in order.iter().take(n_components).enumerate() {
            let comp = v_t.row(k);
            let pivot = comp
                .iter()
                .copied()
                .fold(0.0_f64, |best, x| if x.abs() > best.abs() { x } else { best });
            let sign = if pivot < 0.0 { -1.0 } else { 1.0 };
            for j in 0..t {
                components[(row, j)] = sign * comp[j];
            }
        }

        Ok(Self { mean, components })
    }

    pub fn n_components(&self) -> usize {
        self.components.nrows()
    }

    /// Project `samples × n_target` rows onto the components.
    pub fn transform(&self, y: &DMatrix<f64>) -> DMatrix<f64> {
        let mut centered = y.clone();
        for j in 0..centered.ncols() {
            centered.column_mut(j).add_scalar_mut(-self.mean[j]);
        }
        centered * self.components.transpose()
    }

    /// Map one reduced vector back to full parameter space.
    pub fn inverse(&self, z: &[f64]) -> Vec<f64> {
        let z = DVector::from_column_slice(z);
        let y = self.components.transpose() * z + &self.mean;
        y.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_targets() -> DMatrix<f64> {
        // Rank-2 data in 4 dimensions plus an offset
        DMatrix::from_fn(12, 4, |i, j| {
            let a = (i as f64 * 0.7).sin();
            let b = (i as f64 * 1.3).cos();
            let dir_a = [1.0, 0.5, -0.2, 0.0][j];
            let dir_b = [0.0, 0.3, 0.4, -1.0][j];
            2.0 * a * dir_a + 0.5 * b * dir_b + j as f64
        })
    }

    #[test]
    fn test_full_rank_roundtrip() {
        let y = sample_targets();
        let pca = Pca::fit(&y, 2).unwrap();
        let z = pca.transform(&y);
        for i in 0..y.nrows() {
            let back = pca.inverse(z.row(i).iter().copied().collect::<Vec<_>>().as_slice());
            for j in 0..4 {
                assert!((back[j] - y[(i, j)]).abs() < 1e-10, "row {i} col {j}");
            }
        }
    }

    #[test]
    fn test_components_orthonormal_and_signed() {
        let pca = Pca::fit(&sample_targets(), 2).unwrap();
        let g = &pca.components * pca.components.transpose();
        assert!((g - DMatrix::identity(2, 2)).abs().max() < 1e-12);
        for r in 0..2 {
            let row = pca.components.row(r);
            let pivot = row.iter().copied().fold(0.0_f64, |b, x| if x.abs() > b.abs() { x } else { b });
            assert!(pivot > 0.0);
        }
    }

    #[test]
    fn test_too_many_components() {
        assert!(matches!(
            Pca::fit(&sample_targets(), 5),
            Err(PsfError::Configuration(_))
        ));
    }
}
