//! Spatial interpolation of per-star PSF parameters.
//!
//! An [`Interp`] is trained on stars whose fits carry parameter vectors and
//! predicts the parameter vector at any other star from its attributes
//! (focal-plane position and, for some interpolators, extra properties).
//!
//! - [`ExactNeighborInterp`]: mean of the k nearest training targets.
//! - [`RegressionInterp`]: Gaussian-process posterior mean, optionally in a
//!   PCA-reduced target space.
//! - [`ModeTableInterp`]: per-mode constant + linear gradient on top of an
//!   optional reference interpolant; the free coefficients of joint
//!   calibration.
//!
//! Interpolators are persisted as tables in a [`TableStore`] and can be
//! reconstructed without knowing their concrete type through [`read_interp`].

pub mod gp;
pub mod kdtree;
pub mod knn;
pub mod mode_table;

use std::fmt;
use std::str::FromStr;

use crate::error::{PsfError, Result};
use crate::persist::TableStore;
use crate::star::Star;

pub use gp::{GpConfig, RegressionInterp};
pub use knn::ExactNeighborInterp;
pub use mode_table::ModeTableInterp;

/// Variant tag written to the `type` column of every interpolator table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterpKind {
    Knn,
    Gp,
    ModeTable,
}

impl InterpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterpKind::Knn => "KNN",
            InterpKind::Gp => "GP",
            InterpKind::ModeTable => "ModeTable",
        }
    }
}

impl fmt::Display for InterpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterpKind {
    type Err = PsfError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "KNN" => Ok(InterpKind::Knn),
            "GP" => Ok(InterpKind::Gp),
            "ModeTable" => Ok(InterpKind::ModeTable),
            other => Err(PsfError::Configuration(format!(
                "unknown interpolator type '{other}'"
            ))),
        }
    }
}

/// Spatial interpolator of star parameter vectors.
pub trait Interp: fmt::Debug {
    fn kind(&self) -> InterpKind;

    /// Validate and record the parameter schema from the starting stars.
    /// Calling it again with compatible stars has no further effect.
    fn initialize(&mut self, stars: &[Star]) -> Result<()>;

    /// Fit the interpolant to `stars`, replacing any previous state.
    fn solve(&mut self, stars: &[Star]) -> Result<()>;

    /// Predict the parameters at `star`. The returned star carries the
    /// input's data unchanged and a fit holding the prediction.
    fn interpolate(&self, star: &Star) -> Result<Star>;

    fn interpolate_list(&self, stars: &[Star]) -> Result<Vec<Star>> {
        stars.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Persist the solved state under `name`.
    fn write(&self, store: &mut TableStore, name: &str) -> Result<()>;

    /// Reconstruct an interpolator written by [`write`](Interp::write).
    fn read(store: &TableStore, name: &str) -> Result<Self>
    where
        Self: Sized;
}

/// Construction parameters for any registered interpolator.
#[derive(Debug, Clone)]
pub enum InterpConfig {
    Knn {
        n_neighbors: usize,
        attr_interp: Vec<String>,
        /// `None` interpolates every parameter.
        attr_target: Option<Vec<usize>>,
    },
    Gp(GpConfig),
    ModeTable {
        modes: Vec<String>,
    },
}

impl InterpConfig {
    /// Nearest-neighbour configuration over `(u, v)` with 15 neighbours.
    pub fn knn() -> Self {
        InterpConfig::Knn {
            n_neighbors: 15,
            attr_interp: vec!["u".into(), "v".into()],
            attr_target: None,
        }
    }

    pub fn kind(&self) -> InterpKind {
        match self {
            InterpConfig::Knn { .. } => InterpKind::Knn,
            InterpConfig::Gp(_) => InterpKind::Gp,
            InterpConfig::ModeTable { .. } => InterpKind::ModeTable,
        }
    }
}

/// Construct an unsolved interpolator from its configuration.
pub fn build_interp(config: &InterpConfig) -> Result<Box<dyn Interp>> {
    Ok(match config {
        InterpConfig::Knn {
            n_neighbors,
            attr_interp,
            attr_target,
        } => {
            let names: Vec<&str> = attr_interp.iter().map(String::as_str).collect();
            Box::new(ExactNeighborInterp::new(*n_neighbors)?.build(&names, attr_target.as_deref()))
        }
        InterpConfig::Gp(gp) => Box::new(RegressionInterp::new(gp.clone())?),
        InterpConfig::ModeTable { modes } => {
            let names: Vec<&str> = modes.iter().map(String::as_str).collect();
            Box::new(ModeTableInterp::new(&names)?)
        }
    })
}

/// Read back any interpolator, dispatching on the table's `type` column.
pub fn read_interp(store: &TableStore, name: &str) -> Result<Box<dyn Interp>> {
    let table = store.table(name)?;
    let kind = match table.get_str("type")? {
        [t] => t.parse::<InterpKind>()?,
        other => {
            return Err(PsfError::Serialization(format!(
                "table '{name}' has a malformed type column: {other:?}"
            )))
        }
    };
    Ok(match kind {
        InterpKind::Knn => Box::new(ExactNeighborInterp::read(store, name)?),
        InterpKind::Gp => Box::new(RegressionInterp::read(store, name)?),
        InterpKind::ModeTable => Box::new(ModeTableInterp::read(store, name)?),
    })
}

// ── Shared helpers ──────────────────────────────────────────────────────────

/// Attribute values of `star` in the order of `names`.
pub(crate) fn attribute_row(star: &Star, names: &[String]) -> Result<Vec<f64>> {
    names
        .iter()
        .map(|n| {
            star.data.attribute(n).ok_or_else(|| {
                PsfError::Configuration(format!("star has no attribute '{n}'"))
            })
        })
        .collect()
}

/// Common parameter length of `stars`. With `require_fit`, a star without a
/// fit is a configuration error; otherwise such stars are skipped.
pub(crate) fn training_param_len(stars: &[Star], require_fit: bool) -> Result<Option<usize>> {
    let mut len: Option<usize> = None;
    for (i, star) in stars.iter().enumerate() {
        let n = match &star.fit {
            Some(f) => f.params.len(),
            None if require_fit => {
                return Err(PsfError::Configuration(format!(
                    "training star {i} has no fitted parameters"
                )))
            }
            None => continue,
        };
        match len {
            None => len = Some(n),
            Some(m) if m != n => {
                return Err(PsfError::Configuration(format!(
                    "training star {i} has {n} parameters, expected {m}"
                )))
            }
            _ => {}
        }
    }
    Ok(len)
}

/// Record `found` as the session's parameter length, or check it against the
/// length already recorded.
pub(crate) fn record_param_len(recorded: &mut Option<usize>, found: Option<usize>) -> Result<()> {
    match (*recorded, found) {
        (_, None) => Ok(()),
        (None, Some(n)) => {
            *recorded = Some(n);
            Ok(())
        }
        (Some(m), Some(n)) if m == n => Ok(()),
        (Some(m), Some(n)) => Err(PsfError::Configuration(format!(
            "parameter vectors have length {n}, but this session was initialized with {m}"
        ))),
    }
}

pub(crate) fn require_samples(required: usize, got: usize) -> Result<()> {
    if got < required {
        Err(PsfError::InsufficientData { required, got })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::star::StarData;

    #[test]
    fn test_kind_roundtrip() {
        for kind in [InterpKind::Knn, InterpKind::Gp, InterpKind::ModeTable] {
            assert_eq!(kind.as_str().parse::<InterpKind>().unwrap(), kind);
        }
        assert!("Polynomial".parse::<InterpKind>().is_err());
    }

    #[test]
    fn test_training_param_len_mismatch() {
        let stars = vec![
            Star::with_params(StarData::new(0.0, 0.0), vec![1.0, 2.0]),
            Star::with_params(StarData::new(1.0, 0.0), vec![1.0]),
        ];
        assert!(matches!(
            training_param_len(&stars, false),
            Err(PsfError::Configuration(_))
        ));
    }

    #[test]
    fn test_unfitted_training_star() {
        let stars = vec![
            Star::new(StarData::new(0.0, 0.0)),
            Star::with_params(StarData::new(1.0, 0.0), vec![1.0, 2.0]),
        ];
        assert!(matches!(
            training_param_len(&stars, true),
            Err(PsfError::Configuration(_))
        ));
        assert_eq!(training_param_len(&stars, false).unwrap(), Some(2));
    }

    #[test]
    fn test_record_param_len() {
        let mut rec = None;
        record_param_len(&mut rec, Some(5)).unwrap();
        record_param_len(&mut rec, None).unwrap();
        record_param_len(&mut rec, Some(5)).unwrap();
        assert!(record_param_len(&mut rec, Some(4)).is_err());
        assert_eq!(rec, Some(5));
    }

    #[test]
    fn test_build_interp_kinds() {
        let knn = build_interp(&InterpConfig::knn()).unwrap();
        assert_eq!(knn.kind(), InterpKind::Knn);
        let mt = build_interp(&InterpConfig::ModeTable {
            modes: vec!["size".into()],
        })
        .unwrap();
        assert_eq!(mt.kind(), InterpKind::ModeTable);
        let gp = build_interp(&InterpConfig::Gp(GpConfig::default())).unwrap();
        assert_eq!(gp.kind(), InterpKind::Gp);
    }
}
