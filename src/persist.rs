//! Table-structured persistence sink for interpolator state.
//!
//! A [`TableStore`] holds independently named [`Table`]s; each table is an
//! ordered list of typed columns with an explicit shape. Writing a table under
//! an existing name replaces it. The whole store serializes with
//! [rkyv](https://docs.rs/rkyv) so a calibrated PSF loads back bit-exactly.

use std::collections::BTreeMap;

use nalgebra::DMatrix;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

use crate::error::{PsfError, Result};

/// Typed column payload.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum ColumnData {
    F64(Vec<f64>),
    I64(Vec<i64>),
    Str(Vec<String>),
}

/// A named column. `shape` is `[len]` for vectors and `[rows, cols]` for
/// row-major matrices.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub shape: Vec<u64>,
    pub data: ColumnData,
}

/// An ordered set of named columns.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<Column>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: &str, shape: Vec<u64>, data: ColumnData) {
        self.columns.retain(|c| c.name != name);
        self.columns.push(Column {
            name: name.to_string(),
            shape,
            data,
        });
    }

    pub fn set_f64(&mut self, name: &str, values: Vec<f64>) {
        let n = values.len() as u64;
        self.push(name, vec![n], ColumnData::F64(values));
    }

    pub fn set_i64(&mut self, name: &str, values: Vec<i64>) {
        let n = values.len() as u64;
        self.push(name, vec![n], ColumnData::I64(values));
    }

    pub fn set_str(&mut self, name: &str, values: Vec<String>) {
        let n = values.len() as u64;
        self.push(name, vec![n], ColumnData::Str(values));
    }

    /// Store a matrix in row-major order with shape `[rows, cols]`.
    pub fn set_matrix(&mut self, name: &str, m: &DMatrix<f64>) {
        let mut values = Vec::with_capacity(m.len());
        for r in 0..m.nrows() {
            for c in 0..m.ncols() {
                values.push(m[(r, c)]);
            }
        }
        self.push(
            name,
            vec![m.nrows() as u64, m.ncols() as u64],
            ColumnData::F64(values),
        );
    }

    pub fn column(&self, name: &str) -> Result<&Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| PsfError::Serialization(format!("missing column '{name}'")))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn get_f64(&self, name: &str) -> Result<&[f64]> {
        match &self.column(name)?.data {
            ColumnData::F64(v) => Ok(v),
            _ => Err(PsfError::Serialization(format!(
                "column '{name}' is not a float column"
            ))),
        }
    }

    pub fn get_i64(&self, name: &str) -> Result<&[i64]> {
        match &self.column(name)?.data {
            ColumnData::I64(v) => Ok(v),
            _ => Err(PsfError::Serialization(format!(
                "column '{name}' is not an integer column"
            ))),
        }
    }

    pub fn get_str(&self, name: &str) -> Result<&[String]> {
        match &self.column(name)?.data {
            ColumnData::Str(v) => Ok(v),
            _ => Err(PsfError::Serialization(format!(
                "column '{name}' is not a string column"
            ))),
        }
    }

    /// Read a single-element float column.
    pub fn scalar_f64(&self, name: &str) -> Result<f64> {
        match self.get_f64(name)? {
            [x] => Ok(*x),
            v => Err(PsfError::Serialization(format!(
                "column '{name}' should hold one value, found {}",
                v.len()
            ))),
        }
    }

    /// Read a single-element integer column.
    pub fn scalar_i64(&self, name: &str) -> Result<i64> {
        match self.get_i64(name)? {
            [x] => Ok(*x),
            v => Err(PsfError::Serialization(format!(
                "column '{name}' should hold one value, found {}",
                v.len()
            ))),
        }
    }

    /// Read a single-element integer column holding a count or an index.
    pub fn scalar_usize(&self, name: &str) -> Result<usize> {
        to_usize(name, self.scalar_i64(name)?)
    }

    /// Read an integer column of counts or indices.
    pub fn get_usize(&self, name: &str) -> Result<Vec<usize>> {
        self.get_i64(name)?
            .iter()
            .map(|&v| to_usize(name, v))
            .collect()
    }

    /// Read a row-major `[rows, cols]` matrix column.
    pub fn get_matrix(&self, name: &str) -> Result<DMatrix<f64>> {
        let col = self.column(name)?;
        let (rows, cols) = match col.shape.as_slice() {
            [r, c] => (
                usize::try_from(*r).unwrap_or(usize::MAX),
                usize::try_from(*c).unwrap_or(usize::MAX),
            ),
            s => {
                return Err(PsfError::Serialization(format!(
                    "column '{name}' has shape {s:?}, expected a matrix"
                )))
            }
        };
        let values = self.get_f64(name)?;
        if rows.checked_mul(cols) != Some(values.len()) {
            return Err(PsfError::Serialization(format!(
                "column '{name}' holds {} values for shape {rows}x{cols}",
                values.len()
            )));
        }
        Ok(DMatrix::from_row_slice(rows, cols, values))
    }

    /// Check the `type` and `version` columns written by every interpolator.
    pub fn expect_header(&self, kind: &str, version: i64) -> Result<()> {
        let found = self.get_str("type")?;
        if found.len() != 1 || found[0] != kind {
            return Err(PsfError::Serialization(format!(
                "expected table type '{kind}', found {found:?}"
            )));
        }
        let v = self.scalar_i64("version")?;
        if v != version {
            return Err(PsfError::Serialization(format!(
                "table '{kind}' has layout version {v}, reader expects {version}"
            )));
        }
        Ok(())
    }

    /// Table with the `type` and `version` header columns set.
    pub fn with_header(kind: &str, version: i64) -> Self {
        let mut t = Self::new();
        t.set_str("type", vec![kind.to_string()]);
        t.set_i64("version", vec![version]);
        t
    }
}

/// Named collection of tables, saved and loaded as one archive.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
pub struct TableStore {
    pub tables: BTreeMap<String, Table>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the table `name`.
    pub fn write_table(&mut self, name: &str, table: Table) {
        self.tables.insert(name.to_string(), table);
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| PsfError::Serialization(format!("no table named '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn remove_table(&mut self, name: &str) -> Option<Table> {
        self.tables.remove(name)
    }

    /// Serialize the store to bytes using rkyv.
    pub fn to_rkyv_bytes(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|b| b.to_vec())
            .map_err(|e| PsfError::Serialization(format!("rkyv serialization failed: {e}")))
    }

    /// Deserialize a store from rkyv bytes.
    pub fn from_rkyv_bytes(bytes: &[u8]) -> Result<Self> {
        // Archived f64 columns need 8-byte alignment; a plain Vec<u8> may not have it.
        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| PsfError::Serialization(format!("rkyv deserialization failed: {e}")))
    }

    /// Save the store to a file.
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let bytes = self.to_rkyv_bytes()?;
        std::fs::write(path.as_ref(), &bytes)?;
        info!(
            "Saved {} tables to {} ({} bytes)",
            self.tables.len(),
            path.as_ref().display(),
            bytes.len()
        );
        Ok(())
    }

    /// Load a store from a file written by [`save_to_file`](Self::save_to_file).
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let store = Self::from_rkyv_bytes(&bytes)?;
        info!(
            "Loaded {} tables from {}",
            store.tables.len(),
            path.as_ref().display()
        );
        Ok(store)
    }
}

fn to_usize(name: &str, v: i64) -> Result<usize> {
    usize::try_from(v).map_err(|_| {
        PsfError::Serialization(format!(
            "column '{name}' holds {v} where a count or index is expected"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matrix_roundtrip_row_major() {
        let m = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut t = Table::new();
        t.set_matrix("m", &m);
        assert_eq!(t.get_f64("m").unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(t.get_matrix("m").unwrap(), m);
    }

    #[test]
    fn test_write_replaces() {
        let mut store = TableStore::new();
        let mut a = Table::new();
        a.set_f64("x", vec![1.0]);
        store.write_table("t", a);
        let mut b = Table::new();
        b.set_f64("y", vec![2.0]);
        store.write_table("t", b);
        let t = store.table("t").unwrap();
        assert!(!t.has_column("x"));
        assert_eq!(t.scalar_f64("y").unwrap(), 2.0);
    }

    #[test]
    fn test_negative_count_rejected() {
        let mut t = Table::new();
        t.set_i64("n", vec![-3]);
        t.set_i64("idx", vec![0, 2, -1]);
        assert!(matches!(t.scalar_usize("n"), Err(PsfError::Serialization(_))));
        assert!(matches!(t.get_usize("idx"), Err(PsfError::Serialization(_))));
        t.set_i64("n", vec![4]);
        assert_eq!(t.scalar_usize("n").unwrap(), 4);
    }

    #[test]
    fn test_header_mismatch() {
        let t = Table::with_header("KNN", 1);
        assert!(t.expect_header("KNN", 1).is_ok());
        assert!(matches!(
            t.expect_header("GP", 1),
            Err(PsfError::Serialization(_))
        ));
        assert!(matches!(
            t.expect_header("KNN", 2),
            Err(PsfError::Serialization(_))
        ));
    }

    #[test]
    fn test_wrong_column_type() {
        let mut t = Table::new();
        t.set_i64("n", vec![3]);
        assert!(matches!(t.get_f64("n"), Err(PsfError::Serialization(_))));
    }

    #[test]
    fn test_rkyv_roundtrip() {
        let mut store = TableStore::new();
        let mut t = Table::with_header("GP", 1);
        t.set_f64("theta", vec![0.1, -2.5, f64::MIN_POSITIVE]);
        t.set_str("names", vec!["u".into(), "v".into()]);
        store.write_table("psf", t);
        let bytes = store.to_rkyv_bytes().unwrap();
        let back = TableStore::from_rkyv_bytes(&bytes).unwrap();
        assert_eq!(back, store);
    }

    #[test]
    fn test_remove_table() {
        let mut store = TableStore::new();
        store.write_table("psf", Table::new());
        store.write_table("psf_reference", Table::new());
        assert!(store.remove_table("psf_reference").is_some());
        assert!(store.remove_table("psf_reference").is_none());
        assert!(store.contains("psf"));
    }
}
