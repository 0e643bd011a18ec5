//! Covariance kernels for Gaussian-process interpolation.
//!
//! A [`Kernel`] is a closed expression tree of primitives combined with `+`
//! and `*`:
//!
//! | Primitive | k(a, b) | Hyperparameters |
//! |-----------|---------|-----------------|
//! | `Constant(c)` | `c` | `ln c` |
//! | `Rbf(ℓ)` | `exp(-½ |a−b|²/ℓ²)` | `ln ℓ` |
//! | `AnisotropicRbf(Λ⁻¹)` | `exp(-½ dᵀ Λ⁻¹ d)` | Cholesky factor `L` of `Λ⁻¹`: `ln L₀₀, L₁₀, ln L₁₁` |
//! | `White(σ²)` | `σ²` on the training diagonal only | `ln σ²` |
//! | `Explicit(T)` | bilinear lookup of `T(a−b)` | none |
//!
//! Only primitives with bounds contribute free hyperparameters; the vector
//! returned by [`Kernel::theta`] lists them left to right through the tree.
//!
//! Kernels are written either with the builder methods and operators or as
//! strings, e.g. `"1*RBF(0.3, (1e-1, 1e3)) + WhiteKernel(1e-5, (1e-7, 1e-1))"`.
//! Persistence uses a postfix op-code encoding ([`Kernel::write_columns`]).

use std::fmt;
use std::ops::{Add, Mul};
use std::str::FromStr;

use nalgebra::{Cholesky, DMatrix, Matrix2};

use crate::error::{PsfError, Result};
use crate::optimize::Bound;
use crate::persist::Table;

/// Focal-plane coordinate pair.
pub type Point = [f64; 2];

/// A positive hyperparameter with optional optimisation bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hyper {
    pub value: f64,
    /// `None` keeps the value fixed during optimisation.
    pub bounds: Option<(f64, f64)>,
}

impl Hyper {
    pub fn fixed(value: f64) -> Self {
        Self {
            value,
            bounds: None,
        }
    }

    pub fn bounded(value: f64, lower: f64, upper: f64) -> Self {
        Self {
            value,
            bounds: Some((lower, upper)),
        }
    }
}

/// Fixed covariance of the separation vector `(du, dv)`, tabulated on a
/// regular grid spanning `[-half_width, half_width]` on each axis and
/// bilinearly interpolated. Zero outside the grid.
#[derive(Debug, Clone, PartialEq)]
pub struct TabulatedCovariance {
    pub half_width_u: f64,
    pub half_width_v: f64,
    pub nu: usize,
    pub nv: usize,
    /// Row-major, `values[iv * nu + iu]`.
    pub values: Vec<f64>,
}

impl TabulatedCovariance {
    pub fn new(
        half_width_u: f64,
        half_width_v: f64,
        nu: usize,
        nv: usize,
        values: Vec<f64>,
    ) -> Result<Self> {
        if nu < 2 || nv < 2 {
            return Err(PsfError::Configuration(
                "tabulated covariance needs at least 2 nodes per axis".into(),
            ));
        }
        if !(half_width_u > 0.0 && half_width_v > 0.0) {
            return Err(PsfError::Configuration(
                "tabulated covariance half-widths must be positive".into(),
            ));
        }
        if values.len() != nu * nv {
            return Err(PsfError::Configuration(format!(
                "tabulated covariance has {} values for a {nu}x{nv} grid",
                values.len()
            )));
        }
        Ok(Self {
            half_width_u,
            half_width_v,
            nu,
            nv,
            values,
        })
    }

    /// Tabulate `f(du, dv)` on an `n × n` grid of half-width `half_width`.
    pub fn from_fn(half_width: f64, n: usize, f: impl Fn(f64, f64) -> f64) -> Result<Self> {
        let step = 2.0 * half_width / (n.max(2) - 1) as f64;
        let mut values = Vec::with_capacity(n * n);
        for iv in 0..n {
            for iu in 0..n {
                values.push(f(
                    -half_width + iu as f64 * step,
                    -half_width + iv as f64 * step,
                ));
            }
        }
        Self::new(half_width, half_width, n, n, values)
    }

    pub fn eval(&self, du: f64, dv: f64) -> f64 {
        let fu = (du + self.half_width_u) / (2.0 * self.half_width_u) * (self.nu - 1) as f64;
        let fv = (dv + self.half_width_v) / (2.0 * self.half_width_v) * (self.nv - 1) as f64;
        if !(0.0..=(self.nu - 1) as f64).contains(&fu) || !(0.0..=(self.nv - 1) as f64).contains(&fv)
        {
            return 0.0;
        }
        let iu = (fu.floor() as usize).min(self.nu - 2);
        let iv = (fv.floor() as usize).min(self.nv - 2);
        let tu = fu - iu as f64;
        let tv = fv - iv as f64;
        let at = |i: usize, j: usize| self.values[j * self.nu + i];
        (1.0 - tu) * (1.0 - tv) * at(iu, iv)
            + tu * (1.0 - tv) * at(iu + 1, iv)
            + (1.0 - tu) * tv * at(iu, iv + 1)
            + tu * tv * at(iu + 1, iv + 1)
    }
}

/// Kernel expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Kernel {
    Constant(Hyper),
    Rbf(Hyper),
    /// Lower Cholesky factor `[L₀₀, L₁₀, L₁₁]` of the precision matrix
    /// `Λ⁻¹ = L Lᵀ`. Bounds apply to the diagonal entries; the off-diagonal
    /// entry is bounded by `±upper`.
    AnisotropicRbf {
        chol: [f64; 3],
        bounds: Option<(f64, f64)>,
    },
    White(Hyper),
    Explicit(TabulatedCovariance),
    Sum(Box<Kernel>, Box<Kernel>),
    Product(Box<Kernel>, Box<Kernel>),
}

impl Kernel {
    pub fn constant(value: f64) -> Self {
        Kernel::Constant(Hyper::fixed(value))
    }

    pub fn rbf(length_scale: f64) -> Self {
        Kernel::Rbf(Hyper::fixed(length_scale))
    }

    pub fn white(noise_level: f64) -> Self {
        Kernel::White(Hyper::fixed(noise_level))
    }

    pub fn explicit(table: TabulatedCovariance) -> Self {
        Kernel::Explicit(table)
    }

    /// Anisotropic squared exponential from a symmetric positive-definite
    /// precision matrix `Λ⁻¹`.
    pub fn anisotropic_rbf(inv_lam: Matrix2<f64>) -> Result<Self> {
        let l = Cholesky::new(inv_lam)
            .ok_or_else(|| {
                PsfError::Configuration("anisotropic RBF precision matrix is not positive definite".into())
            })?
            .l();
        Ok(Kernel::AnisotropicRbf {
            chol: [l[(0, 0)], l[(1, 0)], l[(1, 1)]],
            bounds: None,
        })
    }

    /// Attach optimisation bounds to a primitive. Composite and explicit
    /// kernels are returned unchanged.
    pub fn bounded(self, lower: f64, upper: f64) -> Self {
        match self {
            Kernel::Constant(h) => Kernel::Constant(Hyper::bounded(h.value, lower, upper)),
            Kernel::Rbf(h) => Kernel::Rbf(Hyper::bounded(h.value, lower, upper)),
            Kernel::White(h) => Kernel::White(Hyper::bounded(h.value, lower, upper)),
            Kernel::AnisotropicRbf { chol, .. } => Kernel::AnisotropicRbf {
                chol,
                bounds: Some((lower, upper)),
            },
            other => other,
        }
    }

    /// Precision matrix of an anisotropic primitive.
    pub fn inv_lam(chol: &[f64; 3]) -> Matrix2<f64> {
        let l = Matrix2::new(chol[0], 0.0, chol[1], chol[2]);
        l * l.transpose()
    }

    /// `k(a, b)`; `same` marks a training point paired with itself, the
    /// only place white noise contributes.
    pub fn eval(&self, a: Point, b: Point, same: bool) -> f64 {
        let du = a[0] - b[0];
        let dv = a[1] - b[1];
        match self {
            Kernel::Constant(h) => h.value,
            Kernel::Rbf(h) => (-0.5 * (du * du + dv * dv) / (h.value * h.value)).exp(),
            Kernel::AnisotropicRbf { chol, .. } => {
                let y0 = chol[0] * du + chol[1] * dv;
                let y1 = chol[2] * dv;
                (-0.5 * (y0 * y0 + y1 * y1)).exp()
            }
            Kernel::White(h) => {
                if same {
                    h.value
                } else {
                    0.0
                }
            }
            Kernel::Explicit(t) => t.eval(du, dv),
            Kernel::Sum(l, r) => l.eval(a, b, same) + r.eval(a, b, same),
            Kernel::Product(l, r) => l.eval(a, b, same) * r.eval(a, b, same),
        }
    }

    /// Training covariance `K(X, X)`, white noise on the diagonal.
    pub fn matrix(&self, x: &[Point]) -> DMatrix<f64> {
        let n = x.len();
        let mut k = DMatrix::zeros(n, n);
        for i in 0..n {
            for j in 0..=i {
                let v = self.eval(x[i], x[j], i == j);
                k[(i, j)] = v;
                k[(j, i)] = v;
            }
        }
        k
    }

    /// Cross covariance `K(X*, X)` between query and training points.
    pub fn cross(&self, query: &[Point], x: &[Point]) -> DMatrix<f64> {
        DMatrix::from_fn(query.len(), x.len(), |i, j| self.eval(query[i], x[j], false))
    }

    pub fn contains_explicit(&self) -> bool {
        match self {
            Kernel::Explicit(_) => true,
            Kernel::Sum(l, r) | Kernel::Product(l, r) => {
                l.contains_explicit() || r.contains_explicit()
            }
            _ => false,
        }
    }

    // ── Hyperparameters ──────────────────────────────────────────────────

    /// Free hyperparameters in optimisation space (log for positive values).
    pub fn theta(&self) -> Vec<f64> {
        let mut out = Vec::new();
        self.collect_theta(&mut out);
        out
    }

    fn collect_theta(&self, out: &mut Vec<f64>) {
        match self {
            Kernel::Constant(h) | Kernel::Rbf(h) | Kernel::White(h) => {
                if h.bounds.is_some() {
                    out.push(h.value.ln());
                }
            }
            Kernel::AnisotropicRbf { chol, bounds } => {
                if bounds.is_some() {
                    out.extend([chol[0].ln(), chol[1], chol[2].ln()]);
                }
            }
            Kernel::Explicit(_) => {}
            Kernel::Sum(l, r) | Kernel::Product(l, r) => {
                l.collect_theta(out);
                r.collect_theta(out);
            }
        }
    }

    /// Bounds matching [`theta`](Self::theta), in the same space.
    pub fn bounds(&self) -> Vec<Bound> {
        let mut out = Vec::new();
        self.collect_bounds(&mut out);
        out
    }

    fn collect_bounds(&self, out: &mut Vec<Bound>) {
        match self {
            Kernel::Constant(h) | Kernel::Rbf(h) | Kernel::White(h) => {
                if let Some((lo, hi)) = h.bounds {
                    out.push(Bound::new(lo.ln(), hi.ln()));
                }
            }
            Kernel::AnisotropicRbf { bounds, .. } => {
                if let Some((lo, hi)) = *bounds {
                    out.extend([
                        Bound::new(lo.ln(), hi.ln()),
                        Bound::new(-hi, hi),
                        Bound::new(lo.ln(), hi.ln()),
                    ]);
                }
            }
            Kernel::Explicit(_) => {}
            Kernel::Sum(l, r) | Kernel::Product(l, r) => {
                l.collect_bounds(out);
                r.collect_bounds(out);
            }
        }
    }

    pub fn n_theta(&self) -> usize {
        self.theta().len()
    }

    /// Copy of this kernel with its free hyperparameters replaced.
    pub fn with_theta(&self, theta: &[f64]) -> Result<Kernel> {
        let mut rest = theta;
        let k = self.replace_theta(&mut rest)?;
        if !rest.is_empty() {
            return Err(PsfError::Configuration(format!(
                "kernel takes {} hyperparameters, got {}",
                theta.len() - rest.len(),
                theta.len()
            )));
        }
        Ok(k)
    }

    fn replace_theta(&self, rest: &mut &[f64]) -> Result<Kernel> {
        let free = |h: &Hyper, rest: &mut &[f64]| -> Result<Hyper> {
            if h.bounds.is_none() {
                return Ok(*h);
            }
            Ok(Hyper {
                value: take_theta(rest, 1)?[0].exp(),
                bounds: h.bounds,
            })
        };
        Ok(match self {
            Kernel::Constant(h) => Kernel::Constant(free(h, rest)?),
            Kernel::Rbf(h) => Kernel::Rbf(free(h, rest)?),
            Kernel::White(h) => Kernel::White(free(h, rest)?),
            Kernel::AnisotropicRbf { chol, bounds } => {
                let chol = if bounds.is_some() {
                    let t = take_theta(rest, 3)?;
                    [t[0].exp(), t[1], t[2].exp()]
                } else {
                    *chol
                };
                Kernel::AnisotropicRbf {
                    chol,
                    bounds: *bounds,
                }
            }
            Kernel::Explicit(t) => Kernel::Explicit(t.clone()),
            Kernel::Sum(l, r) => {
                let l = l.replace_theta(rest)?;
                l + r.replace_theta(rest)?
            }
            Kernel::Product(l, r) => {
                let l = l.replace_theta(rest)?;
                l * r.replace_theta(rest)?
            }
        })
    }

    // ── Persistence ──────────────────────────────────────────────────────

    /// Postfix encoding of the tree.
    pub fn encode(&self) -> KernelEncoding {
        let mut enc = KernelEncoding::default();
        self.encode_into(&mut enc);
        enc
    }

    fn encode_into(&self, enc: &mut KernelEncoding) {
        let push_hyper = |enc: &mut KernelEncoding, op: i64, h: &Hyper| {
            enc.ops.push(op);
            let (flag, lo, hi) = match h.bounds {
                Some((lo, hi)) => (1.0, lo, hi),
                None => (0.0, 0.0, 0.0),
            };
            enc.params.extend([h.value, flag, lo, hi]);
        };
        match self {
            Kernel::Constant(h) => push_hyper(enc, OP_CONSTANT, h),
            Kernel::Rbf(h) => push_hyper(enc, OP_RBF, h),
            Kernel::White(h) => push_hyper(enc, OP_WHITE, h),
            Kernel::AnisotropicRbf { chol, bounds } => {
                enc.ops.push(OP_ANISOTROPIC_RBF);
                let (flag, lo, hi) = match bounds {
                    Some((lo, hi)) => (1.0, *lo, *hi),
                    None => (0.0, 0.0, 0.0),
                };
                enc.params.extend([chol[0], chol[1], chol[2], flag, lo, hi]);
            }
            Kernel::Explicit(t) => {
                enc.ops.push(OP_EXPLICIT);
                enc.params.push(enc.tables.len() as f64);
                enc.tables.push(t.clone());
            }
            Kernel::Sum(l, r) => {
                l.encode_into(enc);
                r.encode_into(enc);
                enc.ops.push(OP_SUM);
            }
            Kernel::Product(l, r) => {
                l.encode_into(enc);
                r.encode_into(enc);
                enc.ops.push(OP_PRODUCT);
            }
        }
    }

    /// Write the encoding as columns `{prefix}_ops`, `{prefix}_params`,
    /// `{prefix}_tables` and `{prefix}_table_values`.
    pub fn write_columns(&self, table: &mut Table, prefix: &str) {
        let enc = self.encode();
        table.set_i64(&format!("{prefix}_ops"), enc.ops);
        table.set_f64(&format!("{prefix}_params"), enc.params);
        let mut meta = Vec::with_capacity(4 * enc.tables.len());
        let mut values = Vec::new();
        for t in &enc.tables {
            meta.extend([t.half_width_u, t.half_width_v, t.nu as f64, t.nv as f64]);
            values.extend_from_slice(&t.values);
        }
        table.set_f64(&format!("{prefix}_tables"), meta);
        table.set_f64(&format!("{prefix}_table_values"), values);
    }

    pub fn read_columns(table: &Table, prefix: &str) -> Result<Kernel> {
        let ops = table.get_i64(&format!("{prefix}_ops"))?.to_vec();
        let params = table.get_f64(&format!("{prefix}_params"))?.to_vec();
        let meta = table.get_f64(&format!("{prefix}_tables"))?;
        let values = table.get_f64(&format!("{prefix}_table_values"))?;
        if meta.len() % 4 != 0 {
            return Err(PsfError::Serialization(format!(
                "kernel '{prefix}' has a malformed table header"
            )));
        }
        let mut tables = Vec::with_capacity(meta.len() / 4);
        let mut offset: usize = 0;
        for m in meta.chunks_exact(4) {
            let bad = |msg: &str| PsfError::Serialization(format!("kernel '{prefix}' {msg}"));
            let (nu, nv) = match (stored_count(m[2]), stored_count(m[3])) {
                (Some(nu), Some(nv)) => (nu, nv),
                _ => return Err(bad("table has an invalid grid size")),
            };
            let end = nu
                .checked_mul(nv)
                .and_then(|len| offset.checked_add(len))
                .ok_or_else(|| bad("table has an invalid grid size"))?;
            let slice = values
                .get(offset..end)
                .ok_or_else(|| bad("table values truncated"))?;
            tables.push(
                TabulatedCovariance::new(m[0], m[1], nu, nv, slice.to_vec())
                    .map_err(|e| PsfError::Serialization(e.to_string()))?,
            );
            offset = end;
        }
        KernelEncoding {
            ops,
            params,
            tables,
        }
        .decode()
    }

    // ── Parsing ──────────────────────────────────────────────────────────

    /// Parse a kernel expression such as
    /// `"1*RBF(0.3, (1e-1, 1e3)) + WhiteKernel(1e-5, (1e-7, 1e-1))"`.
    ///
    /// Recognised primitives: `RBF`, `WhiteKernel`, `ConstantKernel` (or `C`)
    /// and `AnisotropicRBF([[a, b], [c, d]])`, each with an optional bounds
    /// tuple or `fixed`. A bare number is a fixed constant.
    pub fn parse(s: &str) -> Result<Kernel> {
        let tokens = tokenize(s)?;
        let mut p = Parser { tokens, pos: 0 };
        let k = p.sum()?;
        if p.pos != p.tokens.len() {
            return Err(parse_error(s, "trailing input"));
        }
        Ok(k)
    }
}

fn take_theta<'a>(rest: &mut &'a [f64], n: usize) -> Result<&'a [f64]> {
    if rest.len() < n {
        return Err(PsfError::Configuration(
            "too few hyperparameters for kernel".into(),
        ));
    }
    let (head, tail) = rest.split_at(n);
    *rest = tail;
    Ok(head)
}

impl Add for Kernel {
    type Output = Kernel;
    fn add(self, rhs: Kernel) -> Kernel {
        Kernel::Sum(Box::new(self), Box::new(rhs))
    }
}

impl Mul for Kernel {
    type Output = Kernel;
    fn mul(self, rhs: Kernel) -> Kernel {
        Kernel::Product(Box::new(self), Box::new(rhs))
    }
}

impl FromStr for Kernel {
    type Err = PsfError;
    fn from_str(s: &str) -> Result<Self> {
        Kernel::parse(s)
    }
}

fn fmt_bounds(f: &mut fmt::Formatter<'_>, b: Option<(f64, f64)>) -> fmt::Result {
    match b {
        Some((lo, hi)) => write!(f, ", ({lo:e}, {hi:e})"),
        None => Ok(()),
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kernel::Constant(h) if h.bounds.is_none() => write!(f, "{}", h.value),
            Kernel::Constant(h) => {
                write!(f, "ConstantKernel({}", h.value)?;
                fmt_bounds(f, h.bounds)?;
                f.write_str(")")
            }
            Kernel::Rbf(h) => {
                write!(f, "RBF({}", h.value)?;
                fmt_bounds(f, h.bounds)?;
                f.write_str(")")
            }
            Kernel::White(h) => {
                write!(f, "WhiteKernel({}", h.value)?;
                fmt_bounds(f, h.bounds)?;
                f.write_str(")")
            }
            Kernel::AnisotropicRbf { chol, bounds } => {
                let m = Kernel::inv_lam(chol);
                write!(
                    f,
                    "AnisotropicRBF([[{}, {}], [{}, {}]]",
                    m[(0, 0)],
                    m[(0, 1)],
                    m[(1, 0)],
                    m[(1, 1)]
                )?;
                fmt_bounds(f, *bounds)?;
                f.write_str(")")
            }
            Kernel::Explicit(t) => write!(f, "ExplicitKernel({}x{})", t.nu, t.nv),
            // Parenthesise so the printed form parses back to the same tree.
            Kernel::Sum(l, r) => match **r {
                Kernel::Sum(..) => write!(f, "{l} + ({r})"),
                _ => write!(f, "{l} + {r}"),
            },
            Kernel::Product(l, r) => {
                if matches!(**l, Kernel::Sum(..)) {
                    write!(f, "({l})")?;
                } else {
                    write!(f, "{l}")?;
                }
                f.write_str(" * ")?;
                if matches!(**r, Kernel::Sum(..) | Kernel::Product(..)) {
                    write!(f, "({r})")
                } else {
                    write!(f, "{r}")
                }
            }
        }
    }
}

// ── Postfix encoding ────────────────────────────────────────────────────────

const OP_CONSTANT: i64 = 1;
const OP_RBF: i64 = 2;
const OP_ANISOTROPIC_RBF: i64 = 3;
const OP_WHITE: i64 = 4;
const OP_EXPLICIT: i64 = 5;
const OP_SUM: i64 = 10;
const OP_PRODUCT: i64 = 11;

/// Sizes and indices travel as floats next to the hyperparameters; only
/// exact non-negative integers are accepted back.
fn stored_count(v: f64) -> Option<usize> {
    (v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64).then_some(v as usize)
}

/// Flat postfix form of a kernel: op codes, their numeric operands in
/// order, and any explicit covariance tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KernelEncoding {
    pub ops: Vec<i64>,
    pub params: Vec<f64>,
    pub tables: Vec<TabulatedCovariance>,
}

impl KernelEncoding {
    pub fn decode(&self) -> Result<Kernel> {
        let bad = |msg: &str| PsfError::Serialization(format!("kernel encoding: {msg}"));
        let mut stack: Vec<Kernel> = Vec::new();
        let mut p = self.params.iter().copied();
        let mut next = |n: usize| -> Result<Vec<f64>> {
            let v: Vec<f64> = p.by_ref().take(n).collect();
            if v.len() == n {
                Ok(v)
            } else {
                Err(bad("operand list truncated"))
            }
        };
        let hyper = |v: &[f64]| Hyper {
            value: v[0],
            bounds: (v[1] != 0.0).then_some((v[2], v[3])),
        };

        for &op in &self.ops {
            let k = match op {
                OP_CONSTANT => Kernel::Constant(hyper(&next(4)?)),
                OP_RBF => Kernel::Rbf(hyper(&next(4)?)),
                OP_WHITE => Kernel::White(hyper(&next(4)?)),
                OP_ANISOTROPIC_RBF => {
                    let v = next(6)?;
                    Kernel::AnisotropicRbf {
                        chol: [v[0], v[1], v[2]],
                        bounds: (v[3] != 0.0).then_some((v[4], v[5])),
                    }
                }
                OP_EXPLICIT => {
                    let t = stored_count(next(1)?[0])
                        .and_then(|idx| self.tables.get(idx))
                        .ok_or_else(|| bad("explicit table index out of range"))?;
                    Kernel::Explicit(t.clone())
                }
                OP_SUM | OP_PRODUCT => {
                    let r = stack.pop().ok_or_else(|| bad("operator without operands"))?;
                    let l = stack.pop().ok_or_else(|| bad("operator without operands"))?;
                    if op == OP_SUM {
                        l + r
                    } else {
                        l * r
                    }
                }
                other => return Err(bad(&format!("unknown op code {other}"))),
            };
            stack.push(k);
        }
        match (stack.pop(), stack.is_empty()) {
            (Some(k), true) => Ok(k),
            _ => Err(bad("expression does not reduce to a single kernel")),
        }
    }
}

// ── Parser ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Punct(char),
}

fn parse_error(s: &str, msg: &str) -> PsfError {
    PsfError::Configuration(format!("cannot parse kernel '{s}': {msg}"))
}

fn tokenize(s: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = s.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit()
            || c == '.'
            || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit() || *n == '.'))
        {
            let start = i;
            i += 1;
            while i < chars.len() {
                let d = chars[i];
                let exp_sign = (d == '+' || d == '-') && matches!(chars[i - 1], 'e' | 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exp_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let v = text
                .parse::<f64>()
                .map_err(|_| parse_error(s, &format!("bad number '{text}'")))?;
            tokens.push(Token::Num(v));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if "()[],+*".contains(c) {
            tokens.push(Token::Punct(c));
            i += 1;
        } else {
            return Err(parse_error(s, &format!("unexpected character '{c}'")));
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn err(&self, msg: &str) -> PsfError {
        PsfError::Configuration(format!("kernel parse error at token {}: {msg}", self.pos))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(&Token::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<()> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(self.err(&format!("expected '{c}'")))
        }
    }

    fn number(&mut self) -> Result<f64> {
        match self.peek() {
            Some(Token::Num(v)) => {
                let v = *v;
                self.pos += 1;
                Ok(v)
            }
            _ => Err(self.err("expected a number")),
        }
    }

    fn sum(&mut self) -> Result<Kernel> {
        let mut k = self.product()?;
        while self.eat('+') {
            k = k + self.product()?;
        }
        Ok(k)
    }

    fn product(&mut self) -> Result<Kernel> {
        let mut k = self.factor()?;
        while self.eat('*') {
            k = k * self.factor()?;
        }
        Ok(k)
    }

    fn factor(&mut self) -> Result<Kernel> {
        match self.peek().cloned() {
            Some(Token::Num(v)) => {
                self.pos += 1;
                positive(v, "constant").map(Kernel::constant)
            }
            Some(Token::Punct('(')) => {
                self.pos += 1;
                let k = self.sum()?;
                self.expect(')')?;
                Ok(k)
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                self.call(&name)
            }
            _ => Err(self.err("expected a kernel")),
        }
    }

    fn call(&mut self, name: &str) -> Result<Kernel> {
        self.expect('(')?;
        let k = match name {
            "RBF" => {
                let v = positive(self.number()?, "length scale")?;
                Kernel::Rbf(Hyper {
                    value: v,
                    bounds: self.opt_bounds()?,
                })
            }
            "WhiteKernel" => {
                let v = positive(self.number()?, "noise level")?;
                Kernel::White(Hyper {
                    value: v,
                    bounds: self.opt_bounds()?,
                })
            }
            "ConstantKernel" | "C" => {
                let v = positive(self.number()?, "constant")?;
                Kernel::Constant(Hyper {
                    value: v,
                    bounds: self.opt_bounds()?,
                })
            }
            "AnisotropicRBF" => {
                let m = self.matrix()?;
                let sym = Matrix2::new(m[0], 0.5 * (m[1] + m[2]), 0.5 * (m[1] + m[2]), m[3]);
                match (Kernel::anisotropic_rbf(sym)?, self.opt_bounds()?) {
                    (k, Some((lo, hi))) => k.bounded(lo, hi),
                    (k, None) => k,
                }
            }
            other => return Err(self.err(&format!("unknown kernel '{other}'"))),
        };
        self.expect(')')?;
        Ok(k)
    }

    fn opt_bounds(&mut self) -> Result<Option<(f64, f64)>> {
        if !self.eat(',') {
            return Ok(None);
        }
        if let Some(Token::Ident(w)) = self.peek() {
            if w == "fixed" {
                self.pos += 1;
                return Ok(None);
            }
        }
        self.expect('(')?;
        let lo = self.number()?;
        self.expect(',')?;
        let hi = self.number()?;
        self.expect(')')?;
        if !(lo > 0.0 && hi > lo) {
            return Err(self.err(&format!("invalid bounds ({lo}, {hi})")));
        }
        Ok(Some((lo, hi)))
    }

    fn matrix(&mut self) -> Result<[f64; 4]> {
        self.expect('[')?;
        self.expect('[')?;
        let a = self.number()?;
        self.expect(',')?;
        let b = self.number()?;
        self.expect(']')?;
        self.expect(',')?;
        self.expect('[')?;
        let c = self.number()?;
        self.expect(',')?;
        let d = self.number()?;
        self.expect(']')?;
        self.expect(']')?;
        Ok([a, b, c, d])
    }
}

fn positive(v: f64, what: &str) -> Result<f64> {
    if v > 0.0 {
        Ok(v)
    } else {
        Err(PsfError::Configuration(format!("kernel {what} must be positive, got {v}")))
    }
}
