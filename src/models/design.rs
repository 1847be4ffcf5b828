//! Design matrices and penalties for parsed formulas.
//!
//! [`DesignSpec::build`] freezes everything data-dependent about a formula on
//! the training frame: factor levels, knot vectors, identifiability
//! constraints and penalty scaling. [`DesignSpec::design`] then evaluates the
//! same columns on any frame, so prediction uses exactly the fitted basis.
//!
//! Column layout: intercept first, then one block per term in formula order.
//! Every smoothing penalty is stored with the first column of its block.

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::domain::{Column, Frame};
use crate::error::{Result, SurveyIndexError};
use crate::math::{
    PENALTY_ORDER, SPLINE_DEGREE, basis_len, bspline_row, constraint_null_space,
    difference_penalty, knots_from_breaks, kronecker, kronecker_row, uniform_knots,
};
use crate::models::formula::{Formula, SmoothBasis, Term};

/// Penalty null-space eigenvalues of shrinkage smooths are raised to this
/// fraction of the smallest positive eigenvalue.
const SHRINKAGE_FACTOR: f64 = 0.1;

/// Relative eigenvalue threshold separating a penalty's null space.
const NULL_SPACE_TOL: f64 = 1e-9;

/// Smallest marginal basis of a tensor smooth.
const MIN_MARGIN: usize = SPLINE_DEGREE + 1;

/// One smoothing penalty: `matrix` applies to columns `start..start + dim`.
#[derive(Debug, Clone)]
pub struct Penalty {
    pub label: String,
    pub start: usize,
    pub matrix: DMatrix<f64>,
}

impl Penalty {
    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }
}

/// Model matrix and offset evaluated on one frame.
#[derive(Debug, Clone)]
pub struct Design {
    pub x: DMatrix<f64>,
    pub offset: DVector<f64>,
}

#[derive(Debug, Clone)]
enum Block {
    Intercept,
    /// Treatment contrasts against `levels[0]`.
    Factor {
        name: String,
        levels: Vec<String>,
    },
    Linear {
        name: String,
    },
    Spline {
        var: String,
        knots: Vec<f64>,
        z: DMatrix<f64>,
        by: Option<String>,
    },
    Tensor {
        vars: [String; 2],
        knots: [Vec<f64>; 2],
        z: DMatrix<f64>,
        by: Option<String>,
    },
    RandomEffect {
        var: String,
        levels: Vec<String>,
        by: Option<String>,
    },
}

impl Block {
    fn width(&self) -> usize {
        match self {
            Block::Intercept | Block::Linear { .. } => 1,
            Block::Factor { levels, .. } => levels.len().saturating_sub(1),
            Block::Spline { z, .. } | Block::Tensor { z, .. } => z.ncols(),
            Block::RandomEffect { levels, .. } => levels.len(),
        }
    }

    fn label(&self) -> String {
        match self {
            Block::Intercept => "(Intercept)".to_string(),
            Block::Factor { name, .. } | Block::Linear { name } => name.clone(),
            Block::Spline { var, by, .. } => smooth_label(&[var.as_str()], by.as_deref()),
            Block::Tensor { vars, by, .. } => {
                smooth_label(&[vars[0].as_str(), vars[1].as_str()], by.as_deref())
            }
            Block::RandomEffect { var, by, .. } => smooth_label(&[var.as_str()], by.as_deref()),
        }
    }

    fn column_names(&self) -> Vec<String> {
        match self {
            Block::Intercept | Block::Linear { .. } => vec![self.label()],
            Block::Factor { name, levels } => {
                levels.iter().skip(1).map(|l| format!("{name}{l}")).collect()
            }
            _ => {
                let label = self.label();
                (1..=self.width()).map(|j| format!("{label}.{j}")).collect()
            }
        }
    }

    /// Evaluate the block's columns on `frame` (n × width).
    fn evaluate(&self, frame: &Frame) -> Result<DMatrix<f64>> {
        let n = frame.n_rows();
        let out = match self {
            Block::Intercept => DMatrix::from_element(n, 1, 1.0),
            Block::Linear { name } => {
                let x = finite_numeric(frame, name)?;
                DMatrix::from_column_slice(n, 1, x)
            }
            Block::Factor { name, levels } => {
                let values = frame.factor(name)?;
                let mut m = DMatrix::zeros(n, self.width());
                for (i, v) in values.iter().enumerate() {
                    let idx = level_index(levels, name, v)?;
                    if idx > 0 {
                        m[(i, idx - 1)] = 1.0;
                    }
                }
                m
            }
            Block::Spline { var, knots, z, by } => {
                let x = finite_numeric(frame, var)?;
                let mut m = spline_basis(x, knots) * z;
                apply_by(&mut m, frame, by.as_deref())?;
                m
            }
            Block::Tensor { vars, knots, z, by } => {
                let x1 = finite_numeric(frame, &vars[0])?;
                let x2 = finite_numeric(frame, &vars[1])?;
                let mut m = tensor_basis(x1, x2, &knots[0], &knots[1]) * z;
                apply_by(&mut m, frame, by.as_deref())?;
                m
            }
            Block::RandomEffect { var, levels, by } => {
                let scale = match by {
                    Some(by) => Some(finite_numeric(frame, by)?),
                    None => None,
                };
                let values = frame.factor(var)?;
                let mut m = DMatrix::zeros(n, levels.len());
                for (i, v) in values.iter().enumerate() {
                    let w = scale.map_or(1.0, |s| s[i]);
                    // A switched-off effect contributes nothing, whatever the level.
                    if w == 0.0 {
                        continue;
                    }
                    m[(i, level_index(levels, var, v)?)] = w;
                }
                m
            }
        };
        Ok(out)
    }
}

fn smooth_label(vars: &[&str], by: Option<&str>) -> String {
    match by {
        Some(by) => format!("s({}):{by}", vars.join(",")),
        None => format!("s({})", vars.join(",")),
    }
}

fn level_index(levels: &[String], name: &str, value: &str) -> Result<usize> {
    levels
        .binary_search_by(|l| l.as_str().cmp(value))
        .map_err(|_| {
            SurveyIndexError::Formula(format!(
                "level `{value}` of `{name}` does not occur in the fitted data"
            ))
        })
}

fn finite_numeric<'a>(frame: &'a Frame, name: &str) -> Result<&'a [f64]> {
    let x = frame.numeric(name)?;
    if x.iter().any(|v| !v.is_finite()) {
        return Err(SurveyIndexError::Numerical(format!(
            "covariate `{name}` has missing or non-finite values"
        )));
    }
    Ok(x)
}

fn apply_by(m: &mut DMatrix<f64>, frame: &Frame, by: Option<&str>) -> Result<()> {
    if let Some(by) = by {
        let w = finite_numeric(frame, by)?;
        for (i, mut row) in m.row_iter_mut().enumerate() {
            row *= w[i];
        }
    }
    Ok(())
}

fn sorted_levels(values: &[String]) -> Vec<String> {
    values
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .cloned()
        .collect()
}

fn range(x: &[f64]) -> (f64, f64) {
    x.iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
}

/// Knots for `var`: explicit breakpoints if given, else `k` uniform B-splines
/// over the training range.
fn knots_for(
    var: &str,
    x: &[f64],
    k: usize,
    explicit: &BTreeMap<String, Vec<f64>>,
) -> Result<Vec<f64>> {
    match explicit.get(var) {
        Some(breaks) => knots_from_breaks(breaks, SPLINE_DEGREE),
        None => {
            let (lo, hi) = range(x);
            uniform_knots(lo, hi, k, SPLINE_DEGREE)
        }
    }
}

/// Unconstrained B-spline basis, one row per value.
fn spline_basis(x: &[f64], knots: &[f64]) -> DMatrix<f64> {
    let mut raw = DMatrix::zeros(x.len(), basis_len(knots, SPLINE_DEGREE));
    for (i, &xi) in x.iter().enumerate() {
        for (j, b) in bspline_row(xi, knots, SPLINE_DEGREE).into_iter().enumerate() {
            raw[(i, j)] = b;
        }
    }
    raw
}

/// Unconstrained tensor-product basis; the second margin varies fastest.
fn tensor_basis(x1: &[f64], x2: &[f64], k1: &[f64], k2: &[f64]) -> DMatrix<f64> {
    let width = basis_len(k1, SPLINE_DEGREE) * basis_len(k2, SPLINE_DEGREE);
    let mut raw = DMatrix::zeros(x1.len(), width);
    for (i, (&a, &b)) in x1.iter().zip(x2).enumerate() {
        let row = kronecker_row(
            &bspline_row(a, k1, SPLINE_DEGREE),
            &bspline_row(b, k2, SPLINE_DEGREE),
        );
        for (j, v) in row.into_iter().enumerate() {
            raw[(i, j)] = v;
        }
    }
    raw
}

fn column_sums(m: &DMatrix<f64>) -> DVector<f64> {
    DVector::from_iterator(m.ncols(), m.column_iter().map(|c| c.sum()))
}

/// Rescale `s` to the magnitude of `XᵀX` for the block, so smoothing
/// parameters of different terms live on comparable scales.
fn scale_penalty(s: DMatrix<f64>, block: &DMatrix<f64>) -> DMatrix<f64> {
    let max_row = block
        .row_iter()
        .map(|r| r.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0_f64, f64::max);
    let max_col = s
        .column_iter()
        .map(|c| c.iter().map(|v| v.abs()).sum::<f64>())
        .fold(0.0_f64, f64::max);
    let xx = max_row * max_row;
    if xx > 0.0 && max_col > 0.0 {
        s * (xx / max_col)
    } else {
        s
    }
}

/// Make the combined penalties of a shrinkage smooth full rank.
///
/// A single penalty gets its null-space eigenvalues raised in place; tensor
/// smooths get an extra penalty on the null space of their summed penalties.
fn shrink(penalties: &mut Vec<DMatrix<f64>>) {
    let Some(first) = penalties.first() else {
        return;
    };
    let dim = first.nrows();
    let total = penalties
        .iter()
        .fold(DMatrix::zeros(dim, dim), |acc, s| acc + s);
    let eig = SymmetricEigen::new(total);
    let max_ev = eig.eigenvalues.amax();
    let tol = NULL_SPACE_TOL * max_ev;
    let min_pos = eig
        .eigenvalues
        .iter()
        .copied()
        .filter(|&ev| ev > tol)
        .fold(f64::INFINITY, f64::min);
    if !min_pos.is_finite() {
        return;
    }
    let shrunk = SHRINKAGE_FACTOR * min_pos;

    let mut null = DMatrix::zeros(dim, dim);
    for (j, &ev) in eig.eigenvalues.iter().enumerate() {
        if ev <= tol {
            let v = eig.eigenvectors.column(j);
            null += &v * v.transpose() * shrunk;
        }
    }

    if penalties.len() == 1 {
        penalties[0] += null;
    } else {
        penalties.push(null);
    }
}

/// Frozen column layout and penalties of one formula.
#[derive(Debug, Clone)]
pub struct DesignSpec {
    blocks: Vec<Block>,
    offsets: Vec<(String, bool)>,
    penalties: Vec<Penalty>,
    column_names: Vec<String>,
}

impl DesignSpec {
    /// Set up the design on training data and return it with the training
    /// model matrix.
    pub fn build(
        formula: &Formula,
        frame: &Frame,
        knots: &BTreeMap<String, Vec<f64>>,
    ) -> Result<(DesignSpec, Design)> {
        if frame.n_rows() == 0 {
            return Err(SurveyIndexError::Configuration(
                "cannot build a design on zero observations".to_string(),
            ));
        }

        let mut blocks = vec![Block::Intercept];
        let mut block_penalties: Vec<Vec<DMatrix<f64>>> = vec![Vec::new()];
        let mut offsets = Vec::new();

        for term in &formula.terms {
            match term {
                Term::Offset { name, log } => offsets.push((name.clone(), *log)),
                Term::Parametric { name } => {
                    let block = match frame.column(name) {
                        Some(Column::Factor(values)) => Block::Factor {
                            name: name.clone(),
                            levels: sorted_levels(values),
                        },
                        Some(Column::Numeric(_)) => Block::Linear { name: name.clone() },
                        None => {
                            return Err(SurveyIndexError::Formula(format!(
                                "covariate `{name}` is missing"
                            )));
                        }
                    };
                    if block.width() > 0 {
                        blocks.push(block);
                        block_penalties.push(Vec::new());
                    }
                }
                Term::Smooth {
                    vars,
                    basis: SmoothBasis::RandomEffect,
                    by,
                    ..
                } => {
                    let levels = sorted_levels(frame.factor(&vars[0])?);
                    let dim = levels.len();
                    blocks.push(Block::RandomEffect {
                        var: vars[0].clone(),
                        levels,
                        by: by.clone(),
                    });
                    block_penalties.push(vec![DMatrix::identity(dim, dim)]);
                }
                Term::Smooth { vars, k, basis, by } => {
                    let (block, mut penalties) = if vars.len() == 1 {
                        spline_block(frame, &vars[0], *k, by.clone(), knots)?
                    } else {
                        tensor_block(frame, [&vars[0], &vars[1]], *k, by.clone(), knots)?
                    };
                    if *basis == SmoothBasis::Shrinkage {
                        shrink(&mut penalties);
                    }
                    blocks.push(block);
                    block_penalties.push(penalties);
                }
            }
        }

        let mut columns = Vec::with_capacity(blocks.len());
        let mut penalties = Vec::new();
        let mut column_names = Vec::new();
        let mut start = 0;
        for (block, raw) in blocks.iter().zip(block_penalties) {
            let m = block.evaluate(frame)?;
            for s in raw {
                penalties.push(Penalty {
                    label: block.label(),
                    start,
                    matrix: scale_penalty(s, &m),
                });
            }
            start += m.ncols();
            column_names.extend(block.column_names());
            columns.push(m);
        }

        let spec = DesignSpec {
            blocks,
            offsets,
            penalties,
            column_names,
        };
        let design = Design {
            x: hstack(frame.n_rows(), &columns),
            offset: spec.offset(frame)?,
        };
        log::debug!(
            "design: {} rows, {} columns, {} penalties",
            frame.n_rows(),
            spec.n_coef(),
            spec.penalties.len()
        );
        Ok((spec, design))
    }

    /// Evaluate the frozen design on `frame` (the lp-matrix for prediction).
    pub fn design(&self, frame: &Frame) -> Result<Design> {
        let columns = self
            .blocks
            .iter()
            .map(|b| b.evaluate(frame))
            .collect::<Result<Vec<_>>>()?;
        Ok(Design {
            x: hstack(frame.n_rows(), &columns),
            offset: self.offset(frame)?,
        })
    }

    fn offset(&self, frame: &Frame) -> Result<DVector<f64>> {
        let mut total = DVector::zeros(frame.n_rows());
        for (name, log) in &self.offsets {
            let x = frame.numeric(name)?;
            for (i, &v) in x.iter().enumerate() {
                let term = if *log { v.ln() } else { v };
                if !term.is_finite() {
                    return Err(SurveyIndexError::Numerical(format!(
                        "offset `{name}` is not finite at row {i} (value {v})"
                    )));
                }
                total[i] += term;
            }
        }
        Ok(total)
    }

    pub fn n_coef(&self) -> usize {
        self.column_names.len()
    }

    pub fn penalties(&self) -> &[Penalty] {
        &self.penalties
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }
}

fn hstack(n: usize, blocks: &[DMatrix<f64>]) -> DMatrix<f64> {
    let p: usize = blocks.iter().map(|b| b.ncols()).sum();
    let mut x = DMatrix::zeros(n, p);
    let mut start = 0;
    for b in blocks {
        x.columns_mut(start, b.ncols()).copy_from(b);
        start += b.ncols();
    }
    x
}

fn spline_block(
    frame: &Frame,
    var: &str,
    k: usize,
    by: Option<String>,
    explicit: &BTreeMap<String, Vec<f64>>,
) -> Result<(Block, Vec<DMatrix<f64>>)> {
    let x = finite_numeric(frame, var)?;
    let knots = knots_for(var, x, k, explicit)?;
    let dim = basis_len(&knots, SPLINE_DEGREE);
    let s = difference_penalty(dim, PENALTY_ORDER)?;

    let z = constraint_null_space(&column_sums(&spline_basis(x, &knots)))?;
    let s = z.transpose() * s * &z;

    Ok((
        Block::Spline {
            var: var.to_string(),
            knots,
            z,
            by,
        },
        vec![s],
    ))
}

fn tensor_block(
    frame: &Frame,
    vars: [&str; 2],
    k: usize,
    by: Option<String>,
    explicit: &BTreeMap<String, Vec<f64>>,
) -> Result<(Block, Vec<DMatrix<f64>>)> {
    let margin = ((k as f64).sqrt().round() as usize).max(MIN_MARGIN);
    let x1 = finite_numeric(frame, vars[0])?;
    let x2 = finite_numeric(frame, vars[1])?;
    let k1 = knots_for(vars[0], x1, margin, explicit)?;
    let k2 = knots_for(vars[1], x2, margin, explicit)?;
    let (m1, m2) = (basis_len(&k1, SPLINE_DEGREE), basis_len(&k2, SPLINE_DEGREE));

    let z = constraint_null_space(&column_sums(&tensor_basis(x1, x2, &k1, &k2)))?;

    let s1 = kronecker(&difference_penalty(m1, PENALTY_ORDER)?, &DMatrix::identity(m2, m2));
    let s2 = kronecker(&DMatrix::identity(m1, m1), &difference_penalty(m2, PENALTY_ORDER)?);
    let penalties = vec![z.transpose() * s1 * &z, z.transpose() * s2 * &z];

    Ok((
        Block::Tensor {
            vars: [vars[0].to_string(), vars[1].to_string()],
            knots: [k1, k2],
            z,
            by,
        },
        penalties,
    ))
}
