// ldgm/cholesky.rs

//! # Sparse Cholesky
//!
//! Thin layer over faer's sparse `L Lᵀ` factorization for the symmetric positive-definite
//! matrices the precision operator builds out of an LDGM block. Symbolic analysis (AMD
//! fill-reducing ordering plus the elimination structure) depends only on the sparsity
//! pattern and is shared through [`CholeskyPattern`], so a diagonal update costs one
//! numeric factorization.
//!
//! The analysis always selects the simplicial layout. That keeps `L` available as a plain
//! column-compressed matrix, from which the log-determinant and the diagonal of the
//! inverse (selected inversion on the pattern of `L`) are read directly.

use faer::dyn_stack::{MemBuffer, MemStack};
use faer::linalg::cholesky::llt::factor::LltError as PivotError;
use faer::sparse::SparseColMat;
use faer::sparse::linalg::cholesky::{
    CholeskySymbolicParams, LltRef, SymbolicCholesky, SymbolicCholeskyRaw, SymmetricOrdering,
    factorize_symbolic_cholesky,
};
use faer::sparse::linalg::SupernodalThreshold;
use faer::{Conj, MatMut, Par, Side};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CholeskyError {
    #[error("matrix is not positive definite: non-positive pivot at row {row}")]
    NotPositiveDefinite { row: usize },

    #[error("symbolic analysis failed: {0}")]
    Analysis(String),

    #[error("matrix is {found}x{found} but the factorization pattern is {expected}x{expected}")]
    PatternMismatch { expected: usize, found: usize },
}

/// Symbolic factorization of one sparsity pattern, reusable across numeric updates.
#[derive(Clone, Debug)]
pub struct CholeskyPattern {
    symbolic: Arc<SymbolicCholesky<usize>>,
    /// `forward[p]` is the matrix row eliminated at step `p`.
    forward: Vec<usize>,
    /// `inverse[row]` is the elimination step of matrix row `row`.
    inverse: Vec<usize>,
}

impl CholeskyPattern {
    /// Analyzes the upper triangle of `matrix`.
    pub fn analyze(matrix: &SparseColMat<usize, f64>) -> Result<Self, CholeskyError> {
        let n = matrix.nrows();
        let params = CholeskySymbolicParams {
            supernodal_flop_ratio_threshold: SupernodalThreshold::FORCE_SIMPLICIAL,
            ..Default::default()
        };
        let symbolic =
            factorize_symbolic_cholesky(matrix.symbolic(), Side::Upper, SymmetricOrdering::Amd, params)
                .map_err(|err| CholeskyError::Analysis(format!("{err:?}")))?;
        if !matches!(symbolic.raw(), SymbolicCholeskyRaw::Simplicial(_)) {
            return Err(CholeskyError::Analysis(
                "expected a simplicial factorization layout".to_string(),
            ));
        }
        let (forward, inverse) = match symbolic.perm() {
            Some(perm) => {
                let (forward, inverse) = perm.arrays();
                (forward.to_vec(), inverse.to_vec())
            }
            None => ((0..n).collect(), (0..n).collect()),
        };
        Ok(Self {
            symbolic: Arc::new(symbolic),
            forward,
            inverse,
        })
    }

    pub fn dim(&self) -> usize {
        self.forward.len()
    }

    /// Column pointers and row indices of `L`, in elimination order.
    fn factor_structure(&self) -> (&[usize], &[usize]) {
        match self.symbolic.raw() {
            SymbolicCholeskyRaw::Simplicial(simplicial) => (simplicial.col_ptr(), simplicial.row_idx()),
            // `analyze` only admits simplicial layouts.
            SymbolicCholeskyRaw::Supernodal(_) => (&[], &[]),
        }
    }
}

/// The numeric factor `P A Pᵀ = L Lᵀ`, where `P` is the fill-reducing permutation.
///
/// Within each column of `L` the diagonal comes first and the remaining rows increase.
#[derive(Clone, Debug)]
pub struct SparseCholesky {
    pattern: CholeskyPattern,
    values: Vec<f64>,
}

impl SparseCholesky {
    /// Analyzes and factorizes the upper triangle of `matrix`.
    pub fn factorize(matrix: &SparseColMat<usize, f64>) -> Result<Self, CholeskyError> {
        let pattern = CholeskyPattern::analyze(matrix)?;
        Self::factorize_with(pattern, matrix)
    }

    /// Numeric factorization on a pattern analyzed earlier for the same structure.
    pub fn factorize_with(
        pattern: CholeskyPattern,
        matrix: &SparseColMat<usize, f64>,
    ) -> Result<Self, CholeskyError> {
        if matrix.nrows() != pattern.dim() || matrix.ncols() != pattern.dim() {
            return Err(CholeskyError::PatternMismatch {
                expected: pattern.dim(),
                found: matrix.nrows(),
            });
        }
        let symbolic = &pattern.symbolic;
        let mut values = vec![0.0f64; symbolic.len_val()];
        let mut mem = MemBuffer::new(
            symbolic.factorize_numeric_llt_scratch::<f64>(Par::Seq, Default::default()),
        );
        let outcome = symbolic
            .factorize_numeric_llt(
                &mut values,
                matrix.as_ref(),
                Side::Upper,
                Default::default(),
                Par::Seq,
                MemStack::new(&mut mem),
                Default::default(),
            )
            .map(|_| ());
        if let Err(err) = outcome {
            return Err(match err {
                PivotError::NonPositivePivot { index } => CholeskyError::NotPositiveDefinite {
                    row: pattern.forward.get(index).copied().unwrap_or(index),
                },
            });
        }
        Ok(Self { pattern, values })
    }

    pub fn pattern(&self) -> &CholeskyPattern {
        &self.pattern
    }

    pub fn dim(&self) -> usize {
        self.pattern.dim()
    }

    /// Number of stored entries of `L`, diagonal included.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// `log|A| = 2 Σ log L_jj`.
    pub fn log_determinant(&self) -> f64 {
        let (col_ptr, _) = self.pattern.factor_structure();
        (0..self.dim())
            .map(|j| self.values[col_ptr[j]].ln())
            .sum::<f64>()
            * 2.0
    }

    /// Overwrites `x` with `A⁻¹ x`.
    pub fn solve_in_place(&self, x: &mut [f64]) {
        debug_assert_eq!(x.len(), self.dim());
        let n = x.len();
        let symbolic = &*self.pattern.symbolic;
        let llt = LltRef::<'_, usize, f64>::new(symbolic, &self.values);
        let mut mem = MemBuffer::new(symbolic.solve_in_place_scratch::<f64>(1, Par::Seq));
        llt.solve_in_place_with_conj(
            Conj::No,
            MatMut::from_column_major_slice_mut(x, n, 1),
            Par::Seq,
            MemStack::new(&mut mem),
        );
    }

    /// `Pᵀ L⁻ᵀ ε`. For white noise `ε` the result has covariance `A⁻¹`.
    pub fn color_noise(&self, noise: &[f64]) -> Vec<f64> {
        debug_assert_eq!(noise.len(), self.dim());
        let (col_ptr, row_idx) = self.pattern.factor_structure();
        let mut w = noise.to_vec();
        for j in (0..self.dim()).rev() {
            let start = col_ptr[j];
            let mut acc = w[j];
            for p in start + 1..col_ptr[j + 1] {
                acc -= self.values[p] * w[row_idx[p]];
            }
            w[j] = acc / self.values[start];
        }
        self.pattern.inverse.iter().map(|&step| w[step]).collect()
    }

    /// Diagonal of `A⁻¹` by selected inversion (Takahashi recurrences).
    ///
    /// Only entries of the inverse on the pattern of `L` are formed, which is closed
    /// under the recurrence because every column pattern of `L` is a clique of the
    /// filled graph.
    pub fn inverse_diagonal(&self) -> Vec<f64> {
        let (col_ptr, row_idx) = self.pattern.factor_structure();
        let mut z = vec![0.0f64; self.values.len()];
        let mut column_buffer: Vec<f64> = Vec::new();

        for j in (0..self.dim()).rev() {
            let start = col_ptr[j];
            let end = col_ptr[j + 1];
            let l_jj = self.values[start];
            let pattern = &row_idx[start + 1..end];
            let l_values = &self.values[start + 1..end];

            column_buffer.clear();
            for &i in pattern {
                let mut acc = 0.0;
                for (&k, &l_kj) in pattern.iter().zip(l_values) {
                    acc += l_kj * inverse_entry(col_ptr, row_idx, &z, i, k);
                }
                column_buffer.push(-acc / l_jj);
            }

            let mut diagonal = 1.0 / (l_jj * l_jj);
            for (&l_ij, &z_ij) in l_values.iter().zip(&column_buffer) {
                diagonal -= l_ij * z_ij / l_jj;
            }
            z[start] = diagonal;
            z[start + 1..end].copy_from_slice(&column_buffer);
        }

        self.pattern
            .inverse
            .iter()
            .map(|&step| z[col_ptr[step]])
            .collect()
    }
}

/// Entry `(i, k)` of the partially formed inverse, stored on the pattern of `L`.
fn inverse_entry(col_ptr: &[usize], row_idx: &[usize], z: &[f64], i: usize, k: usize) -> f64 {
    let (row, col) = if i >= k { (i, k) } else { (k, i) };
    let start = col_ptr[col];
    if row == col {
        return z[start];
    }
    let off_diagonal = &row_idx[start + 1..col_ptr[col + 1]];
    match off_diagonal.binary_search(&row) {
        Ok(offset) => z[start + 1 + offset],
        Err(_) => {
            debug_assert!(false, "entry ({row}, {col}) outside the factor pattern");
            0.0
        }
    }
}
