// ldgm/precision.rs

//! # Precision Operator
//!
//! [`PrecisionOperator`] turns one [`LdgmBlock`] into a linear operator over an
//! *active* subset `A` of its rows. With `B` the remaining rows and
//!
//! ```text
//! M = scale · P + diag(offset) + ridge · I
//! ```
//!
//! the operator represents the Schur complement `M_A = M_AA − M_AB M_BB⁻¹ M_BA`, i.e. the
//! precision of the variables in `A` after the ones in `B` are marginalized out. Its
//! inverse is `(M⁻¹)_AA`, the corresponding block of the correlation-like matrix, which
//! is what [`PrecisionOperator::solve`] applies.
//!
//! Two factorizations back the operator, both computed on first use and dropped by any
//! mutation of the diagonal or the scale:
//!
//! - the joint factor of `M`, used by `solve`, `inverse_diagonal` and `simulate`;
//! - the factor of `M_BB` (the Schur complement state), used by `apply`.
//!
//! Their symbolic analyses depend only on the active set and survive those mutations.
//!
//! `log_determinant` combines the two: `log|M_A| = log|M| − log|M_BB|`.

use crate::block::LdgmBlock;
use crate::cholesky::{CholeskyError, CholeskyPattern, SparseCholesky};
use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use std::cell::OnceCell;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperatorError {
    #[error(
        "dimension mismatch: the operator acts on {expected} variants but the input has length {found}"
    )]
    DimensionMismatch { expected: usize, found: usize },

    #[error("index {index} is outside the active set of size {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("row {row} is not part of the active set")]
    InactiveRow { row: usize },

    #[error("index {0} appears more than once in the requested subset")]
    DuplicateIndex(usize),

    #[error("numerical instability in block '{block}': {source}")]
    NumericalInstability {
        block: String,
        #[source]
        source: CholeskyError,
    },
}

/// The operator contract other consumers (clumping, BLUP, likelihoods) program against.
pub trait LinearOperator {
    fn shape(&self) -> (usize, usize);

    /// Matrix-vector product with the operator.
    fn apply(&self, v: ArrayView1<'_, f64>) -> Result<Array1<f64>, OperatorError>;

    /// Product with the inverse of the operator.
    fn solve(&self, v: ArrayView1<'_, f64>) -> Result<Array1<f64>, OperatorError>;

    /// Operator over a subset of the current coordinates, obtained by eliminating the
    /// others. `indices` are positions in the current coordinate system.
    fn restrict(&self, indices: &[usize]) -> Result<Self, OperatorError>
    where
        Self: Sized;
}

#[derive(Clone, Debug)]
struct EliminatedFactor {
    rows: Vec<usize>,
    factor: SparseCholesky,
}

/// Lazily computed factorizations. An empty cell means "invalid, recompute on use".
#[derive(Clone, Debug, Default)]
struct FactorCache {
    joint: OnceCell<SparseCholesky>,
    eliminated: OnceCell<Option<EliminatedFactor>>,
}

/// Symbolic analyses, valid for as long as the active set is unchanged.
#[derive(Clone, Debug, Default)]
struct PatternCache {
    joint: OnceCell<CholeskyPattern>,
    eliminated: OnceCell<CholeskyPattern>,
}

#[derive(Clone, Debug)]
pub struct PrecisionOperator {
    block: Arc<LdgmBlock>,
    scale: f64,
    active: Vec<usize>,
    position: Vec<Option<usize>>,
    offset: Vec<f64>,
    ridge: f64,
    cache: FactorCache,
    patterns: PatternCache,
}

impl PrecisionOperator {
    /// Operator over every row of the block, with unit scale and no diagonal offset.
    pub fn new(block: Arc<LdgmBlock>) -> Self {
        let rows: Vec<usize> = (0..block.dim()).collect();
        let offset = vec![0.0; block.dim()];
        Self::with_active(block, 1.0, rows, offset, 0.0, OnceCell::new())
    }

    fn with_active(
        block: Arc<LdgmBlock>,
        scale: f64,
        active: Vec<usize>,
        offset: Vec<f64>,
        ridge: f64,
        joint_pattern: OnceCell<CholeskyPattern>,
    ) -> Self {
        let mut position = vec![None; block.dim()];
        for (p, &row) in active.iter().enumerate() {
            position[row] = Some(p);
        }
        Self {
            block,
            scale,
            active,
            position,
            offset,
            ridge,
            cache: FactorCache::default(),
            patterns: PatternCache {
                joint: joint_pattern,
                eliminated: OnceCell::new(),
            },
        }
    }

    /// Multiplies the block's precision matrix by `scale` (e.g. `1 / sample_size`).
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self.release_factorization();
        self
    }

    pub fn block(&self) -> &Arc<LdgmBlock> {
        &self.block
    }

    /// Block rows in operator coordinate order.
    pub fn active_rows(&self) -> &[usize] {
        &self.active
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn ridge(&self) -> f64 {
        self.ridge
    }

    /// The diagonal offset on the active rows.
    pub fn diagonal(&self) -> Array1<f64> {
        self.active.iter().map(|&row| self.offset[row]).collect()
    }

    /// Whether the joint factorization is currently cached.
    pub fn is_factorized(&self) -> bool {
        self.cache.joint.get().is_some()
    }

    /// Replaces the diagonal offset on the active rows.
    pub fn set_diagonal(&mut self, values: ArrayView1<'_, f64>) -> Result<(), OperatorError> {
        self.check_len(values.len())?;
        for (&row, &value) in self.active.iter().zip(values.iter()) {
            self.offset[row] = value;
        }
        self.release_factorization();
        Ok(())
    }

    /// Adds to the diagonal offset on the active rows.
    pub fn update_diagonal(&mut self, values: ArrayView1<'_, f64>) -> Result<(), OperatorError> {
        self.check_len(values.len())?;
        for (&row, &value) in self.active.iter().zip(values.iter()) {
            self.offset[row] += value;
        }
        self.release_factorization();
        Ok(())
    }

    /// Uniform regularization added to every row of the block, eliminated rows included.
    pub fn set_ridge(&mut self, ridge: f64) {
        if ridge != self.ridge {
            self.ridge = ridge;
            self.release_factorization();
        }
    }

    /// Drops cached factorizations; the next use recomputes them.
    pub fn release_factorization(&mut self) {
        self.cache = FactorCache::default();
    }

    /// Mean diagonal of `M` over all block rows, the natural unit for a ridge.
    pub fn mean_diagonal(&self) -> f64 {
        let n = self.block.dim();
        let mut total = 0.0;
        for j in 0..n {
            let (rows, values) = self.block.column(j);
            for (&i, &value) in rows.iter().zip(values) {
                if i == j {
                    total += self.scale * value;
                }
            }
            total += self.offset[j] + self.ridge;
        }
        total / n as f64
    }

    /// Operator over the given block rows, which must all be active.
    pub fn restrict_to_rows(&self, rows: &[usize]) -> Result<Self, OperatorError> {
        let mut seen = HashSet::with_capacity(rows.len());
        for &row in rows {
            if self.position.get(row).copied().flatten().is_none() {
                return Err(OperatorError::InactiveRow { row });
            }
            if !seen.insert(row) {
                return Err(OperatorError::DuplicateIndex(row));
            }
        }
        Ok(Self::with_active(
            Arc::clone(&self.block),
            self.scale,
            rows.to_vec(),
            self.offset.clone(),
            self.ridge,
            self.patterns.joint.clone(),
        ))
    }

    /// `log|M_A|`, from the same factorizations that back `solve` and `apply`.
    pub fn log_determinant(&self) -> Result<f64, OperatorError> {
        let joint = self.joint_factor()?.log_determinant();
        let eliminated = match self.eliminated_factor()? {
            Some(eliminated) => eliminated.factor.log_determinant(),
            None => 0.0,
        };
        Ok(joint - eliminated)
    }

    /// Diagonal of the inverse operator, `diag((M⁻¹)_AA)`.
    pub fn inverse_diagonal(&self) -> Result<Array1<f64>, OperatorError> {
        let diagonal = self.joint_factor()?.inverse_diagonal();
        Ok(self.active.iter().map(|&row| diagonal[row]).collect())
    }

    /// Precision-premultiplied statistics `M_A z / √n` for z-scores `z`.
    pub fn premultiply(
        &self,
        z: ArrayView1<'_, f64>,
        sample_size: f64,
    ) -> Result<Array1<f64>, OperatorError> {
        Ok(self.apply(z)? / sample_size.sqrt())
    }

    /// Draws a vector whose covariance is the operator `M_A`.
    ///
    /// `y = Pᵀ L⁻ᵀ ε` has covariance `M⁻¹`, so `y_A` has covariance `M_A⁻¹` and `M_A y_A`
    /// has covariance `M_A`.
    pub fn simulate<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Array1<f64>, OperatorError> {
        let joint = self.joint_factor()?;
        let noise: Vec<f64> = (0..self.block.dim())
            .map(|_| StandardNormal.sample(rng))
            .collect();
        let y = joint.color_noise(&noise);
        let restricted: Array1<f64> = self.active.iter().map(|&row| y[row]).collect();
        self.apply(restricted.view())
    }

    /// Dense copy of the operator, for small blocks and diagnostics.
    pub fn to_dense(&self) -> Result<Array2<f64>, OperatorError> {
        let n = self.len();
        let mut dense = Array2::<f64>::zeros((n, n));
        let mut unit = Array1::<f64>::zeros(n);
        for j in 0..n {
            unit[j] = 1.0;
            dense.column_mut(j).assign(&self.apply(unit.view())?);
            unit[j] = 0.0;
        }
        Ok(dense)
    }

    fn check_len(&self, found: usize) -> Result<(), OperatorError> {
        if found != self.active.len() {
            return Err(OperatorError::DimensionMismatch {
                expected: self.active.len(),
                found,
            });
        }
        Ok(())
    }

    fn instability(&self, source: CholeskyError) -> OperatorError {
        OperatorError::NumericalInstability {
            block: self.block.name().to_string(),
            source,
        }
    }

    /// Upper triangle of `M` restricted to `rows`, with `local` mapping block rows to
    /// their position within `rows`. Every diagonal entry is stored, so the pattern does
    /// not depend on the offset.
    fn assemble(
        &self,
        rows: &[usize],
        local: impl Fn(usize) -> Option<usize>,
    ) -> Result<SparseColMat<usize, f64>, OperatorError> {
        let mut triplets = Vec::with_capacity(self.block.nnz() / 2 + 2 * rows.len());
        for (c, &col) in rows.iter().enumerate() {
            let (row_idx, values) = self.block.column(col);
            for (&row, &value) in row_idx.iter().zip(values) {
                if let Some(r) = local(row).filter(|&r| r <= c) {
                    triplets.push(Triplet::new(r, c, self.scale * value));
                }
            }
            triplets.push(Triplet::new(c, c, self.offset[col] + self.ridge));
        }
        SparseColMat::try_new_from_triplets(rows.len(), rows.len(), &triplets).map_err(|err| {
            self.instability(CholeskyError::Analysis(format!(
                "failed to assemble sparse matrix: {err:?}"
            )))
        })
    }

    fn factorize(
        &self,
        pattern: &OnceCell<CholeskyPattern>,
        matrix: &SparseColMat<usize, f64>,
    ) -> Result<SparseCholesky, OperatorError> {
        let pattern = match pattern.get() {
            Some(pattern) => pattern.clone(),
            None => {
                let analyzed =
                    CholeskyPattern::analyze(matrix).map_err(|err| self.instability(err))?;
                pattern.get_or_init(|| analyzed).clone()
            }
        };
        SparseCholesky::factorize_with(pattern, matrix).map_err(|err| self.instability(err))
    }

    fn joint_factor(&self) -> Result<&SparseCholesky, OperatorError> {
        if let Some(factor) = self.cache.joint.get() {
            return Ok(factor);
        }
        let rows: Vec<usize> = (0..self.block.dim()).collect();
        let matrix = self.assemble(&rows, Some)?;
        let factor = self.factorize(&self.patterns.joint, &matrix)?;
        Ok(self.cache.joint.get_or_init(|| factor))
    }

    fn eliminated_factor(&self) -> Result<Option<&EliminatedFactor>, OperatorError> {
        if let Some(cached) = self.cache.eliminated.get() {
            return Ok(cached.as_ref());
        }
        let rows: Vec<usize> = (0..self.block.dim())
            .filter(|&row| self.position[row].is_none())
            .collect();
        let computed = if rows.is_empty() {
            None
        } else {
            let mut local = vec![None; self.block.dim()];
            for (q, &row) in rows.iter().enumerate() {
                local[row] = Some(q);
            }
            let matrix = self.assemble(&rows, |row| local[row])?;
            let factor = self.factorize(&self.patterns.eliminated, &matrix)?;
            Some(EliminatedFactor { rows, factor })
        };
        Ok(self.cache.eliminated.get_or_init(|| computed).as_ref())
    }

    /// `M x` over all block rows.
    fn joint_product(&self, x: &[f64]) -> Vec<f64> {
        let n = self.block.dim();
        let mut y = vec![0.0f64; n];
        for col in 0..n {
            let x_col = x[col];
            if x_col == 0.0 {
                continue;
            }
            let (rows, values) = self.block.column(col);
            for (&row, &value) in rows.iter().zip(values) {
                y[row] += self.scale * value * x_col;
            }
            y[col] += (self.offset[col] + self.ridge) * x_col;
        }
        y
    }

    fn scatter(&self, v: ArrayView1<'_, f64>) -> Vec<f64> {
        let mut x = vec![0.0f64; self.block.dim()];
        for (&row, &value) in self.active.iter().zip(v.iter()) {
            x[row] = value;
        }
        x
    }
}

impl LinearOperator for PrecisionOperator {
    fn shape(&self) -> (usize, usize) {
        (self.active.len(), self.active.len())
    }

    fn apply(&self, v: ArrayView1<'_, f64>) -> Result<Array1<f64>, OperatorError> {
        self.check_len(v.len())?;
        let product = self.joint_product(&self.scatter(v));
        let Some(eliminated) = self.eliminated_factor()? else {
            return Ok(self.active.iter().map(|&row| product[row]).collect());
        };

        let mut coupled: Vec<f64> = eliminated.rows.iter().map(|&row| product[row]).collect();
        eliminated.factor.solve_in_place(&mut coupled);
        let mut padded = vec![0.0f64; self.block.dim()];
        for (&row, &value) in eliminated.rows.iter().zip(&coupled) {
            padded[row] = value;
        }
        let correction = self.joint_product(&padded);
        Ok(self
            .active
            .iter()
            .map(|&row| product[row] - correction[row])
            .collect())
    }

    fn solve(&self, v: ArrayView1<'_, f64>) -> Result<Array1<f64>, OperatorError> {
        self.check_len(v.len())?;
        let factor = self.joint_factor()?;
        let mut x = self.scatter(v);
        factor.solve_in_place(&mut x);
        Ok(self.active.iter().map(|&row| x[row]).collect())
    }

    fn restrict(&self, indices: &[usize]) -> Result<Self, OperatorError> {
        let mut rows = Vec::with_capacity(indices.len());
        for &index in indices {
            let row = self
                .active
                .get(index)
                .copied()
                .ok_or(OperatorError::IndexOutOfRange {
                    index,
                    len: self.active.len(),
                })?;
            rows.push(row);
        }
        self.restrict_to_rows(&rows).map_err(|err| match err {
            OperatorError::DuplicateIndex(row) => {
                OperatorError::DuplicateIndex(self.position[row].unwrap_or(row))
            }
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::faer_ndarray::{FaerCholesky, spd_inverse};
    use approx::assert_abs_diff_eq;
    use faer::Side;
    use ndarray::{Array1, Array2, array};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Precision matrix of a stationary AR(1) chain, plus a long-range edge.
    fn chain_precision(n: usize, rho: f64) -> Array2<f64> {
        let mut p = Array2::<f64>::zeros((n, n));
        let scale = 1.0 / (1.0 - rho * rho);
        for i in 0..n {
            p[[i, i]] = if i == 0 || i == n - 1 { scale } else { (1.0 + rho * rho) * scale };
            if i + 1 < n {
                p[[i, i + 1]] = -rho * scale;
                p[[i + 1, i]] = -rho * scale;
            }
        }
        p[[0, n - 1]] = 0.05;
        p[[n - 1, 0]] = 0.05;
        p
    }

    fn operator(n: usize) -> (PrecisionOperator, Array2<f64>) {
        let dense = chain_precision(n, 0.6);
        let block = LdgmBlock::from_dense("chain", &dense, None).unwrap();
        (PrecisionOperator::new(Arc::new(block)), dense)
    }

    fn random_vector(n: usize, seed: u64) -> Array1<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| StandardNormal.sample(&mut rng)).collect()
    }

    fn assert_close(a: &Array1<f64>, b: &Array1<f64>, tol: f64) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = tol);
        }
    }

    #[test]
    fn solve_and_apply_round_trip_on_full_block() {
        let (mut op, _) = operator(12);
        op.set_diagonal(Array1::from_elem(12, 0.3).view()).unwrap();
        let v = random_vector(12, 1);
        assert_close(&op.apply(op.solve(v.view()).unwrap().view()).unwrap(), &v, 1e-10);
        assert_close(&op.solve(op.apply(v.view()).unwrap().view()).unwrap(), &v, 1e-10);
    }

    #[test]
    fn solve_and_apply_round_trip_on_subset() {
        let (op, _) = operator(15);
        let mut sub = op.restrict(&[0, 2, 3, 7, 8, 14]).unwrap().with_scale(0.1);
        sub.set_diagonal(array![0.2, 0.1, 0.4, 0.3, 0.05, 0.2].view())
            .unwrap();
        for seed in 0..3 {
            let v = random_vector(6, seed);
            assert_close(&sub.apply(sub.solve(v.view()).unwrap().view()).unwrap(), &v, 1e-10);
            assert_close(&sub.solve(sub.apply(v.view()).unwrap().view()).unwrap(), &v, 1e-10);
        }
    }

    #[test]
    fn restricted_solve_matches_dense_correlation_block() {
        let (op, dense) = operator(10);
        let correlation = spd_inverse(&dense).unwrap();
        let indices = [1usize, 4, 5, 8];
        let restricted = op.restrict(&indices).unwrap();
        let v = random_vector(indices.len(), 7);

        let solved = restricted.solve(v.view()).unwrap();
        let sub = Array2::from_shape_fn((4, 4), |(i, j)| correlation[[indices[i], indices[j]]]);
        assert_close(&solved, &sub.dot(&v), 1e-10);

        let applied = restricted.apply(v.view()).unwrap();
        let schur = spd_inverse(&sub).unwrap();
        assert_close(&applied, &schur.dot(&v), 1e-9);
    }

    #[test]
    fn nested_restriction_equals_direct_restriction() {
        let (op, _) = operator(9);
        let outer = op.restrict(&[8, 6, 4, 2, 0]).unwrap();
        let nested = outer.restrict(&[1, 3]).unwrap();
        let direct = op.restrict(&[6, 2]).unwrap();
        assert_eq!(nested.active_rows(), direct.active_rows());
        let v = array![0.5, -1.5];
        assert_close(
            &nested.apply(v.view()).unwrap(),
            &direct.apply(v.view()).unwrap(),
            1e-12,
        );
    }

    #[test]
    fn log_determinant_matches_dense_schur_complement() {
        let (op, dense) = operator(8);
        let indices = [0usize, 3, 4, 6];
        let offsets = array![0.5, 0.25, 1.0, 0.75];
        let mut sub = op.restrict(&indices).unwrap().with_scale(0.5);
        sub.set_diagonal(offsets.view()).unwrap();

        let mut joint = &dense * 0.5;
        for (k, &row) in indices.iter().enumerate() {
            joint[[row, row]] += offsets[k];
        }
        let inverse = spd_inverse(&joint).unwrap();
        let block = Array2::from_shape_fn((4, 4), |(i, j)| inverse[[indices[i], indices[j]]]);
        let factor = block.cholesky(Side::Lower).unwrap();
        let expected = -2.0 * factor.diag().mapv(f64::ln).sum();
        assert_abs_diff_eq!(sub.log_determinant().unwrap(), expected, epsilon = 1e-10);

        let diagonal = sub.inverse_diagonal().unwrap();
        for k in 0..4 {
            assert_abs_diff_eq!(diagonal[k], block[[k, k]], epsilon = 1e-12);
        }
    }

    #[test]
    fn diagonal_updates_invalidate_lazily() {
        let (mut op, _) = operator(6);
        let v = random_vector(6, 3);
        let before = op.solve(v.view()).unwrap();
        assert!(op.is_factorized());

        op.set_diagonal(Array1::from_elem(6, 1.0).view()).unwrap();
        assert!(!op.is_factorized());
        op.update_diagonal(Array1::from_elem(6, 1.0).view()).unwrap();
        assert!(!op.is_factorized());
        assert_close(&op.diagonal(), &Array1::from_elem(6, 2.0), 0.0);

        let after = op.solve(v.view()).unwrap();
        assert!(op.is_factorized());
        assert!((&before - &after).iter().any(|d| d.abs() > 1e-6));

        op.set_ridge(0.5);
        assert!(!op.is_factorized());
    }

    #[test]
    fn dimension_and_index_errors() {
        let (op, _) = operator(5);
        assert_eq!(
            op.solve(Array1::zeros(4).view()).unwrap_err(),
            OperatorError::DimensionMismatch { expected: 5, found: 4 }
        );
        assert_eq!(
            op.restrict(&[0, 5]).unwrap_err(),
            OperatorError::IndexOutOfRange { index: 5, len: 5 }
        );
        assert_eq!(
            op.restrict(&[1, 1]).unwrap_err(),
            OperatorError::DuplicateIndex(1)
        );
        let sub = op.restrict(&[0, 2]).unwrap();
        assert_eq!(
            sub.restrict_to_rows(&[1]).unwrap_err(),
            OperatorError::InactiveRow { row: 1 }
        );
    }

    #[test]
    fn indefinite_block_signals_instability() {
        let block = LdgmBlock::from_dense("bad", &array![[1.0, 2.0], [2.0, 1.0]], None).unwrap();
        let op = PrecisionOperator::new(Arc::new(block));
        match op.solve(array![1.0, 1.0].view()) {
            Err(OperatorError::NumericalInstability { block, .. }) => assert_eq!(block, "bad"),
            other => panic!("expected numerical instability, got {other:?}"),
        }
        assert!(!op.is_factorized());
    }

    #[test]
    fn simulated_vectors_have_operator_covariance() {
        let (op, _) = operator(5);
        let sub = op.restrict(&[0, 2, 4]).unwrap();
        let target = sub.to_dense().unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let draws = 20_000;
        let mut covariance = Array2::<f64>::zeros((3, 3));
        for _ in 0..draws {
            let x = sub.simulate(&mut rng).unwrap();
            for i in 0..3 {
                for j in 0..3 {
                    covariance[[i, j]] += x[i] * x[j] / draws as f64;
                }
            }
        }
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(covariance[[i, j]], target[[i, j]], epsilon = 0.1);
            }
        }
    }
}
