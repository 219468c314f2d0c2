// reml/likelihood.rs

//! # Gaussian Likelihood Engine
//!
//! Pure functions of precision-premultiplied statistics `pz` and a [`PrecisionOperator`]
//! `M` whose diagonal already holds the per-variant heritability `D`. The model is
//! `pz ~ N(0, M)`, so every quantity is built from `b = M⁻¹ pz` (one `solve`), the log
//! determinant and the diagonal of `M⁻¹`, all taken from the operator's single cached
//! factorization for its current diagonal.

use crate::precision::{LinearOperator, OperatorError, PrecisionOperator};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::f64::consts::PI;

/// Log-likelihood, gradient and Hessian approximation of one block.
#[derive(Clone, Debug)]
pub struct LikelihoodTerms {
    pub log_likelihood: f64,
    pub gradient: Array1<f64>,
    pub hessian: Array2<f64>,
}

fn check_statistics(
    pz: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
) -> Result<(), OperatorError> {
    if pz.len() != operator.len() {
        return Err(OperatorError::DimensionMismatch {
            expected: operator.len(),
            found: pz.len(),
        });
    }
    Ok(())
}

fn check_jacobian(
    dd_da: ArrayView2<'_, f64>,
    operator: &PrecisionOperator,
) -> Result<(), OperatorError> {
    if dd_da.nrows() != operator.len() {
        return Err(OperatorError::DimensionMismatch {
            expected: operator.len(),
            found: dd_da.nrows(),
        });
    }
    Ok(())
}

/// `−½ [pzᵀ M⁻¹ pz + log|M| + n log 2π]`.
pub fn gaussian_log_likelihood(
    pz: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
) -> Result<f64, OperatorError> {
    check_statistics(pz, operator)?;
    let b = operator.solve(pz)?;
    log_likelihood_from_solution(pz, b.view(), operator)
}

fn log_likelihood_from_solution(
    pz: ArrayView1<'_, f64>,
    b: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
) -> Result<f64, OperatorError> {
    let n = pz.len() as f64;
    let quadratic = pz.dot(&b);
    let log_determinant = operator.log_determinant()?;
    Ok(-0.5 * (quadratic + log_determinant + n * (2.0 * PI).ln()))
}

/// Gradient with respect to the diagonal, `−½ [(M⁻¹)_ii − b_i²]`.
pub fn diagonal_gradient(
    pz: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
) -> Result<Array1<f64>, OperatorError> {
    check_statistics(pz, operator)?;
    let b = operator.solve(pz)?;
    diagonal_gradient_from_solution(b.view(), operator)
}

fn diagonal_gradient_from_solution(
    b: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
) -> Result<Array1<f64>, OperatorError> {
    let inverse_diagonal = operator.inverse_diagonal()?;
    Ok(ndarray::Zip::from(&inverse_diagonal)
        .and(&b)
        .map_collect(|&r, &b| -0.5 * (r - b * b)))
}

/// Gradient with respect to the parameters, `(∂D/∂a)ᵀ` times the diagonal gradient.
pub fn gradient(
    pz: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
    dd_da: ArrayView2<'_, f64>,
) -> Result<Array1<f64>, OperatorError> {
    check_jacobian(dd_da, operator)?;
    Ok(dd_da.t().dot(&diagonal_gradient(pz, operator)?))
}

/// Average of the observed and expected information, negated and halved:
/// `−½ (∂D/∂a)ᵀ [(b bᵀ) ∘ M⁻¹] (∂D/∂a)`.
///
/// The two informations only average to this form where the gradient vanishes, so the
/// result is a good curvature estimate near a stationary point and a rough one away from
/// it. Costs one solve per parameter.
pub fn hessian_approx(
    pz: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
    dd_da: ArrayView2<'_, f64>,
) -> Result<Array2<f64>, OperatorError> {
    check_statistics(pz, operator)?;
    check_jacobian(dd_da, operator)?;
    let b = operator.solve(pz)?;
    hessian_from_solution(b.view(), operator, dd_da)
}

fn hessian_from_solution(
    b: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
    dd_da: ArrayView2<'_, f64>,
) -> Result<Array2<f64>, OperatorError> {
    let k = dd_da.ncols();
    let mut hessian = Array2::<f64>::zeros((k, k));
    for (j, column) in dd_da.columns().into_iter().enumerate() {
        let weighted = &column * &b;
        let solved = operator.solve(weighted.view())?;
        let projected = dd_da.t().dot(&(&solved * &b));
        hessian.column_mut(j).assign(&(projected * -0.5));
    }
    // Symmetrize away rounding differences between the columns.
    let symmetric = (&hessian + &hessian.t()) * 0.5;
    Ok(symmetric)
}

/// All three quantities from one solve and one factorization.
pub fn evaluate(
    pz: ArrayView1<'_, f64>,
    operator: &PrecisionOperator,
    dd_da: ArrayView2<'_, f64>,
) -> Result<LikelihoodTerms, OperatorError> {
    check_statistics(pz, operator)?;
    check_jacobian(dd_da, operator)?;
    let b = operator.solve(pz)?;
    let log_likelihood = log_likelihood_from_solution(pz, b.view(), operator)?;
    let gradient = dd_da
        .t()
        .dot(&diagonal_gradient_from_solution(b.view(), operator)?);
    let hessian = hessian_from_solution(b.view(), operator, dd_da)?;
    Ok(LikelihoodTerms {
        log_likelihood,
        gradient,
        hessian,
    })
}
