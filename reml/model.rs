// reml/model.rs

//! Link between annotation parameters and per-variant heritability.
//!
//! Variant `i` with annotation row `x_i` gets `D_i = softplus(x_i · a)`. The softplus keeps
//! every `D_i` positive for any parameter vector, so the optimizer works unconstrained.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// `log(1 + e^x)`, evaluated without overflow.
pub fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Inverse of [`softplus`] for `y > 0`.
pub fn softplus_inverse(y: f64) -> f64 {
    if y > 30.0 { y + (-(-y).exp()).ln_1p() } else { y.exp_m1().ln() }
}

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `D = softplus(X a)` for annotations `X` (variants × annotations).
pub fn per_variant_heritability(
    annotations: ArrayView2<'_, f64>,
    params: ArrayView1<'_, f64>,
) -> Array1<f64> {
    annotations.dot(&params).mapv(softplus)
}

/// `∂D/∂a`, a variants × parameters matrix with rows `σ(x_i · a) x_i`.
pub fn heritability_jacobian(
    annotations: ArrayView2<'_, f64>,
    params: ArrayView1<'_, f64>,
) -> Array2<f64> {
    let slopes = annotations.dot(&params).mapv(sigmoid);
    let mut jacobian = annotations.to_owned();
    for (mut row, slope) in jacobian.axis_iter_mut(Axis(0)).zip(slopes.iter()) {
        row *= *slope;
    }
    jacobian
}

/// Heritability carried by each annotation, `h_c = Σ_i x_ic D_i`, together with its
/// Jacobian with respect to the parameters (`annotations × parameters`).
pub fn annotation_heritability(
    annotations: ArrayView2<'_, f64>,
    params: ArrayView1<'_, f64>,
) -> (Array1<f64>, Array2<f64>) {
    let heritability = annotations.t().dot(&per_variant_heritability(annotations, params));
    let jacobian = annotations
        .t()
        .dot(&heritability_jacobian(annotations, params));
    (heritability, jacobian)
}

/// Parameters giving every variant the same heritability `h2 / n_variants`, with all
/// non-baseline parameters at zero. The first annotation must be the all-ones baseline.
pub fn baseline_parameters(n_params: usize, total_heritability: f64, n_variants: usize) -> Array1<f64> {
    let mut params = Array1::<f64>::zeros(n_params);
    if n_params > 0 && n_variants > 0 {
        params[0] = softplus_inverse(total_heritability / n_variants as f64);
    }
    params
}
