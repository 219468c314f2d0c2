#![allow(dead_code)]

use graphld::block::{LdgmBlock, VariantInfo};
use graphld::precision::PrecisionOperator;
use graphld::reml::{BlockSource, BlockStatistics, RemlConfig, Scores};
use ndarray::{Array1, Array2};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use std::sync::Arc;

/// Precision matrix of a unit-variance AR(1) chain as graph edges (each edge once).
pub fn ar1_edges(n: usize, rho: f64) -> Vec<(usize, usize, f64)> {
    let scale = 1.0 / (1.0 - rho * rho);
    let mut edges = Vec::with_capacity(2 * n);
    for i in 0..n {
        let diagonal = if i == 0 || i + 1 == n {
            scale
        } else {
            (1.0 + rho * rho) * scale
        };
        edges.push((i, i, diagonal));
        if i + 1 < n {
            edges.push((i, i + 1, -rho * scale));
        }
    }
    edges
}

pub fn ar1_block(name: &str, n: usize, rho: f64) -> Arc<LdgmBlock> {
    let variants = (0..n).map(VariantInfo::synthetic).collect();
    Arc::new(LdgmBlock::from_edges(name, n, &ar1_edges(n, rho), variants).unwrap())
}

/// A random sparse positive-definite precision: a chain plus a few long-range edges,
/// made diagonally dominant.
pub fn random_sparse_block(name: &str, n: usize, rng: &mut StdRng) -> Arc<LdgmBlock> {
    let mut dense = Array2::<f64>::zeros((n, n));
    for i in 0..n.saturating_sub(1) {
        let value = rng.gen_range(-0.6..0.6);
        dense[[i, i + 1]] = value;
        dense[[i + 1, i]] = value;
    }
    for _ in 0..n / 3 {
        let i = rng.gen_range(0..n);
        let j = rng.gen_range(0..n);
        if i != j {
            let value = rng.gen_range(-0.4..0.4);
            dense[[i, j]] = value;
            dense[[j, i]] = value;
        }
    }
    for i in 0..n {
        let off: f64 = dense.row(i).iter().map(|v| v.abs()).sum();
        dense[[i, i]] = off + rng.gen_range(0.2..1.0);
    }
    Arc::new(LdgmBlock::from_dense(name, &dense, None).unwrap())
}

pub fn random_vector(n: usize, rng: &mut StdRng) -> Array1<f64> {
    (0..n).map(|_| StandardNormal.sample(rng)).collect()
}

/// Baseline column of ones plus a binary annotation on every third variant.
pub fn two_annotations(n: usize) -> Array2<f64> {
    Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 || i % 3 == 0 { 1.0 } else { 0.0 })
}

pub fn baseline_annotation(n: usize) -> Array2<f64> {
    Array2::ones((n, 1))
}

/// Draws precision-premultiplied statistics from the model with heritability `diagonal`.
pub fn simulate_pz(
    block: &Arc<LdgmBlock>,
    rows: &[usize],
    diagonal: &Array1<f64>,
    sample_size: f64,
    rng: &mut StdRng,
) -> Array1<f64> {
    let mut operator = PrecisionOperator::new(Arc::clone(block))
        .restrict_to_rows(rows)
        .unwrap()
        .with_scale(1.0 / sample_size);
    operator.set_diagonal(diagonal.view()).unwrap();
    operator.simulate(rng).unwrap()
}

/// An in-memory block whose statistics follow the model at `params`.
pub fn simulated_source(
    block: Arc<LdgmBlock>,
    annotations: Array2<f64>,
    params: &Array1<f64>,
    sample_size: f64,
    rng: &mut StdRng,
) -> BlockSource {
    let rows: Vec<usize> = (0..block.dim()).collect();
    let diagonal = graphld::reml::model::per_variant_heritability(annotations.view(), params.view());
    let pz = simulate_pz(&block, &rows, &diagonal, sample_size, rng);
    let statistics =
        BlockStatistics::new(rows, Scores::Premultiplied(pz), annotations).unwrap();
    BlockSource::InMemory { block, statistics }
}

pub fn test_config(sample_size: f64, max_workers: usize) -> RemlConfig {
    RemlConfig {
        sample_size,
        max_workers,
        ..RemlConfig::default()
    }
}

pub fn names(n: usize) -> Vec<String> {
    (0..n)
        .map(|i| if i == 0 { "base".to_string() } else { format!("annot{i}") })
        .collect()
}
