//! # graphld
//!
//! Heritability partitioning from GWAS summary statistics using LD graphical models
//! (LDGMs). The crate is organised bottom-up:
//!
//! - [`block`] and [`io`]: the immutable per-block precision matrices and their
//!   variant maps, loaded from `.edgelist`/`.snplist` files.
//! - [`cholesky`]: the sparse factorization every operator solve goes through.
//! - [`precision`]: the [`precision::PrecisionOperator`], a Schur-complement aware
//!   linear operator over one block.
//! - [`parallel`]: a worker pool that keeps loaded blocks resident per worker.
//! - [`reml`]: the Gaussian likelihood engine and the graphREML optimizer.

pub mod block;
pub mod cholesky;
pub mod faer_ndarray;
pub mod io;
pub mod precision;

#[path = "../parallel/mod.rs"]
pub mod parallel;

#[path = "../reml/mod.rs"]
pub mod reml;
