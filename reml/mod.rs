//! # graphREML
//!
//! Restricted maximum likelihood estimation of annotation-stratified heritability from
//! precision-premultiplied GWAS statistics, one LDGM block at a time.

pub mod config;
pub mod estimate;
pub mod input;
pub mod likelihood;
pub mod model;
pub mod worker;

pub use config::{RegularizationConfig, RemlConfig, RunManifest};
pub use estimate::{
    AnnotationEstimate, ExcludedBlock, GenomeEvaluator, OptimizerStatus, RemlError, RemlResult,
    RemlTask, RemlWarning, fit, run_graphreml,
};
pub use input::{BlockSource, BlockStatistics, MatchBy, ScoreKind, Scores};
