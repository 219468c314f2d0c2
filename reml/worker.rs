// reml/worker.rs

//! The per-block half of graphREML: loading a block with its statistics into a ready
//! operator, and evaluating the block's likelihood terms for broadcast parameters.

use crate::io::{BlockLoadError, load_ldgm};
use crate::parallel::BlockTask;
use crate::precision::{OperatorError, PrecisionOperator};
use crate::reml::config::RegularizationConfig;
use crate::reml::input::{BlockSource, BlockStatistics, Scores, StatisticsError, read_block_statistics};
use crate::reml::likelihood;
use crate::reml::model;
use ndarray::{Array1, Array2};
use std::ops::AddAssign;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockError {
    #[error(transparent)]
    Load(#[from] BlockLoadError),

    #[error(transparent)]
    Statistics(#[from] StatisticsError),

    #[error(transparent)]
    Operator(#[from] OperatorError),

    #[error("block '{block}' has {found} annotation columns but the model has {expected}")]
    AnnotationCount {
        block: String,
        expected: usize,
        found: usize,
    },

    #[error("block '{block}' received {found} parameters but the model has {expected}")]
    ParameterCount {
        block: String,
        expected: usize,
        found: usize,
    },
}

impl BlockError {
    /// Whether the failure comes from factorizing the block.
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            BlockError::Operator(OperatorError::NumericalInstability { .. })
        )
    }
}

/// What the coordinator asks of every block in one dispatch.
#[derive(Clone, Debug)]
pub enum BlockRequest {
    /// Load the block (if needed) and report its size and annotation totals.
    Summarize,
    /// Evaluate the block's likelihood terms at these parameters.
    Evaluate(Array1<f64>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct BlockSummary {
    pub n_variants: usize,
    /// `Σ_i x_ic` over the block's variants, per annotation.
    pub annotation_sums: Array1<f64>,
}

/// One block's additive share of the genome-wide fit.
#[derive(Clone, Debug, PartialEq)]
pub struct BlockContribution {
    pub log_likelihood: f64,
    pub gradient: Array1<f64>,
    pub hessian: Array2<f64>,
    /// `h_c = Σ_i x_ic D_i` per annotation.
    pub heritability: Array1<f64>,
    /// `∂h/∂a`, annotations × parameters.
    pub heritability_jacobian: Array2<f64>,
    /// Ridge that had to be added before the block factorized; zero when none.
    pub ridge: f64,
}

impl BlockContribution {
    pub fn zeros(n_params: usize) -> Self {
        Self {
            log_likelihood: 0.0,
            gradient: Array1::zeros(n_params),
            hessian: Array2::zeros((n_params, n_params)),
            heritability: Array1::zeros(n_params),
            heritability_jacobian: Array2::zeros((n_params, n_params)),
            ridge: 0.0,
        }
    }
}

impl AddAssign<&BlockContribution> for BlockContribution {
    fn add_assign(&mut self, other: &BlockContribution) {
        self.log_likelihood += other.log_likelihood;
        self.gradient += &other.gradient;
        self.hessian += &other.hessian;
        self.heritability += &other.heritability;
        self.heritability_jacobian += &other.heritability_jacobian;
        self.ridge = self.ridge.max(other.ridge);
    }
}

#[derive(Clone, Debug)]
pub enum BlockOutput {
    Summary(BlockSummary),
    Contribution(BlockContribution),
}

/// A block resident in a worker: its operator restricted to the rows with statistics
/// (scaled by `1 / sample_size`), the premultiplied statistics and the annotations.
#[derive(Debug)]
pub struct PreparedBlock {
    name: String,
    operator: PrecisionOperator,
    pz: Array1<f64>,
    annotations: Array2<f64>,
}

impl PreparedBlock {
    pub fn new(
        block: Arc<crate::block::LdgmBlock>,
        statistics: BlockStatistics,
        sample_size: f64,
    ) -> Result<Self, BlockError> {
        let name = block.name().to_string();
        let restricted = PrecisionOperator::new(block).restrict_to_rows(&statistics.rows)?;
        let pz = match statistics.scores {
            Scores::Z(z) => restricted.premultiply(z.view(), sample_size)?,
            Scores::Premultiplied(pz) => pz,
        };
        let operator = restricted.with_scale(1.0 / sample_size);
        Ok(Self {
            name,
            operator,
            pz,
            annotations: statistics.annotations,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn n_variants(&self) -> usize {
        self.pz.len()
    }

    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            n_variants: self.n_variants(),
            annotation_sums: self.annotations.sum_axis(ndarray::Axis(0)),
        }
    }

    /// Log-likelihood, gradient and Hessian at `params`, retrying with a growing ridge
    /// while the block cannot be factorized.
    pub fn evaluate(
        &mut self,
        params: &Array1<f64>,
        regularization: &RegularizationConfig,
    ) -> Result<BlockContribution, BlockError> {
        if params.len() != self.annotations.ncols() {
            return Err(BlockError::ParameterCount {
                block: self.name.clone(),
                expected: self.annotations.ncols(),
                found: params.len(),
            });
        }
        let diagonal = model::per_variant_heritability(self.annotations.view(), params.view());
        let dd_da = model::heritability_jacobian(self.annotations.view(), params.view());
        let (heritability, heritability_jacobian) =
            model::annotation_heritability(self.annotations.view(), params.view());

        self.operator.set_ridge(0.0);
        self.operator.set_diagonal(diagonal.view())?;
        let base = self.operator.mean_diagonal();

        let mut attempt = 0;
        let terms = loop {
            match likelihood::evaluate(self.pz.view(), &self.operator, dd_da.view()) {
                Ok(terms) => break terms,
                Err(OperatorError::NumericalInstability { source, .. })
                    if attempt < regularization.max_attempts =>
                {
                    let ridge = regularization.relative_ridge(attempt) * base;
                    log::debug!(
                        "Block {} failed to factorize ({}); retrying with ridge {:.3e}",
                        self.name,
                        source,
                        ridge
                    );
                    self.operator.set_ridge(ridge);
                    attempt += 1;
                }
                Err(err) => {
                    self.operator.release_factorization();
                    return Err(err.into());
                }
            }
        };
        let ridge = self.operator.ridge();
        self.operator.release_factorization();

        Ok(BlockContribution {
            log_likelihood: terms.log_likelihood,
            gradient: terms.gradient,
            hessian: terms.hessian,
            heritability,
            heritability_jacobian,
            ridge,
        })
    }

    pub fn operator(&self) -> &PrecisionOperator {
        &self.operator
    }
}

/// The graphREML block task run by the worker pool.
#[derive(Clone, Debug)]
pub struct RemlBlockTask {
    pub sample_size: f64,
    pub annotation_names: Vec<String>,
    pub regularization: RegularizationConfig,
}

impl BlockTask for RemlBlockTask {
    type Descriptor = BlockSource;
    type Loaded = PreparedBlock;
    type Params = BlockRequest;
    type Output = BlockOutput;
    type Error = BlockError;

    fn load(&self, source: &BlockSource) -> Result<PreparedBlock, BlockError> {
        let (block, statistics) = match source {
            BlockSource::Files {
                edgelist,
                snplist,
                statistics,
                kind,
                match_by,
            } => {
                let block = load_ldgm(edgelist, snplist.as_deref())?;
                let statistics = read_block_statistics(
                    statistics,
                    &block,
                    &self.annotation_names,
                    *kind,
                    *match_by,
                )?;
                (Arc::new(block), statistics)
            }
            BlockSource::InMemory { block, statistics } => (Arc::clone(block), statistics.clone()),
        };
        if statistics.n_annotations() != self.annotation_names.len() {
            return Err(BlockError::AnnotationCount {
                block: block.name().to_string(),
                expected: self.annotation_names.len(),
                found: statistics.n_annotations(),
            });
        }
        let prepared = PreparedBlock::new(block, statistics, self.sample_size)?;
        log::debug!(
            "Prepared block {} with {} variants",
            prepared.name(),
            prepared.n_variants()
        );
        Ok(prepared)
    }

    fn process(
        &self,
        prepared: &mut PreparedBlock,
        request: &BlockRequest,
    ) -> Result<BlockOutput, BlockError> {
        match request {
            BlockRequest::Summarize => Ok(BlockOutput::Summary(prepared.summary())),
            BlockRequest::Evaluate(params) => prepared
                .evaluate(params, &self.regularization)
                .map(BlockOutput::Contribution),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::LdgmBlock;
    use crate::reml::input::Scores;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn prepared(matrix: Array2<f64>, scores: Scores) -> PreparedBlock {
        let n = matrix.nrows();
        let block = Arc::new(LdgmBlock::from_dense("test", &matrix, None).unwrap());
        let annotations = Array2::from_shape_fn((n, 2), |(i, j)| if j == 0 || i % 2 == 0 { 1.0 } else { 0.0 });
        let statistics = BlockStatistics::new((0..n).collect(), scores, annotations).unwrap();
        PreparedBlock::new(block, statistics, 100.0).unwrap()
    }

    #[test]
    fn z_scores_are_premultiplied_on_load() {
        let matrix = array![[2.0, -1.0, 0.0], [-1.0, 2.0, -1.0], [0.0, -1.0, 2.0]];
        let block = prepared(matrix.clone(), Scores::Z(array![1.0, 0.0, -1.0]));
        let expected = matrix.dot(&array![1.0, 0.0, -1.0]) / 10.0;
        for i in 0..3 {
            assert_abs_diff_eq!(block.pz[i], expected[i], epsilon = 1e-12);
        }
        assert_eq!(block.operator().scale(), 0.01);
        assert_eq!(block.summary().annotation_sums, array![3.0, 2.0]);
    }

    #[test]
    fn contributions_add_componentwise() {
        let mut total = BlockContribution::zeros(2);
        let mut part = BlockContribution::zeros(2);
        part.log_likelihood = -1.5;
        part.gradient = array![1.0, 2.0];
        part.ridge = 1e-6;
        total += &part;
        total += &part;
        assert_eq!(total.log_likelihood, -3.0);
        assert_eq!(total.gradient, array![2.0, 4.0]);
        assert_eq!(total.ridge, 1e-6);
    }

    #[test]
    fn singular_blocks_are_rescued_by_the_ridge() {
        // Rank-one precision: singular until a ridge is added.
        let matrix = array![[1.0, 1.0], [1.0, 1.0]];
        let mut block = prepared(matrix, Scores::Premultiplied(array![0.1, 0.2]));
        // Parameters that drive D to zero in floating point.
        let params = array![-800.0, 0.0];
        let contribution = block
            .evaluate(&params, &RegularizationConfig::default())
            .unwrap();
        assert!(contribution.ridge > 0.0);
        assert!(contribution.log_likelihood.is_finite());
        assert!(!block.operator().is_factorized());
    }

    #[test]
    fn indefinite_blocks_exhaust_the_ridge_schedule() {
        let matrix = array![[1.0, 5.0], [5.0, 1.0]];
        let mut block = prepared(matrix, Scores::Premultiplied(array![0.1, 0.2]));
        let err = block
            .evaluate(&array![-5.0, 0.0], &RegularizationConfig::default())
            .unwrap_err();
        assert!(err.is_numerical());
    }

    #[test]
    fn parameter_count_is_checked() {
        let matrix = array![[1.0, 0.0], [0.0, 1.0]];
        let mut block = prepared(matrix, Scores::Premultiplied(array![0.1, 0.2]));
        assert!(matches!(
            block.evaluate(&array![0.0], &RegularizationConfig::default()),
            Err(BlockError::ParameterCount { expected: 2, found: 1, .. })
        ));
    }
}
