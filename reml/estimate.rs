// reml/estimate.rs

//! # graphREML
//!
//! Genome-wide fit of the annotation parameters `a` in `D_i = softplus(x_i · a)`.
//!
//! Every block contributes an additive share of the log-likelihood, its gradient and the
//! Hessian approximation; a [`GenomeEvaluator`] dispatches the current parameters to the
//! worker pool and sums the shares in block order. [`run_graphreml`] drives it:
//!
//! 1.  **Init:** load and summarize every block, choose starting parameters and evaluate
//!     them. Blocks that fail to load or to factorize here (even with the ridge schedule)
//!     are excluded for the rest of the fit.
//! 2.  **Iterate:** damped Newton step `Δa = (−H)⁻¹ g`, clamped in length and halved
//!     until the log-likelihood does not drop by more than the configured slack. A block
//!     failure at a trial point rejects that trial. Blocks whose worker stopped answering
//!     (timed out or gone) are excluded instead, and the iteration restarts from the
//!     current point re-evaluated without them.
//! 3.  **Stop:** converged once the relative log-likelihood change and the gradient norm
//!     are both below tolerance; otherwise stop at the iteration limit (with a warning)
//!     or when no step can be accepted.
//!
//! Standard errors come from `(−H)⁻¹` at the final point and are propagated to the
//! annotation heritabilities and enrichments by the delta method.

use crate::faer_ndarray::{FaerCholesky, FaerEigh, spd_inverse};
use crate::parallel::{BlockProcessor, BlockResult, BlockTask, ProcessorConfig, ProcessorError};
use crate::reml::config::{ConfigError, RemlConfig};
use crate::reml::input::BlockSource;
use crate::reml::model;
use crate::reml::worker::{
    BlockContribution, BlockError, BlockOutput, BlockRequest, BlockSummary, RemlBlockTask,
};
use faer::Side;
use ndarray::{Array1, Array2};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Relative eigenvalue floor when the negated Hessian has to be inverted by clamping.
const EIGENVALUE_FLOOR: f64 = 1e-10;
/// Levenberg damping attempts before falling back to a gradient step.
const MAX_DAMPING_ATTEMPTS: usize = 30;

#[derive(Error, Debug)]
pub enum RemlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("dimension mismatch in {what}: expected {expected}, found {found}")]
    DimensionMismatch {
        what: String,
        expected: usize,
        found: usize,
    },

    #[error("no block could be evaluated ({} excluded)", .excluded.len())]
    NoUsableBlocks { excluded: Vec<ExcludedBlock> },

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExcludedBlock {
    pub index: usize,
    pub name: String,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerStatus {
    Converged,
    MaxIterations,
    Failed,
}

/// Non-fatal conditions surfaced with the result.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemlWarning {
    /// The iteration limit was reached before the tolerances were met.
    Convergence {
        iterations: usize,
        relative_change: f64,
        gradient_norm: f64,
    },
    BlockExcluded {
        block: String,
        reason: String,
    },
    /// A block only factorized after adding this ridge at the final parameters.
    Regularized {
        block: String,
        ridge: f64,
    },
    /// Standard errors use the Hessian approximation away from a stationary point.
    NonStationaryStandardErrors,
    /// The negated Hessian was not positive definite; eigenvalues were clamped.
    SingularHessian,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AnnotationEstimate {
    pub name: String,
    pub parameter: f64,
    pub parameter_se: f64,
    pub heritability: f64,
    pub heritability_se: f64,
    pub enrichment: f64,
    pub enrichment_se: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RemlResult {
    pub status: OptimizerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub iterations: usize,
    pub log_likelihood: f64,
    pub n_variants: usize,
    pub n_blocks_used: usize,
    pub likelihood_history: Vec<f64>,
    pub annotations: Vec<AnnotationEstimate>,
    pub excluded_blocks: Vec<ExcludedBlock>,
    pub warnings: Vec<RemlWarning>,
}

impl RemlResult {
    pub fn parameters(&self) -> Array1<f64> {
        self.annotations.iter().map(|a| a.parameter).collect()
    }

    pub fn heritability(&self) -> Array1<f64> {
        self.annotations.iter().map(|a| a.heritability).collect()
    }

    pub fn is_converged(&self) -> bool {
        self.status == OptimizerStatus::Converged
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Summed contributions of one dispatch, with the per-block shares they came from.
#[derive(Clone, Debug)]
pub struct Evaluation {
    pub total: BlockContribution,
    pub per_block: Vec<(usize, BlockContribution)>,
    /// Blocks that failed at these parameters.
    pub failures: Vec<ExcludedBlock>,
    /// Blocks whose worker will not answer again.
    pub unavailable: Vec<ExcludedBlock>,
}

/// Sums contributions in the order given; callers pass them sorted by block id.
pub fn sum_contributions<'a>(
    n_params: usize,
    contributions: impl IntoIterator<Item = &'a BlockContribution>,
) -> BlockContribution {
    let mut total = BlockContribution::zeros(n_params);
    for contribution in contributions {
        total += contribution;
    }
    total
}

/// Block tasks a [`GenomeEvaluator`] can drive.
pub trait RemlTask:
    BlockTask<
        Descriptor = BlockSource,
        Params = BlockRequest,
        Output = BlockOutput,
        Error = BlockError,
    >
{
}

impl<T> RemlTask for T where
    T: BlockTask<
            Descriptor = BlockSource,
            Params = BlockRequest,
            Output = BlockOutput,
            Error = BlockError,
        >
{
}

/// The genome-wide likelihood as a function of the parameters.
pub struct GenomeEvaluator<T: RemlTask = RemlBlockTask> {
    processor: BlockProcessor<T>,
    annotation_names: Vec<String>,
    block_names: Vec<String>,
    n_params: usize,
    active: Vec<usize>,
    summaries: BTreeMap<usize, BlockSummary>,
    excluded: Vec<ExcludedBlock>,
}

impl GenomeEvaluator<RemlBlockTask> {
    pub fn new(
        blocks: Vec<BlockSource>,
        annotation_names: &[String],
        config: &RemlConfig,
    ) -> Result<Self, RemlError> {
        let task = RemlBlockTask {
            sample_size: config.sample_size,
            annotation_names: annotation_names.to_vec(),
            regularization: config.regularization.clone(),
        };
        Self::with_task(task, blocks, annotation_names, config)
    }
}

impl<T: RemlTask> GenomeEvaluator<T> {
    /// Evaluator running `task` on every block.
    pub fn with_task(
        task: T,
        blocks: Vec<BlockSource>,
        annotation_names: &[String],
        config: &RemlConfig,
    ) -> Result<Self, RemlError> {
        config.validate()?;
        if annotation_names.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one annotation (the baseline) is required".to_string(),
            )
            .into());
        }
        let n_params = annotation_names.len();
        if let Some(initial) = &config.initial_params {
            if initial.len() != n_params {
                return Err(RemlError::DimensionMismatch {
                    what: "initial_params".to_string(),
                    expected: n_params,
                    found: initial.len(),
                });
            }
        }
        for source in &blocks {
            let BlockSource::InMemory { statistics, .. } = source else {
                continue;
            };
            if statistics.n_annotations() != n_params {
                return Err(RemlError::DimensionMismatch {
                    what: format!("annotations of block '{}'", source.name()),
                    expected: n_params,
                    found: statistics.n_annotations(),
                });
            }
        }

        let block_names: Vec<String> = blocks.iter().map(BlockSource::name).collect();
        let processor_config = ProcessorConfig {
            max_workers: config.max_workers,
            timeout: config.worker_timeout()?,
        };
        let processor = BlockProcessor::new(task, blocks, &processor_config)?;
        Ok(Self {
            processor,
            annotation_names: annotation_names.to_vec(),
            active: (0..block_names.len()).collect(),
            block_names,
            n_params,
            summaries: BTreeMap::new(),
            excluded: Vec::new(),
        })
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn annotation_names(&self) -> &[String] {
        &self.annotation_names
    }

    pub fn n_workers(&self) -> usize {
        self.processor.n_workers()
    }

    pub fn active_blocks(&self) -> &[usize] {
        &self.active
    }

    pub fn excluded(&self) -> &[ExcludedBlock] {
        &self.excluded
    }

    /// Loads every active block, excluding those that cannot be loaded, and returns the
    /// number of variants and the annotation totals over the remaining ones.
    pub fn summarize(&mut self) -> Result<(usize, Array1<f64>), RemlError> {
        let results = self
            .processor
            .dispatch_selected(BlockRequest::Summarize, &self.active)?;
        let mut failures = Vec::new();
        for BlockResult { block, outcome } in results {
            match outcome {
                Ok(BlockOutput::Summary(summary)) => {
                    if summary.annotation_sums.len() != self.n_params {
                        failures.push(self.failure(
                            block,
                            format!(
                                "{} annotation columns, expected {}",
                                summary.annotation_sums.len(),
                                self.n_params
                            ),
                        ));
                    } else {
                        self.summaries.insert(block, summary);
                    }
                }
                Ok(BlockOutput::Contribution(_)) => {
                    failures.push(self.failure(block, "unexpected evaluation output".to_string()))
                }
                Err(err) => failures.push(self.failure(block, err.to_string())),
            }
        }
        self.exclude(&failures);
        Ok(self.totals())
    }

    /// Variant count and annotation totals over the active blocks.
    pub fn totals(&self) -> (usize, Array1<f64>) {
        let mut n_variants = 0;
        let mut sums = Array1::<f64>::zeros(self.n_params);
        for block in &self.active {
            if let Some(summary) = self.summaries.get(block) {
                n_variants += summary.n_variants;
                sums += &summary.annotation_sums;
            }
        }
        (n_variants, sums)
    }

    /// Evaluates every active block at `params`. Failed and unavailable blocks are
    /// reported in the evaluation but stay active.
    pub fn evaluate(&mut self, params: &Array1<f64>) -> Result<Evaluation, RemlError> {
        if params.len() != self.n_params {
            return Err(RemlError::DimensionMismatch {
                what: "parameters".to_string(),
                expected: self.n_params,
                found: params.len(),
            });
        }
        let results = self
            .processor
            .dispatch_selected(BlockRequest::Evaluate(params.clone()), &self.active)?;
        let mut per_block = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        let mut unavailable = Vec::new();
        for BlockResult { block, outcome } in results {
            match outcome {
                Ok(BlockOutput::Contribution(contribution)) => per_block.push((block, contribution)),
                Ok(BlockOutput::Summary(_)) => {
                    failures.push(self.failure(block, "unexpected summary output".to_string()))
                }
                Err(err) if err.is_permanent() => {
                    unavailable.push(self.failure(block, err.to_string()))
                }
                Err(err) => failures.push(self.failure(block, err.to_string())),
            }
        }
        let total = sum_contributions(self.n_params, per_block.iter().map(|(_, c)| c));
        Ok(Evaluation {
            total,
            per_block,
            failures,
            unavailable,
        })
    }

    /// Removes blocks from every later dispatch.
    pub fn exclude(&mut self, failures: &[ExcludedBlock]) {
        for failure in failures {
            log::warn!(
                "Excluding block {} ({}): {}",
                failure.index,
                failure.name,
                failure.reason
            );
            self.active.retain(|&block| block != failure.index);
            self.excluded.push(failure.clone());
        }
    }

    pub fn block_name(&self, block: usize) -> &str {
        self.block_names.get(block).map(String::as_str).unwrap_or_default()
    }

    fn failure(&self, block: usize, reason: String) -> ExcludedBlock {
        ExcludedBlock {
            index: block,
            name: self.block_name(block).to_string(),
            reason,
        }
    }
}

/// Fits the annotation parameters to the given blocks.
///
/// `annotation_names[0]` must be the all-ones baseline annotation: starting values and
/// enrichments are defined relative to it.
pub fn run_graphreml(
    blocks: Vec<BlockSource>,
    annotation_names: &[String],
    config: &RemlConfig,
) -> Result<RemlResult, RemlError> {
    let evaluator = GenomeEvaluator::new(blocks, annotation_names, config)?;
    fit(evaluator, config)
}

/// Runs the optimizer on an evaluator built by the caller.
pub fn fit<T: RemlTask>(
    mut evaluator: GenomeEvaluator<T>,
    config: &RemlConfig,
) -> Result<RemlResult, RemlError> {
    let annotation_names = evaluator.annotation_names().to_vec();
    let n_params = evaluator.n_params();
    log::info!(
        "Starting graphREML with {} block(s), {} annotation(s) and {} worker(s)",
        evaluator.active_blocks().len(),
        n_params,
        evaluator.n_workers()
    );

    let (n_variants, _) = evaluator.summarize()?;
    if evaluator.active_blocks().is_empty() {
        return Err(RemlError::NoUsableBlocks {
            excluded: evaluator.excluded().to_vec(),
        });
    }
    let mut params = match &config.initial_params {
        Some(initial) => Array1::from(initial.clone()),
        None => model::baseline_parameters(n_params, config.initial_heritability, n_variants),
    };

    let mut current = evaluate_surviving(&mut evaluator, &params)?;
    let mut history = vec![current.total.log_likelihood];
    log::info!(
        "Initial log-likelihood {:.6} over {} block(s)",
        current.total.log_likelihood,
        evaluator.active_blocks().len()
    );

    let mut iterations = 0;
    let mut last_change = f64::INFINITY;
    let mut outcome: Option<(OptimizerStatus, Option<String>)> = None;
    while iterations < config.max_iterations {
        iterations += 1;
        let step = newton_step(
            &current.total.gradient,
            &current.total.hessian,
            config.max_step_norm,
        );

        let mut accepted = None;
        let mut lost_blocks = false;
        let mut scale = 1.0;
        for _ in 0..=config.max_step_halvings {
            let candidate = &params + &(&step * scale);
            let trial = evaluator.evaluate(&candidate)?;
            let ll = trial.total.log_likelihood;
            if !trial.unavailable.is_empty() {
                evaluator.exclude(&trial.unavailable);
                lost_blocks = true;
                break;
            } else if !trial.failures.is_empty() {
                log::warn!(
                    "Rejecting step of scale {}: {} block(s) failed at the trial point",
                    scale,
                    trial.failures.len()
                );
            } else if ll.is_finite()
                && ll >= current.total.log_likelihood - config.likelihood_slack
            {
                accepted = Some((candidate, trial));
                break;
            } else {
                log::debug!(
                    "Step of scale {} gives log-likelihood {:.6}; halving",
                    scale,
                    ll
                );
            }
            scale *= 0.5;
        }

        if lost_blocks {
            current = evaluate_surviving(&mut evaluator, &params)?;
            log::info!(
                "Iteration {}: continuing from log-likelihood {:.6} over {} remaining block(s)",
                iterations,
                current.total.log_likelihood,
                evaluator.active_blocks().len()
            );
            continue;
        }

        let Some((candidate, next)) = accepted else {
            let gradient_norm = norm(&current.total.gradient);
            outcome = Some(if gradient_norm < config.gradient_tolerance {
                (OptimizerStatus::Converged, None)
            } else {
                (
                    OptimizerStatus::Failed,
                    Some(format!(
                        "no acceptable step after {} halvings at iteration {} (gradient norm {:.3e})",
                        config.max_step_halvings, iterations, gradient_norm
                    )),
                )
            });
            break;
        };

        let previous = current.total.log_likelihood;
        params = candidate;
        current = next;
        history.push(current.total.log_likelihood);
        last_change = (current.total.log_likelihood - previous).abs() / previous.abs().max(1.0);
        let gradient_norm = norm(&current.total.gradient);
        log::info!(
            "Iteration {}: log-likelihood {:.6}, step scale {}, relative change {:.3e}, gradient norm {:.3e}",
            iterations,
            current.total.log_likelihood,
            scale,
            last_change,
            gradient_norm
        );
        if last_change < config.convergence_tolerance && gradient_norm < config.gradient_tolerance {
            outcome = Some((OptimizerStatus::Converged, None));
            break;
        }
    }

    let mut warnings = Vec::new();
    let (status, failure_reason) = outcome.unwrap_or_else(|| {
        let gradient_norm = norm(&current.total.gradient);
        log::warn!(
            "graphREML stopped after {} iterations without converging (relative change {:.3e}, gradient norm {:.3e})",
            iterations,
            last_change,
            gradient_norm
        );
        warnings.push(RemlWarning::Convergence {
            iterations,
            relative_change: last_change,
            gradient_norm,
        });
        (OptimizerStatus::MaxIterations, None)
    });
    if let Some(reason) = &failure_reason {
        log::warn!("graphREML failed: {}", reason);
    }

    for excluded in evaluator.excluded() {
        warnings.push(RemlWarning::BlockExcluded {
            block: excluded.name.clone(),
            reason: excluded.reason.clone(),
        });
    }
    for (block, contribution) in &current.per_block {
        if contribution.ridge > 0.0 {
            log::warn!(
                "Block {} needed a ridge of {:.3e} to factorize",
                block,
                contribution.ridge
            );
            warnings.push(RemlWarning::Regularized {
                block: evaluator.block_name(*block).to_string(),
                ridge: contribution.ridge,
            });
        }
    }
    if status != OptimizerStatus::Converged {
        warnings.push(RemlWarning::NonStationaryStandardErrors);
    }

    let (covariance, clamped) = parameter_covariance(&current.total.hessian);
    if clamped {
        log::warn!("The negated Hessian is not positive definite; clamping its eigenvalues");
        warnings.push(RemlWarning::SingularHessian);
    }
    let (n_variants, annotation_counts) = evaluator.totals();
    let annotations = annotation_estimates(
        &annotation_names,
        &params,
        &covariance,
        &current.total,
        &annotation_counts,
    );

    log::info!(
        "graphREML finished with status {:?} after {} iteration(s); log-likelihood {:.6}",
        status,
        iterations,
        current.total.log_likelihood
    );
    Ok(RemlResult {
        status,
        failure_reason,
        iterations,
        log_likelihood: current.total.log_likelihood,
        n_variants,
        n_blocks_used: evaluator.active_blocks().len(),
        likelihood_history: history,
        annotations,
        excluded_blocks: evaluator.excluded().to_vec(),
        warnings,
    })
}

/// Evaluates `params`, excluding blocks until every remaining one succeeds there.
fn evaluate_surviving<T: RemlTask>(
    evaluator: &mut GenomeEvaluator<T>,
    params: &Array1<f64>,
) -> Result<Evaluation, RemlError> {
    loop {
        if evaluator.active_blocks().is_empty() {
            return Err(RemlError::NoUsableBlocks {
                excluded: evaluator.excluded().to_vec(),
            });
        }
        let evaluation = evaluator.evaluate(params)?;
        if evaluation.failures.is_empty() && evaluation.unavailable.is_empty() {
            return Ok(evaluation);
        }
        evaluator.exclude(&evaluation.unavailable);
        evaluator.exclude(&evaluation.failures);
    }
}

fn norm(v: &Array1<f64>) -> f64 {
    v.dot(v).sqrt()
}

/// `(−H + λI)⁻¹ g` with the smallest damping `λ` that makes the system positive definite,
/// scaled down to at most `max_norm`. Falls back to the gradient direction.
fn newton_step(gradient: &Array1<f64>, hessian: &Array2<f64>, max_norm: f64) -> Array1<f64> {
    let k = gradient.len();
    let negated = -hessian;
    let magnitude = (0..k)
        .map(|i| negated[[i, i]].abs())
        .fold(0.0f64, f64::max)
        .max(f64::MIN_POSITIVE);

    let mut damping = 0.0;
    let mut step = None;
    for _ in 0..MAX_DAMPING_ATTEMPTS {
        let damped = &negated + &(Array2::<f64>::eye(k) * damping);
        if let Ok(factor) = damped.cholesky(Side::Lower) {
            let candidate = factor.solve_vec(gradient);
            if candidate.iter().all(|v| v.is_finite()) {
                if damping > 0.0 {
                    log::warn!(
                        "Negated Hessian is not positive definite; damping the Newton step by {:.3e}",
                        damping
                    );
                }
                step = Some(candidate);
                break;
            }
        }
        damping = if damping == 0.0 { 1e-8 * magnitude } else { damping * 10.0 };
    }
    let step = step.unwrap_or_else(|| {
        log::warn!("Could not form a Newton step; following the gradient");
        gradient.clone()
    });

    let length = norm(&step);
    if length > max_norm {
        step * (max_norm / length)
    } else {
        step
    }
}

/// `(−H)⁻¹`, or the inverse with eigenvalues clamped to a small positive floor when `−H`
/// is not positive definite. The flag reports the clamping.
fn parameter_covariance(hessian: &Array2<f64>) -> (Array2<f64>, bool) {
    let negated = -hessian;
    if let Ok(inverse) = spd_inverse(&negated) {
        return (inverse, false);
    }
    let k = negated.nrows();
    let Ok((values, vectors)) = negated.eigh(Side::Lower) else {
        return (Array2::from_elem((k, k), f64::NAN), true);
    };
    let largest = values.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    let floor = (largest * EIGENVALUE_FLOOR).max(f64::MIN_POSITIVE);
    let inverse_values = values.mapv(|v| 1.0 / v.max(floor));
    let scaled = &vectors * &inverse_values;
    (scaled.dot(&vectors.t()), true)
}

fn annotation_estimates(
    names: &[String],
    params: &Array1<f64>,
    covariance: &Array2<f64>,
    total: &BlockContribution,
    counts: &Array1<f64>,
) -> Vec<AnnotationEstimate> {
    let jacobian = &total.heritability_jacobian;
    let heritability_covariance = jacobian.dot(covariance).dot(&jacobian.t());
    let baseline_h = total.heritability[0];
    let baseline_count = counts[0];

    names
        .iter()
        .enumerate()
        .map(|(c, name)| {
            let h = total.heritability[c];
            let (enrichment, enrichment_se) = if counts[c] > 0.0 && baseline_h != 0.0 {
                let share = baseline_count / counts[c];
                let enrichment = h / baseline_h * share;
                let gradient = (&jacobian.row(c) / baseline_h
                    - &jacobian.row(0) * (h / (baseline_h * baseline_h)))
                    * share;
                let variance = gradient.dot(&covariance.dot(&gradient));
                (enrichment, variance.max(0.0).sqrt())
            } else {
                (f64::NAN, f64::NAN)
            };
            AnnotationEstimate {
                name: name.clone(),
                parameter: params[c],
                parameter_se: covariance[[c, c]].max(0.0).sqrt(),
                heritability: h,
                heritability_se: heritability_covariance[[c, c]].max(0.0).sqrt(),
                enrichment,
                enrichment_se,
            }
        })
        .collect()
}
