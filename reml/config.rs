// reml/config.rs

//! Fit configuration and the TOML run manifest read by the command line.

use crate::reml::input::{BlockSource, MatchBy, ScoreKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML manifest {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Ridge schedule used when a block cannot be factorized.
///
/// Attempt `k` (from 0) adds `initial_ridge · growth_factor^k · mean(diag M)` to every
/// diagonal entry of the block's matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegularizationConfig {
    pub initial_ridge: f64,
    pub growth_factor: f64,
    pub max_attempts: usize,
}

impl Default for RegularizationConfig {
    fn default() -> Self {
        Self {
            initial_ridge: 1e-6,
            growth_factor: 10.0,
            max_attempts: 3,
        }
    }
}

impl RegularizationConfig {
    /// Relative ridge of attempt `k`.
    pub fn relative_ridge(&self, attempt: usize) -> f64 {
        self.initial_ridge * self.growth_factor.powi(attempt as i32)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemlConfig {
    /// GWAS sample size; the block precision matrices are scaled by its inverse.
    pub sample_size: f64,
    pub max_iterations: usize,
    /// Relative change in log-likelihood below which the fit may stop.
    pub convergence_tolerance: f64,
    /// Gradient norm below which the fit may stop.
    pub gradient_tolerance: f64,
    pub max_step_halvings: usize,
    /// A step is accepted if it lowers the log-likelihood by at most this much.
    pub likelihood_slack: f64,
    /// Longest Newton step allowed, in parameter units.
    pub max_step_norm: f64,
    /// Total heritability used to initialize the baseline parameter.
    pub initial_heritability: f64,
    /// Explicit starting parameters; overrides `initial_heritability`.
    pub initial_params: Option<Vec<f64>>,
    pub max_workers: usize,
    /// Seconds a dispatch may take before pending blocks count as failed.
    pub worker_timeout_secs: Option<f64>,
    pub regularization: RegularizationConfig,
}

impl Default for RemlConfig {
    fn default() -> Self {
        Self {
            sample_size: 0.0,
            max_iterations: 50,
            convergence_tolerance: 1e-6,
            gradient_tolerance: 1e-3,
            max_step_halvings: 8,
            likelihood_slack: 1e-6,
            max_step_norm: 2.0,
            initial_heritability: 0.1,
            initial_params: None,
            max_workers: num_cpus::get(),
            worker_timeout_secs: None,
            regularization: RegularizationConfig::default(),
        }
    }
}

impl RemlConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = |value: f64, name: &str| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!(
                    "{name} must be positive and finite, got {value}"
                )))
            }
        };
        positive(self.sample_size, "sample_size")?;
        positive(self.convergence_tolerance, "convergence_tolerance")?;
        positive(self.gradient_tolerance, "gradient_tolerance")?;
        positive(self.max_step_norm, "max_step_norm")?;
        positive(self.initial_heritability, "initial_heritability")?;
        positive(self.regularization.initial_ridge, "regularization.initial_ridge")?;
        if !(self.likelihood_slack.is_finite() && self.likelihood_slack >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "likelihood_slack must be non-negative, got {}",
                self.likelihood_slack
            )));
        }
        if self.regularization.growth_factor < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "regularization.growth_factor must be at least 1, got {}",
                self.regularization.growth_factor
            )));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "max_workers must be at least 1".to_string(),
            ));
        }
        if let Some(timeout) = self.worker_timeout_secs {
            positive(timeout, "worker_timeout_secs")?;
        }
        self.worker_timeout()?;
        if self
            .initial_params
            .as_ref()
            .is_some_and(|params| params.iter().any(|value| !value.is_finite()))
        {
            return Err(ConfigError::Invalid(
                "initial_params must be finite".to_string(),
            ));
        }
        Ok(())
    }

    pub fn worker_timeout(&self) -> Result<Option<Duration>, ConfigError> {
        self.worker_timeout_secs
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|err| {
                    ConfigError::Invalid(format!("worker_timeout_secs {secs} is not a duration: {err}"))
                })
            })
            .transpose()
    }
}

/// One LD block of a run manifest. Relative paths are resolved against the manifest's
/// directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub edgelist: PathBuf,
    #[serde(default)]
    pub snplist: Option<PathBuf>,
    pub statistics: PathBuf,
}

/// A complete fit description:
///
/// ```toml
/// annotations = ["base", "coding"]
/// statistics = "z"
/// match_by = "site_id"
///
/// [reml]
/// sample_size = 100000
///
/// [[blocks]]
/// edgelist = "ldgms/1kg_chr1_16103_1170341.EUR.edgelist"
/// statistics = "sumstats/block1.csv"
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub annotations: Vec<String>,
    #[serde(default)]
    pub statistics: ScoreKind,
    /// Statistics column joined to the snplists: `site_id` (`SNP`) or `position` (`POS`).
    #[serde(default)]
    pub match_by: MatchBy,
    #[serde(default)]
    pub reml: RemlConfig,
    pub blocks: Vec<BlockEntry>,
}

impl RunManifest {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut manifest: RunManifest =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        if let Some(base) = path.parent() {
            manifest.resolve_paths(base);
        }
        manifest.validate()?;
        Ok(manifest)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        for block in &mut self.blocks {
            resolve(&mut block.edgelist);
            if let Some(snplist) = block.snplist.as_mut() {
                resolve(snplist);
            }
            resolve(&mut block.statistics);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.annotations.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one annotation (the baseline) is required".to_string(),
            ));
        }
        if self.blocks.is_empty() {
            return Err(ConfigError::Invalid("the manifest lists no blocks".to_string()));
        }
        self.reml.validate()
    }

    pub fn block_sources(&self) -> Vec<BlockSource> {
        self.blocks
            .iter()
            .map(|entry| BlockSource::Files {
                edgelist: entry.edgelist.clone(),
                snplist: entry.snplist.clone(),
                statistics: entry.statistics.clone(),
                kind: self.statistics,
                match_by: self.match_by,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_need_only_a_sample_size() {
        let config = RemlConfig {
            sample_size: 5e4,
            ..RemlConfig::default()
        };
        assert!(config.validate().is_ok());
        assert!(matches!(
            RemlConfig::default().validate(),
            Err(ConfigError::Invalid(message)) if message.contains("sample_size")
        ));
    }

    #[test]
    fn oversized_timeouts_are_rejected() {
        let mut config = RemlConfig {
            sample_size: 5e4,
            worker_timeout_secs: Some(1e30),
            ..RemlConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(message)) if message.contains("worker_timeout_secs")
        ));

        config.worker_timeout_secs = Some(2.5);
        assert_eq!(
            config.worker_timeout().unwrap(),
            Some(Duration::from_millis(2500))
        );
    }

    #[test]
    fn ridge_schedule_grows_geometrically() {
        let schedule = RegularizationConfig::default();
        assert_eq!(schedule.relative_ridge(0), 1e-6);
        assert!((schedule.relative_ridge(2) - 1e-4).abs() < 1e-18);
    }

    #[test]
    fn manifest_paths_resolve_against_its_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(
            &path,
            r#"
annotations = ["base", "coding"]
statistics = "premultiplied"
match_by = "position"

[reml]
sample_size = 20000
max_iterations = 12

[reml.regularization]
max_attempts = 5

[[blocks]]
edgelist = "ldgm/blk1.EUR.edgelist"
statistics = "stats/blk1.csv"

[[blocks]]
edgelist = "/data/blk2.EUR.edgelist"
snplist = "/data/blk2.snplist"
statistics = "stats/blk2.csv"
"#,
        )
        .unwrap();

        let manifest = RunManifest::from_path(&path).unwrap();
        assert_eq!(manifest.statistics, ScoreKind::Premultiplied);
        assert_eq!(manifest.match_by, MatchBy::Position);
        assert_eq!(manifest.reml.max_iterations, 12);
        assert_eq!(manifest.reml.regularization.max_attempts, 5);
        assert_eq!(manifest.reml.regularization.growth_factor, 10.0);
        assert_eq!(
            manifest.blocks[0].edgelist,
            dir.path().join("ldgm/blk1.EUR.edgelist")
        );
        assert_eq!(manifest.blocks[1].edgelist, PathBuf::from("/data/blk2.EUR.edgelist"));

        let sources = manifest.block_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].name(), "blk1.EUR");
        assert!(matches!(
            sources[1],
            BlockSource::Files { match_by: MatchBy::Position, .. }
        ));
    }

    #[test]
    fn empty_manifests_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.toml");
        fs::write(&path, "annotations = []\nblocks = []\n[reml]\nsample_size = 10\n").unwrap();
        assert!(matches!(
            RunManifest::from_path(&path),
            Err(ConfigError::Invalid(_))
        ));
    }
}
