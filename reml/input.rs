// reml/input.rs

//! Per-block inputs of a fit: which block rows carry statistics, the statistics
//! themselves and the annotation values of those rows.

use crate::block::{LdgmBlock, VariantKey, VariantQuery};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StatisticsError {
    #[error("CSV error in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("{path} has no '{column}' column")]
    MissingColumn { path: String, column: String },

    #[error("malformed record in {path} at line {line}: {message}")]
    Malformed {
        path: String,
        line: u64,
        message: String,
    },

    #[error("no record of {path} matches a variant of block '{block}'")]
    NoMatchedVariants { path: String, block: String },

    #[error("inconsistent block statistics: {0}")]
    Shape(String),
}

/// How the statistics column of an input file is to be read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    /// Marginal z-scores; premultiplied by the block precision when the block is loaded.
    #[default]
    Z,
    /// Already premultiplied statistics `P z / √n`.
    Premultiplied,
}

/// Which statistics column locates a record in its block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchBy {
    /// The `SNP` column against the snplist site ids.
    #[default]
    SiteId,
    /// The `POS` column against the snplist positions.
    Position,
}

#[derive(Clone, Debug)]
pub enum Scores {
    Z(Array1<f64>),
    Premultiplied(Array1<f64>),
}

impl Scores {
    pub fn len(&self) -> usize {
        match self {
            Scores::Z(values) | Scores::Premultiplied(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Statistics for the block rows in `rows`; row `k` of `annotations` and entry `k` of
/// `scores` belong to block row `rows[k]`.
#[derive(Clone, Debug)]
pub struct BlockStatistics {
    pub rows: Vec<usize>,
    pub scores: Scores,
    pub annotations: Array2<f64>,
}

impl BlockStatistics {
    pub fn new(
        rows: Vec<usize>,
        scores: Scores,
        annotations: Array2<f64>,
    ) -> Result<Self, StatisticsError> {
        if scores.len() != rows.len() || annotations.nrows() != rows.len() {
            return Err(StatisticsError::Shape(format!(
                "{} rows, {} scores and {} annotation rows",
                rows.len(),
                scores.len(),
                annotations.nrows()
            )));
        }
        Ok(Self {
            rows,
            scores,
            annotations,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn n_annotations(&self) -> usize {
        self.annotations.ncols()
    }
}

/// Where a block and its statistics come from. File sources are only read by the worker
/// that owns the block.
#[derive(Clone, Debug)]
pub enum BlockSource {
    Files {
        edgelist: PathBuf,
        snplist: Option<PathBuf>,
        statistics: PathBuf,
        kind: ScoreKind,
        match_by: MatchBy,
    },
    InMemory {
        block: Arc<LdgmBlock>,
        statistics: BlockStatistics,
    },
}

impl BlockSource {
    pub fn name(&self) -> String {
        match self {
            BlockSource::Files { edgelist, .. } => edgelist
                .file_name()
                .map(|file| file.to_string_lossy().trim_end_matches(".edgelist").to_string())
                .unwrap_or_else(|| edgelist.display().to_string()),
            BlockSource::InMemory { block, .. } => block.name().to_string(),
        }
    }
}

enum RecordKey {
    Site(String),
    Position(u64),
}

struct StatisticsRecord {
    key: RecordKey,
    alleles: Option<(String, String)>,
    score: f64,
    annotations: Vec<f64>,
}

/// Reads a statistics CSV (`SNP` or `POS`, `Z`, optional `A1`/`A2`, one column per
/// annotation) and joins it to `block`.
///
/// Records are matched by site id or by position, per `match_by`. A `CHR` column is not
/// consulted: snplists carry no chromosome and each file belongs to a single block.
/// When both files carry alleles, mismatching records are dropped and swapped ones have
/// their score negated. Only the first record per matrix row is kept.
pub fn read_block_statistics(
    path: &Path,
    block: &LdgmBlock,
    annotation_names: &[String],
    kind: ScoreKind,
    match_by: MatchBy,
) -> Result<BlockStatistics, StatisticsError> {
    let display = path.display().to_string();
    let csv_error = |source| StatisticsError::Csv {
        path: display.clone(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_error)?;
    let headers = reader.headers().map_err(csv_error)?.clone();
    let column = |name: &str| headers.iter().position(|header| header == name);
    let required = |name: &str| {
        column(name).ok_or_else(|| StatisticsError::MissingColumn {
            path: display.clone(),
            column: name.to_string(),
        })
    };

    let key_column = match match_by {
        MatchBy::SiteId => required("SNP")?,
        MatchBy::Position => required("POS")?,
    };
    let score_column = required("Z")?;
    let allele_columns = column("A1").zip(column("A2"));
    let annotation_columns = annotation_names
        .iter()
        .map(|name| required(name.as_str()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let parse = |index: usize, what: &str| -> Result<f64, StatisticsError> {
            let field = record.get(index).unwrap_or_default();
            field
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| StatisticsError::Malformed {
                    path: display.clone(),
                    line,
                    message: format!("invalid {what} '{field}'"),
                })
        };
        let key = match match_by {
            MatchBy::SiteId => RecordKey::Site(record.get(key_column).unwrap_or_default().to_string()),
            MatchBy::Position => {
                let field = record.get(key_column).unwrap_or_default();
                let bp = field.parse::<u64>().map_err(|_| StatisticsError::Malformed {
                    path: display.clone(),
                    line,
                    message: format!("invalid POS '{field}'"),
                })?;
                RecordKey::Position(bp)
            }
        };
        let score = parse(score_column, "Z")?;
        let annotations = annotation_columns
            .iter()
            .zip(annotation_names)
            .map(|(&index, name)| parse(index, name.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        records.push(StatisticsRecord {
            key,
            alleles: allele_columns.map(|(a1, a2)| {
                (
                    record.get(a1).unwrap_or_default().to_string(),
                    record.get(a2).unwrap_or_default().to_string(),
                )
            }),
            score,
            annotations,
        });
    }

    let queries: Vec<VariantQuery<'_>> = records
        .iter()
        .map(|record| VariantQuery {
            key: match &record.key {
                RecordKey::Site(site_id) => VariantKey::Site(site_id),
                RecordKey::Position(bp) => VariantKey::Position(*bp),
            },
            alleles: record
                .alleles
                .as_ref()
                .map(|(a1, a2)| (a1.as_str(), a2.as_str())),
        })
        .collect();
    let matches = block.match_variants(&queries);
    if matches.is_empty() {
        return Err(StatisticsError::NoMatchedVariants {
            path: display,
            block: block.name().to_string(),
        });
    }

    let k = annotation_names.len();
    let mut annotations = Array2::<f64>::zeros((matches.len(), k));
    let mut scores = Array1::<f64>::zeros(matches.len());
    let mut rows = Vec::with_capacity(matches.len());
    for (position, matched) in matches.iter().enumerate() {
        let record = &records[matched.record];
        rows.push(matched.row);
        scores[position] = record.score * f64::from(matched.phase.sign());
        for (c, &value) in record.annotations.iter().enumerate() {
            annotations[[position, c]] = value;
        }
    }
    log::debug!(
        "Matched {} of {} records in {} to block {}",
        rows.len(),
        records.len(),
        display,
        block.name()
    );

    let scores = match kind {
        ScoreKind::Z => Scores::Z(scores),
        ScoreKind::Premultiplied => Scores::Premultiplied(scores),
    };
    BlockStatistics::new(rows, scores, annotations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::VariantInfo;
    use std::fs;
    use tempfile::tempdir;

    fn block() -> LdgmBlock {
        let variants = ["rs0", "rs1", "rs2"]
            .iter()
            .enumerate()
            .map(|(index, site)| VariantInfo {
                index,
                original_index: index,
                site_id: site.to_string(),
                anc_allele: Some("A".to_string()),
                deriv_allele: Some("G".to_string()),
                position: Some(100 * (index as u64 + 1)),
            })
            .collect();
        LdgmBlock::from_edges(
            "blk",
            3,
            &[(0, 0, 1.0), (1, 1, 1.0), (2, 2, 1.0), (0, 1, -0.2)],
            variants,
        )
        .unwrap()
    }

    fn names() -> Vec<String> {
        vec!["base".to_string(), "coding".to_string()]
    }

    #[test]
    fn statistics_are_joined_and_phased() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blk.csv");
        fs::write(
            &path,
            "SNP,A1,A2,Z,base,coding\n\
             rs2,G,A,1.5,1,0\n\
             rsX,A,G,9.0,1,1\n\
             rs0,a,g,-0.5,1,1\n\
             rs1,A,T,2.0,1,0\n\
             rs2,A,G,7.0,1,1\n",
        )
        .unwrap();
        let stats = read_block_statistics(&path, &block(), &names(), ScoreKind::Z, MatchBy::SiteId).unwrap();
        assert_eq!(stats.rows, vec![2, 0]);
        match &stats.scores {
            Scores::Z(z) => {
                assert_eq!(z[0], -1.5);
                assert_eq!(z[1], -0.5);
            }
            other => panic!("expected z-scores, got {other:?}"),
        }
        assert_eq!(stats.annotations.row(0).to_vec(), vec![1.0, 0.0]);
        assert_eq!(stats.annotations.row(1).to_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn statistics_can_be_matched_by_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blk.csv");
        fs::write(
            &path,
            "CHR,POS,A1,A2,Z,base,coding\n\
             1,300,A,G,1.5,1,0\n\
             1,150,A,G,9.0,1,1\n\
             1,100,G,A,-0.5,1,1\n",
        )
        .unwrap();
        let stats =
            read_block_statistics(&path, &block(), &names(), ScoreKind::Z, MatchBy::Position).unwrap();
        assert_eq!(stats.rows, vec![2, 0]);
        match &stats.scores {
            Scores::Z(z) => assert_eq!(z.to_vec(), vec![1.5, 0.5]),
            other => panic!("expected z-scores, got {other:?}"),
        }

        // No SNP column is needed, but POS is.
        assert!(matches!(
            read_block_statistics(&path, &block(), &names(), ScoreKind::Z, MatchBy::SiteId),
            Err(StatisticsError::MissingColumn { column, .. }) if column == "SNP"
        ));
        fs::write(&path, "POS,Z,base,coding\nchr1:100,1.0,1,0\n").unwrap();
        assert!(matches!(
            read_block_statistics(&path, &block(), &names(), ScoreKind::Z, MatchBy::Position),
            Err(StatisticsError::Malformed { line: 2, .. })
        ));
    }

    #[test]
    fn missing_annotation_column_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blk.csv");
        fs::write(&path, "SNP,Z,base\nrs0,1.0,1\n").unwrap();
        match read_block_statistics(&path, &block(), &names(), ScoreKind::Premultiplied, MatchBy::SiteId) {
            Err(StatisticsError::MissingColumn { column, .. }) => assert_eq!(column, "coding"),
            other => panic!("expected a missing column, got {other:?}"),
        }
    }

    #[test]
    fn unparsable_scores_are_malformed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blk.csv");
        fs::write(&path, "SNP,Z,base,coding\nrs0,1.0,1,0\nrs1,NA,1,0\n").unwrap();
        match read_block_statistics(&path, &block(), &names(), ScoreKind::Z, MatchBy::SiteId) {
            Err(StatisticsError::Malformed { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected a malformed record, got {other:?}"),
        }
    }

    #[test]
    fn unmatched_files_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blk.csv");
        fs::write(&path, "SNP,Z,base,coding\nrs9,1.0,1,0\n").unwrap();
        assert!(matches!(
            read_block_statistics(&path, &block(), &names(), ScoreKind::Z, MatchBy::SiteId),
            Err(StatisticsError::NoMatchedVariants { .. })
        ));
    }

    #[test]
    fn shapes_are_checked() {
        let result = BlockStatistics::new(
            vec![0, 1],
            Scores::Z(Array1::zeros(2)),
            Array2::zeros((3, 1)),
        );
        assert!(matches!(result, Err(StatisticsError::Shape(_))));
    }
}
