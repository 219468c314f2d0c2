// ldgm/io.rs

//! Loading persisted LDGMs: one `.edgelist` (headerless `i,j,value` rows) and one
//! `.snplist` (CSV with a header) per LD block.

use crate::block::{LdgmBlock, VariantInfo};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockLoadError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },

    #[error("malformed record in {path} at line {line}: {message}")]
    Malformed {
        path: String,
        line: u64,
        message: String,
    },

    #[error("no .snplist matching {edgelist} was found in {directory}")]
    MissingSnplist { edgelist: String, directory: String },

    #[error("no .edgelist files found in {0}")]
    NoEdgelists(String),

    #[error("invalid block '{block}': {message}")]
    InvalidBlock { block: String, message: String },
}

#[derive(Debug, Deserialize)]
struct SnplistRecord {
    index: usize,
    #[serde(alias = "site_id", alias = "SNP")]
    site_ids: String,
    #[serde(default)]
    anc_alleles: Option<String>,
    #[serde(default)]
    deriv_alleles: Option<String>,
    #[serde(default)]
    position: Option<u64>,
}

fn csv_error(path: &Path, source: csv::Error) -> BlockLoadError {
    BlockLoadError::Csv {
        path: path.display().to_string(),
        source,
    }
}

/// Loads one LD block.
///
/// When `snplist` is `None`, the snplist is looked up next to the edgelist by file-name
/// stem. Off-diagonal edges are mirrored and diagonal edges are halved, since edgelists
/// store the diagonal of `P + Pᵀ`. Rows and columns whose diagonal is zero carry no
/// variant and are dropped; the snplist indices are remapped onto the remaining rows.
pub fn load_ldgm(edgelist: &Path, snplist: Option<&Path>) -> Result<LdgmBlock, BlockLoadError> {
    let snplist_path = match snplist {
        Some(path) => path.to_path_buf(),
        None => find_snplist(edgelist)?,
    };
    let name = edgelist
        .file_name()
        .map(|file| file.to_string_lossy().trim_end_matches(".edgelist").to_string())
        .unwrap_or_else(|| edgelist.display().to_string());

    let edges = read_edgelist(edgelist)?;
    let dim = edges
        .iter()
        .map(|&(i, j, _)| i.max(j) + 1)
        .max()
        .unwrap_or(0);

    let mut diagonal = vec![0.0f64; dim];
    for &(i, j, value) in &edges {
        if i == j {
            diagonal[i] += value;
        }
    }
    let mut remap = vec![None; dim];
    let mut kept = 0usize;
    for (row, &value) in diagonal.iter().enumerate() {
        if value != 0.0 {
            remap[row] = Some(kept);
            kept += 1;
        }
    }

    let remapped_edges: Vec<(usize, usize, f64)> = edges
        .iter()
        .filter_map(|&(i, j, value)| {
            let value = if i == j { value / 2.0 } else { value };
            Some((remap[i]?, remap[j]?, value))
        })
        .collect();

    let variants: Vec<VariantInfo> = read_snplist(&snplist_path)?
        .into_iter()
        .filter_map(|record| {
            let index = remap.get(record.index).copied().flatten()?;
            Some(VariantInfo {
                index,
                original_index: record.index,
                site_id: record.site_ids,
                anc_allele: record.anc_alleles,
                deriv_allele: record.deriv_alleles,
                position: record.position,
            })
        })
        .collect();

    log::debug!(
        "Loaded LDGM block {} with {} rows ({} dropped) and {} variants",
        name,
        kept,
        dim - kept,
        variants.len()
    );
    LdgmBlock::from_edges(name, kept, &remapped_edges, variants)
}

/// Loads every `*.edgelist` file of a directory, in natural file-name order. A
/// population name restricts the files to those whose name contains it.
pub fn load_ldgm_dir(
    directory: &Path,
    population: Option<&str>,
) -> Result<Vec<LdgmBlock>, BlockLoadError> {
    let entries = fs::read_dir(directory).map_err(|source| BlockLoadError::Io {
        path: directory.display().to_string(),
        source,
    })?;
    let mut edgelists: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry
            .map_err(|source| BlockLoadError::Io {
                path: directory.display().to_string(),
                source,
            })?
            .path();
        let Some(file_name) = path.file_name().map(|f| f.to_string_lossy().to_string()) else {
            continue;
        };
        if !file_name.ends_with(".edgelist") {
            continue;
        }
        if population.is_some_and(|pop| !file_name.contains(pop)) {
            continue;
        }
        edgelists.push(path);
    }
    if edgelists.is_empty() {
        return Err(BlockLoadError::NoEdgelists(directory.display().to_string()));
    }
    edgelists.sort_by(|a, b| natord::compare(&a.to_string_lossy(), &b.to_string_lossy()));
    edgelists
        .iter()
        .map(|path| load_ldgm(path, None))
        .collect()
}

/// Finds `<stem>*.snplist` next to an edgelist, where the stem is the file name up to
/// its first `.`.
pub fn find_snplist(edgelist: &Path) -> Result<PathBuf, BlockLoadError> {
    let directory = edgelist
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let stem = edgelist
        .file_name()
        .map(|file| file.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = stem.split('.').next().unwrap_or_default().to_string();

    let missing = || BlockLoadError::MissingSnplist {
        edgelist: edgelist.display().to_string(),
        directory: directory.display().to_string(),
    };
    let entries = fs::read_dir(directory).map_err(|_| missing())?;
    let mut candidates: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .map(|f| f.to_string_lossy().to_string())
                .is_some_and(|f| f.starts_with(&stem) && f.ends_with(".snplist"))
        })
        .collect();
    candidates.sort_by(|a, b| natord::compare(&a.to_string_lossy(), &b.to_string_lossy()));
    candidates.into_iter().next().ok_or_else(missing)
}

fn read_edgelist(path: &Path) -> Result<Vec<(usize, usize, f64)>, BlockLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| csv_error(path, source))?;

    let mut edges = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| csv_error(path, source))?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let malformed = |message: String| BlockLoadError::Malformed {
            path: path.display().to_string(),
            line,
            message,
        };
        if record.len() != 3 {
            return Err(malformed(format!(
                "expected 3 fields (i,j,value), found {}",
                record.len()
            )));
        }
        let i: usize = record[0]
            .parse()
            .map_err(|_| malformed(format!("invalid row index '{}'", &record[0])))?;
        let j: usize = record[1]
            .parse()
            .map_err(|_| malformed(format!("invalid column index '{}'", &record[1])))?;
        let value: f64 = record[2]
            .parse()
            .map_err(|_| malformed(format!("invalid edge weight '{}'", &record[2])))?;
        if !value.is_finite() {
            return Err(malformed(format!("non-finite edge weight {value}")));
        }
        edges.push((i, j, value));
    }
    Ok(edges)
}

fn read_snplist(path: &Path) -> Result<Vec<SnplistRecord>, BlockLoadError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|source| csv_error(path, source))?;
    reader
        .deserialize()
        .map(|record| record.map_err(|source| csv_error(path, source)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &str) {
        let mut file = File::create(path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_and_compacts_a_block() {
        let dir = tempdir().unwrap();
        let edgelist = dir.path().join("1kg_chr1_100_200.EUR.edgelist");
        let snplist = dir.path().join("1kg_chr1_100_200.snplist");
        // Row 1 has no diagonal entry and must disappear.
        write(&edgelist, "0,0,2.0\n0,2,-0.5\n2,2,1.5\n3,3,1.0\n2,3,0.25\n");
        write(
            &snplist,
            "index,site_ids,anc_alleles,deriv_alleles,position\n\
             0,rs0,A,G,100\n1,rs1,C,T,110\n2,rs2,G,A,120\n3,rs3,T,C,130\n2,rs2dup,G,A,121\n",
        );

        let block = load_ldgm(&edgelist, None).unwrap();
        assert_eq!(block.name(), "1kg_chr1_100_200.EUR");
        assert_eq!(block.dim(), 3);
        let dense = block.to_dense();
        assert_eq!(dense[[0, 0]], 1.0);
        assert_eq!(dense[[0, 1]], -0.5);
        assert_eq!(dense[[1, 0]], -0.5);
        assert_eq!(dense[[1, 1]], 0.75);
        assert_eq!(dense[[1, 2]], 0.25);
        assert_eq!(dense[[2, 2]], 0.5);

        let sites: Vec<&str> = block.variants().iter().map(|v| v.site_id.as_str()).collect();
        assert_eq!(sites, vec!["rs0", "rs2", "rs3", "rs2dup"]);
        let rs2 = block.variant_by_site("rs2").unwrap();
        assert_eq!(rs2.index, 1);
        assert_eq!(rs2.original_index, 2);
        assert_eq!(rs2.position, Some(120));
    }

    #[test]
    fn malformed_edges_report_their_line() {
        let dir = tempdir().unwrap();
        let edgelist = dir.path().join("blk.edgelist");
        let snplist = dir.path().join("blk.snplist");
        write(&edgelist, "0,0,1.0\n1,x,2.0\n");
        write(&snplist, "index,site_ids\n0,rs0\n");
        match load_ldgm(&edgelist, Some(&snplist)) {
            Err(BlockLoadError::Malformed { line, message, .. }) => {
                assert_eq!(line, 2);
                assert!(message.contains("column index"));
            }
            other => panic!("expected a malformed-record error, got {other:?}"),
        }
    }

    #[test]
    fn missing_snplist_is_an_error() {
        let dir = tempdir().unwrap();
        let edgelist = dir.path().join("lonely.edgelist");
        write(&edgelist, "0,0,1.0\n");
        assert!(matches!(
            load_ldgm(&edgelist, None),
            Err(BlockLoadError::MissingSnplist { .. })
        ));
    }

    #[test]
    fn directory_loading_filters_by_population() {
        let dir = tempdir().unwrap();
        for (name, pop) in [("blk2", "EUR"), ("blk10", "EUR"), ("blk3", "AFR")] {
            write(
                &dir.path().join(format!("{name}.{pop}.edgelist")),
                "0,0,1.0\n1,1,1.0\n",
            );
            write(
                &dir.path().join(format!("{name}.snplist")),
                "index,site_ids\n0,a\n1,b\n",
            );
        }
        let blocks = load_ldgm_dir(dir.path(), Some("EUR")).unwrap();
        let names: Vec<&str> = blocks.iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["blk2.EUR", "blk10.EUR"]);

        assert!(matches!(
            load_ldgm_dir(dir.path(), Some("EAS")),
            Err(BlockLoadError::NoEdgelists(_))
        ));
    }
}
