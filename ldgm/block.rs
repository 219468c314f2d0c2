// ldgm/block.rs

//! # LDGM Blocks
//!
//! An [`LdgmBlock`] is the immutable half of the model: one LD block's sparse precision
//! matrix together with the map from variants (snplist rows) to matrix rows. Blocks are
//! loaded once and shared behind an `Arc` by every operator built from them.

use crate::io::BlockLoadError;
use faer::sparse::{SparseColMat, Triplet};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Tolerance used when checking that dense input is symmetric.
const SYMMETRY_TOLERANCE: f64 = 1e-12;

/// One snplist entry. Several variants may point at the same matrix row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariantInfo {
    /// Row of the precision matrix after empty rows were dropped.
    pub index: usize,
    /// Row index as written in the persisted snplist.
    pub original_index: usize,
    pub site_id: String,
    pub anc_allele: Option<String>,
    pub deriv_allele: Option<String>,
    pub position: Option<u64>,
}

impl VariantInfo {
    /// Placeholder variant for synthetic blocks built in memory.
    pub fn synthetic(index: usize) -> Self {
        Self {
            index,
            original_index: index,
            site_id: format!("var{index}"),
            anc_allele: None,
            deriv_allele: None,
            position: None,
        }
    }
}

/// Relationship between LDGM alleles and summary-statistic alleles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllelePhase {
    Match,
    Swapped,
    Mismatch,
}

impl AllelePhase {
    /// `1` for an exact match, `-1` for swapped alleles, `0` otherwise.
    pub fn sign(self) -> i8 {
        match self {
            Self::Match => 1,
            Self::Swapped => -1,
            Self::Mismatch => 0,
        }
    }
}

/// Compares ancestral/derived alleles against reference/alternative, ignoring case.
pub fn merge_alleles(anc: &str, deriv: &str, reference: &str, alternative: &str) -> AllelePhase {
    let same = |a: &str, b: &str| a.eq_ignore_ascii_case(b);
    if same(anc, reference) && same(deriv, alternative) {
        AllelePhase::Match
    } else if same(anc, alternative) && same(deriv, reference) {
        AllelePhase::Swapped
    } else {
        AllelePhase::Mismatch
    }
}

/// How a summary-statistics record identifies its variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VariantKey<'a> {
    Site(&'a str),
    /// Base-pair position; a block covers a single chromosome.
    Position(u64),
}

/// A summary-statistics record to be located inside a block.
#[derive(Clone, Copy, Debug)]
pub struct VariantQuery<'a> {
    pub key: VariantKey<'a>,
    /// `(reference, alternative)` alleles, when known.
    pub alleles: Option<(&'a str, &'a str)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VariantMatch {
    /// Matrix row of the matched variant.
    pub row: usize,
    /// Position of the query in the input slice.
    pub record: usize,
    pub phase: AllelePhase,
}

#[derive(Clone, Debug)]
pub struct LdgmBlock {
    name: String,
    dim: usize,
    col_ptr: Vec<usize>,
    row_idx: Vec<usize>,
    values: Vec<f64>,
    variants: Vec<VariantInfo>,
    site_lookup: HashMap<String, usize>,
    position_lookup: HashMap<u64, usize>,
}

impl LdgmBlock {
    /// Builds a block from graph edges. Off-diagonal edges are mirrored, so each edge
    /// must appear once; repeated entries are summed.
    pub fn from_edges(
        name: impl Into<String>,
        dim: usize,
        edges: &[(usize, usize, f64)],
        variants: Vec<VariantInfo>,
    ) -> Result<Self, BlockLoadError> {
        let name = name.into();
        let mut entries: BTreeMap<(usize, usize), f64> = BTreeMap::new();
        for &(i, j, value) in edges {
            if i >= dim || j >= dim {
                return Err(BlockLoadError::InvalidBlock {
                    block: name,
                    message: format!("edge ({i}, {j}) outside a {dim}x{dim} matrix"),
                });
            }
            if !value.is_finite() {
                return Err(BlockLoadError::InvalidBlock {
                    block: name,
                    message: format!("edge ({i}, {j}) has non-finite weight {value}"),
                });
            }
            *entries.entry((i, j)).or_insert(0.0) += value;
            if i != j {
                *entries.entry((j, i)).or_insert(0.0) += value;
            }
        }
        let entries: Vec<(usize, usize, f64)> = entries
            .into_iter()
            .map(|((i, j), value)| (i, j, value))
            .collect();
        Self::from_entries(name, dim, &entries, variants)
    }

    /// Builds a block from a dense symmetric matrix, keeping its nonzero entries.
    pub fn from_dense(
        name: impl Into<String>,
        matrix: &Array2<f64>,
        variants: Option<Vec<VariantInfo>>,
    ) -> Result<Self, BlockLoadError> {
        let name = name.into();
        let (rows, cols) = matrix.dim();
        if rows != cols {
            return Err(BlockLoadError::InvalidBlock {
                block: name,
                message: format!("precision matrix must be square, got {rows}x{cols}"),
            });
        }
        let mut entries = Vec::new();
        for j in 0..cols {
            for i in 0..rows {
                let value = matrix[[i, j]];
                if (value - matrix[[j, i]]).abs() > SYMMETRY_TOLERANCE {
                    return Err(BlockLoadError::InvalidBlock {
                        block: name,
                        message: format!("precision matrix is not symmetric at ({i}, {j})"),
                    });
                }
                if value != 0.0 {
                    entries.push((i, j, value));
                }
            }
        }
        let variants = variants.unwrap_or_else(|| (0..rows).map(VariantInfo::synthetic).collect());
        Self::from_entries(name, rows, &entries, variants)
    }

    /// Assembles the column-compressed matrix. Rows end up sorted within each column
    /// and repeated coordinates are summed.
    fn from_entries(
        name: String,
        dim: usize,
        entries: &[(usize, usize, f64)],
        variants: Vec<VariantInfo>,
    ) -> Result<Self, BlockLoadError> {
        if dim == 0 {
            return Err(BlockLoadError::InvalidBlock {
                block: name,
                message: "precision matrix has no rows".to_string(),
            });
        }
        if let Some(variant) = variants.iter().find(|v| v.index >= dim) {
            return Err(BlockLoadError::InvalidBlock {
                block: name,
                message: format!(
                    "variant {} points at row {} of a {dim}-row matrix",
                    variant.site_id, variant.index
                ),
            });
        }
        let mut triplets = Vec::with_capacity(entries.len());
        for &(i, j, value) in entries {
            triplets.push(Triplet::new(i, j, value));
        }
        let assembled: SparseColMat<usize, f64> =
            SparseColMat::try_new_from_triplets(dim, dim, &triplets).map_err(|err| {
                BlockLoadError::InvalidBlock {
                    block: name.clone(),
                    message: format!("failed to assemble sparse matrix: {err:?}"),
                }
            })?;
        let (col_ptr, row_idx, values) = {
            let (symbolic, values) = assembled.parts();
            (
                symbolic.col_ptr().to_vec(),
                symbolic.row_idx().to_vec(),
                values.to_vec(),
            )
        };

        let mut site_lookup = HashMap::with_capacity(variants.len());
        for (position, variant) in variants.iter().enumerate() {
            site_lookup.entry(variant.site_id.clone()).or_insert(position);
        }
        let mut position_lookup = HashMap::new();
        for (position, variant) in variants.iter().enumerate() {
            if let Some(bp) = variant.position {
                position_lookup.entry(bp).or_insert(position);
            }
        }

        Ok(Self {
            name,
            dim,
            col_ptr,
            row_idx,
            values,
            variants,
            site_lookup,
            position_lookup,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of matrix rows.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Stored entries, both triangles counted.
    pub fn nnz(&self) -> usize {
        self.row_idx.len()
    }

    pub fn variants(&self) -> &[VariantInfo] {
        &self.variants
    }

    /// Row indices and values stored in column `j`.
    pub fn column(&self, j: usize) -> (&[usize], &[f64]) {
        let range = self.col_ptr[j]..self.col_ptr[j + 1];
        (&self.row_idx[range.clone()], &self.values[range])
    }

    pub fn variant_by_site(&self, site_id: &str) -> Option<&VariantInfo> {
        self.site_lookup
            .get(site_id)
            .map(|&position| &self.variants[position])
    }

    /// First snplist entry at base-pair position `bp`.
    pub fn variant_by_position(&self, bp: u64) -> Option<&VariantInfo> {
        self.position_lookup
            .get(&bp)
            .map(|&position| &self.variants[position])
    }

    fn variant_by_key(&self, key: VariantKey<'_>) -> Option<&VariantInfo> {
        match key {
            VariantKey::Site(site_id) => self.variant_by_site(site_id),
            VariantKey::Position(bp) => self.variant_by_position(bp),
        }
    }

    /// Locates summary-statistic records in this block.
    ///
    /// Records whose alleles disagree with the LDGM are dropped, and when several
    /// records resolve to the same matrix row only the first is kept.
    pub fn match_variants(&self, queries: &[VariantQuery<'_>]) -> Vec<VariantMatch> {
        let mut seen_rows = HashSet::new();
        let mut matches = Vec::new();
        for (record, query) in queries.iter().enumerate() {
            let Some(variant) = self.variant_by_key(query.key) else {
                continue;
            };
            let phase = match (query.alleles, &variant.anc_allele, &variant.deriv_allele) {
                (Some((reference, alternative)), Some(anc), Some(deriv)) => {
                    merge_alleles(anc, deriv, reference, alternative)
                }
                _ => AllelePhase::Match,
            };
            if phase == AllelePhase::Mismatch {
                continue;
            }
            if seen_rows.insert(variant.index) {
                matches.push(VariantMatch {
                    row: variant.index,
                    record,
                    phase,
                });
            }
        }
        matches
    }

    /// Dense copy of the precision matrix, for small blocks and diagnostics.
    pub fn to_dense(&self) -> Array2<f64> {
        let n = self.dim();
        let mut dense = Array2::<f64>::zeros((n, n));
        for j in 0..n {
            let (rows, values) = self.column(j);
            for (&i, &value) in rows.iter().zip(values) {
                dense[[i, j]] += value;
            }
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn variant(index: usize, site: &str, anc: &str, deriv: &str) -> VariantInfo {
        VariantInfo {
            index,
            original_index: index,
            site_id: site.to_string(),
            anc_allele: Some(anc.to_string()),
            deriv_allele: Some(deriv.to_string()),
            position: Some(1_000 + index as u64),
        }
    }

    #[test]
    fn edges_are_mirrored() {
        let block = LdgmBlock::from_edges(
            "chain",
            3,
            &[(0, 0, 2.0), (1, 1, 2.0), (2, 2, 2.0), (0, 1, -1.0), (1, 2, -0.5)],
            (0..3).map(VariantInfo::synthetic).collect(),
        )
        .unwrap();
        let dense = block.to_dense();
        assert_eq!(dense, array![[2.0, -1.0, 0.0], [-1.0, 2.0, -0.5], [0.0, -0.5, 2.0]]);
        assert_eq!(block.nnz(), 7);
    }

    #[test]
    fn asymmetric_dense_input_is_rejected() {
        let err = LdgmBlock::from_dense("bad", &array![[1.0, 0.5], [0.0, 1.0]], None).unwrap_err();
        assert!(matches!(err, BlockLoadError::InvalidBlock { .. }));
    }

    #[test]
    fn out_of_range_edges_are_rejected() {
        let err = LdgmBlock::from_edges("bad", 2, &[(0, 2, 1.0)], Vec::new()).unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn allele_phase_is_case_insensitive() {
        assert_eq!(merge_alleles("A", "g", "a", "G"), AllelePhase::Match);
        assert_eq!(merge_alleles("A", "G", "g", "a"), AllelePhase::Swapped);
        assert_eq!(merge_alleles("A", "G", "A", "T"), AllelePhase::Mismatch);
        assert_eq!(AllelePhase::Swapped.sign(), -1);
    }

    #[test]
    fn matching_drops_mismatches_and_repeated_rows() {
        let variants = vec![
            variant(0, "rs1", "A", "G"),
            variant(1, "rs2", "C", "T"),
            variant(1, "rs2b", "C", "T"),
            variant(2, "rs3", "A", "C"),
        ];
        let block = LdgmBlock::from_dense("b", &Array2::eye(3), Some(variants)).unwrap();
        let queries = [
            VariantQuery { key: VariantKey::Site("rs3"), alleles: Some(("C", "A")) },
            VariantQuery { key: VariantKey::Site("rs2"), alleles: Some(("C", "T")) },
            VariantQuery { key: VariantKey::Site("rs2b"), alleles: None },
            VariantQuery { key: VariantKey::Site("rs1"), alleles: Some(("A", "T")) },
            VariantQuery { key: VariantKey::Site("missing"), alleles: None },
        ];
        let matches = block.match_variants(&queries);
        assert_eq!(
            matches,
            vec![
                VariantMatch { row: 2, record: 0, phase: AllelePhase::Swapped },
                VariantMatch { row: 1, record: 1, phase: AllelePhase::Match },
            ]
        );
    }

    #[test]
    fn matching_by_position_uses_the_snplist_coordinates() {
        let variants = vec![
            variant(0, "rs1", "A", "G"),
            variant(1, "rs2", "C", "T"),
            variant(2, "rs3", "A", "C"),
        ];
        let block = LdgmBlock::from_dense("b", &Array2::eye(3), Some(variants)).unwrap();
        assert_eq!(block.variant_by_position(1_002).map(|v| v.site_id.as_str()), Some("rs3"));
        assert!(block.variant_by_position(7).is_none());

        let queries = [
            VariantQuery { key: VariantKey::Position(1_001), alleles: Some(("T", "C")) },
            VariantQuery { key: VariantKey::Position(999), alleles: None },
            VariantQuery { key: VariantKey::Position(1_000), alleles: None },
        ];
        assert_eq!(
            block.match_variants(&queries),
            vec![
                VariantMatch { row: 1, record: 0, phase: AllelePhase::Swapped },
                VariantMatch { row: 0, record: 2, phase: AllelePhase::Match },
            ]
        );
    }
}
