//! Shared state threaded through one hierarchical-binning computation and
//! its recursive sub-problems.

use super::layout::Layout;
use crate::error::{HibfError, Result};
use crate::fpr::FprCorrection;
use crate::sketch::Hyperloglog;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// The chain of parent technical-bin indices leading to the current
/// sub-problem (empty at the root).
#[derive(Clone, Debug, Default)]
pub struct PreviousLevel {
    /// Path of technical-bin indices from the root down to (not including)
    /// this sub-problem's own IBF.
    pub bin_indices: Vec<usize>,
}

impl PreviousLevel {
    /// Whether this is the root level (no ancestors).
    pub fn is_empty(&self) -> bool {
        self.bin_indices.is_empty()
    }
}

/// All data needed to compute (a sub-problem of) the hierarchical layout.
///
/// `hibf_layout` is shared (via `Rc<RefCell<_>>`) across the whole recursive
/// computation: every sub-problem appends its own records into the same,
/// single output [`Layout`]. `kmer_counts`, `sketches` and `fpr_correction`
/// are shared read-only inputs; `positions` indexes into them and is local
/// to each sub-problem.
pub struct DataStore {
    /// The single output layout shared by the whole computation.
    pub hibf_layout: Rc<RefCell<Layout>>,
    /// Cardinality (kmer count) per user bin, indexed globally.
    pub kmer_counts: Rc<Vec<usize>>,
    /// HyperLogLog sketch per user bin, indexed globally.
    pub sketches: Rc<Vec<Hyperloglog>>,
    /// Indices into `kmer_counts`/`sketches` that belong to this sub-problem,
    /// in the order they should be processed.
    pub positions: Vec<usize>,
    /// Shared FPR correction table.
    pub fpr_correction: Rc<FprCorrection>,
    /// Scaling factor applied to merged-bin cardinalities.
    pub relaxed_fpr_correction: f64,
    /// Path down from the root to this sub-problem.
    pub previous: PreviousLevel,
    /// Whether `positions` has already been sorted/rearranged.
    pub user_bins_arranged: bool,
    /// Technical-bin count each binning run records for its own path, keyed
    /// by `previous.bin_indices` (builder-internal bookkeeping; not part of
    /// the persisted two-table layout format, which recomputes this from
    /// `tmax` and the node's user-bin count at load time).
    pub technical_bin_counts: Rc<RefCell<HashMap<Vec<usize>, usize>>>,
}

impl DataStore {
    /// Validates the invariants the binning algorithms rely on, matching
    /// the reference implementation's exact error messages.
    pub fn validate(&self) -> Result<()> {
        if self.kmer_counts.len() != self.sketches.len() {
            return Err(HibfError::InvalidConfig(
                "data_store::kmer_counts and data_store::sketches must have the same size.".into(),
            ));
        }
        if self.kmer_counts.len() < self.positions.len() {
            return Err(HibfError::InvalidConfig(
                "data_store::kmer_counts.size() must not be smaller than data_store::positions.size().".into(),
            ));
        }
        if self.fpr_correction.is_empty() {
            return Err(HibfError::InvalidConfig("data_store::fpr_correction must not be empty.".into()));
        }
        if !(self.relaxed_fpr_correction > 0.0 && self.relaxed_fpr_correction <= 1.0) {
            return Err(HibfError::InvalidConfig(
                "data_store::relaxed_fpr_correction must be in (0.0,1.0].".into(),
            ));
        }
        Ok(())
    }

    /// Builds a sub-`DataStore` for a merged interval `positions[start..=end]`
    /// (inclusive), sharing the parent's layout/counts/sketches/correction
    /// table and extending the path with `parent_bin`.
    pub fn sub_store_for_merge(&self, range: &[usize], parent_bin: usize) -> DataStore {
        let mut bin_indices = self.previous.bin_indices.clone();
        bin_indices.push(parent_bin);
        DataStore {
            hibf_layout: Rc::clone(&self.hibf_layout),
            kmer_counts: Rc::clone(&self.kmer_counts),
            sketches: Rc::clone(&self.sketches),
            positions: range.to_vec(),
            fpr_correction: Rc::clone(&self.fpr_correction),
            relaxed_fpr_correction: self.relaxed_fpr_correction,
            previous: PreviousLevel { bin_indices },
            user_bins_arranged: true,
            technical_bin_counts: Rc::clone(&self.technical_bin_counts),
        }
    }
}
