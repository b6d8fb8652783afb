//! Layout computation (C5): turns per-user-bin cardinalities and sketches
//! into a [`layout::Layout`] tree describing how user bins map onto the
//! technical bins of a hierarchy of IBFs.

/// Shared state threaded through one hierarchical-binning computation.
pub mod data_store;
/// The split/merge dynamic program (C5).
pub mod hierarchical_binning;
/// The two-table layout tree and its text persistence format (§6.2).
pub mod layout;
/// Non-recursive, single-level binning used once a merged sub-problem fits.
pub mod simple_binning;

pub use data_store::{DataStore, PreviousLevel};
pub use hierarchical_binning::{BinningParams, HierarchicalBinning};
pub use layout::{Layout, MaxBinEntry, UserBinEntry};
pub use simple_binning::SimpleBinning;

use crate::fpr::{relaxed_fpr_correction, FprCorrection};
use crate::sketch::Hyperloglog;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// The technical bin a binning run identified as "fullest" (the one
/// determining how wide every row of the containing IBF must be), together
/// with the already-FPR-corrected per-bin cardinality it was chosen with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FullestBin {
    /// Technical bin index within the IBF this binning run just laid out.
    pub technical_bin_idx: usize,
    /// FPR-corrected cardinality attributed to that bin.
    pub corrected_size: usize,
    /// Whether the fullest bin is a merged (lower-level) bin, which must be
    /// sized with the relaxed FPR rather than the strict one.
    pub is_merged: bool,
}

/// The product of running the full layout computation (C5) once: the
/// persisted two-table [`Layout`] plus the builder-internal technical-bin
/// count recorded for every node's path (not part of the persisted format —
/// a loader recomputes it from `tmax` and a node's user-bin count).
pub struct LayoutResult {
    /// The layout tree, flat-encoded.
    pub layout: Layout,
    /// `technical_bin_counts[path]` is the number of technical bins the
    /// binning run allocated for the node at `path` (the empty path is the
    /// root).
    pub technical_bin_counts: HashMap<Vec<usize>, usize>,
    /// The root IBF's own fullest technical bin, as chosen by the DP.
    pub root_fullest_bin: FullestBin,
}

/// Runs the hierarchical binning DP (C5) once, over every user bin, and
/// returns the resulting [`LayoutResult`]. This is the top-level entry point
/// the HIBF builder (C7) calls; it also records the top-level
/// `#TOP_LEVEL_IBF` entry into `layout.max_bins`, matching the text format's
/// convention that every IBF (including the root) has exactly one
/// [`MaxBinEntry`] describing its own fullest bin.
pub fn compute_layout(kmer_counts: Vec<usize>, sketches: Vec<Hyperloglog>, params: &BinningParams) -> LayoutResult {
    let fpr_correction = Rc::new(FprCorrection::build(params.maximum_fpr, params.hash_count, params.tmax));
    let relaxed = relaxed_fpr_correction(params.maximum_fpr, params.relaxed_fpr, params.hash_count);
    let positions: Vec<usize> = (0..kmer_counts.len()).collect();
    let technical_bin_counts = Rc::new(RefCell::new(HashMap::new()));
    let hibf_layout = Rc::new(RefCell::new(Layout::default()));

    let mut data = DataStore {
        hibf_layout: Rc::clone(&hibf_layout),
        kmer_counts: Rc::new(kmer_counts),
        sketches: Rc::new(sketches),
        positions,
        fpr_correction,
        relaxed_fpr_correction: relaxed,
        previous: PreviousLevel::default(),
        user_bins_arranged: false,
        technical_bin_counts: Rc::clone(&technical_bin_counts),
    };

    let root_fullest_bin = HierarchicalBinning::new(&mut data, params).execute();
    drop(data);

    hibf_layout.borrow_mut().max_bins.push(MaxBinEntry {
        previous_trace: Vec::new(),
        fullest_technical_bin_idx: root_fullest_bin.technical_bin_idx,
    });

    let layout = Rc::try_unwrap(hibf_layout)
        .expect("compute_layout holds the only reference once the DP has returned")
        .into_inner();
    let technical_bin_counts = Rc::try_unwrap(technical_bin_counts)
        .expect("compute_layout holds the only reference once the DP has returned")
        .into_inner();

    LayoutResult {
        layout,
        technical_bin_counts,
        root_fullest_bin,
    }
}
