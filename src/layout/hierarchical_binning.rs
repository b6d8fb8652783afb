//! Hierarchical binning (C5): the dynamic program that decides, for each
//! user bin, whether to split it across technical bins or merge it with its
//! neighbours into a technical bin backed by a lower-level IBF.

use super::data_store::DataStore;
use super::layout::{MaxBinEntry, UserBinEntry};
use super::simple_binning::SimpleBinning;
use super::FullestBin;
use crate::fpr::bin_size_in_bits;
use crate::sketch::toolbox;

/// Tracks the technical bin that should be reported as this IBF's "fullest"
/// (FPR-determining) bin: one candidate among split bins, one among merged
/// (lower-level) bins, reconciled at the end.
#[derive(Default)]
struct MaximumBinTracker {
    max_id: usize,
    max_size: usize,
    max_split_id: usize,
    max_split_size: usize,
    any_merged: bool,
    any_split: bool,
}

impl MaximumBinTracker {
    fn update_max(&mut self, new_id: usize, new_size: usize) {
        if !self.any_merged || new_size > self.max_size {
            self.max_id = new_id;
            self.max_size = new_size;
        }
        self.any_merged = true;
    }

    /// `new_size` must already include FPR correction.
    fn update_split_max(&mut self, new_id: usize, new_size: usize) {
        if !self.any_split || new_size > self.max_split_size {
            self.max_split_id = new_id;
            self.max_split_size = new_size;
        }
        self.any_split = true;
    }

    /// Decides which bin is reported as the maximum bin: prefer the fuller
    /// merged bin unless shrinking it to the relaxed FPR would push it below
    /// what the largest split bin already needs at the strict FPR.
    fn choose_max_bin(&self, maximum_fpr: f64, relaxed_fpr: f64, hash_count: usize) -> FullestBin {
        match (self.any_merged, self.any_split) {
            (false, false) => FullestBin {
                technical_bin_idx: 0,
                corrected_size: 0,
                is_merged: false,
            },
            (true, false) => FullestBin {
                technical_bin_idx: self.max_id,
                corrected_size: self.max_size,
                is_merged: true,
            },
            (false, true) => FullestBin {
                technical_bin_idx: self.max_split_id,
                corrected_size: self.max_split_size,
                is_merged: false,
            },
            (true, true) => {
                let minimum_bits = bin_size_in_bits(maximum_fpr, hash_count, self.max_split_size);
                let merged_bits = bin_size_in_bits(relaxed_fpr, hash_count, self.max_size);
                if minimum_bits > merged_bits {
                    FullestBin {
                        technical_bin_idx: self.max_split_id,
                        corrected_size: self.max_split_size,
                        is_merged: false,
                    }
                } else {
                    FullestBin {
                        technical_bin_idx: self.max_id,
                        corrected_size: self.max_size,
                        is_merged: true,
                    }
                }
            }
        }
    }
}

/// Parameters of the HIBF build that the DP needs but that do not belong on
/// [`DataStore`] (they are shared, read-only, and not part of any one
/// sub-problem's own bookkeeping).
pub struct BinningParams {
    /// Maximum technical bins per IBF (the DP's column budget at the root).
    pub tmax: usize,
    /// DP cost weight on lower-level IBFs.
    pub alpha: f64,
    /// Strict target FPR.
    pub maximum_fpr: f64,
    /// Relaxed (merged-bin) FPR.
    pub relaxed_fpr: f64,
    /// Number of Bloom hash functions.
    pub hash_count: usize,
    /// Skip HyperLogLog union estimates in the DP.
    pub disable_estimate_union: bool,
    /// Skip content-similarity rearrangement.
    pub disable_rearrangement: bool,
    /// Interval-size ratio for rearrangement.
    pub max_rearrangement_ratio: f64,
}

/// How cell `(i, j)` of the DP was reached.
#[derive(Clone, Copy)]
enum Trace {
    /// User bin `j` is split across `i - prev_i` technical bins, ending at
    /// technical bin `i`. `prev_i == None` means "nothing before" (the base
    /// case used at `j == 0`, splitting across `i + 1` bins starting at 0).
    Split { prev_i: Option<usize> },
    /// User bins `merge_start..=j` are merged into the single technical bin
    /// `i`, backed by a lower-level IBF. `prev_i == None` means nothing
    /// precedes this merge (only possible when `merge_start == 0`).
    Merge { prev_i: Option<usize>, merge_start: usize },
}

/// Executes the hierarchical binning algorithm, writing records into the
/// shared layout and returning the id of this IBF's fullest technical bin.
pub struct HierarchicalBinning<'a> {
    data: &'a mut DataStore,
    params: &'a BinningParams,
    num_user_bins: usize,
    num_technical_bins: usize,
}

impl<'a> HierarchicalBinning<'a> {
    /// Builds a binning instance for `data`'s current sub-problem. At the
    /// root (`data.previous` empty) the technical-bin budget is exactly
    /// `params.tmax`; in a recursive sub-problem it is whatever is needed to
    /// hold `data.positions.len()` user bins, capped at `tmax`.
    pub fn new(data: &'a mut DataStore, params: &'a BinningParams) -> Self {
        let num_user_bins = data.positions.len();
        let num_technical_bins = if data.previous.is_empty() {
            params.tmax
        } else {
            needed_technical_bins(num_user_bins, params.tmax)
        };
        data.technical_bin_counts
            .borrow_mut()
            .insert(data.previous.bin_indices.clone(), num_technical_bins);
        Self {
            data,
            params,
            num_user_bins,
            num_technical_bins,
        }
    }

    /// Runs the full algorithm: optional sort/rearrange, DP fill,
    /// backtracking. Returns the fullest technical bin for this IBF.
    pub fn execute(mut self) -> FullestBin {
        if !self.data.user_bins_arranged {
            toolbox::sort_by_cardinalities(&self.data.kmer_counts, &mut self.data.positions);
            if !self.params.disable_estimate_union && !self.params.disable_rearrangement {
                toolbox::rearrange_bins(
                    &self.data.sketches,
                    &self.data.kmer_counts,
                    &mut self.data.positions,
                    self.params.max_rearrangement_ratio,
                );
            }
            self.data.user_bins_arranged = true;
        }

        if self.num_user_bins == 0 {
            return FullestBin {
                technical_bin_idx: 0,
                corrected_size: 0,
                is_merged: false,
            };
        }

        let i_dim = self.num_technical_bins;
        let j_dim = self.num_user_bins;

        let mut matrix = vec![vec![0usize; j_dim]; i_dim];
        let mut ll_matrix = vec![vec![0usize; j_dim]; i_dim];
        let mut trace: Vec<Vec<Option<Trace>>> = vec![vec![None; j_dim]; i_dim];

        self.initialization(&mut matrix, &mut ll_matrix, &mut trace);
        self.recursion(&mut matrix, &mut ll_matrix, &mut trace);
        self.backtracking(&trace)
    }

    fn cardinality(&self, j: usize) -> usize {
        self.data.kmer_counts[self.data.positions[j]]
    }

    fn max_merge_levels(&self, num_ubs_in_merge: usize) -> usize {
        max_merge_levels(num_ubs_in_merge, self.num_technical_bins)
    }

    fn initialization(
        &self,
        matrix: &mut [Vec<usize>],
        ll_matrix: &mut [Vec<usize>],
        trace: &mut [Vec<Option<Trace>>],
    ) {
        let i_dim = self.num_technical_bins;
        let j_dim = self.num_user_bins;

        // Column 0: split user bin 0 across i+1 technical bins, for every i.
        let c0 = self.cardinality(0);
        for i in 0..i_dim {
            let corrected = (c0 as f64 * self.data.fpr_correction.get(i + 1)) as usize;
            matrix[i][0] = div_ceil(corrected, i + 1);
            trace[i][0] = Some(Trace::Split { prev_i: None });
        }

        if j_dim <= 1 {
            return;
        }

        // Row 0: merge the prefix of user bins 0..=j into the single
        // technical bin 0, for every j >= 1 (j == 0 is already set above).
        if !self.params.disable_estimate_union {
            let mut union_estimates = vec![0u64; j_dim];
            toolbox::precompute_initial_union_estimates(
                &mut union_estimates,
                &self.data.sketches,
                &self.data.kmer_counts,
                &self.data.positions,
            );
            for j in 1..j_dim {
                let weight = (union_estimates[j] as f64 * self.data.relaxed_fpr_correction) as usize;
                matrix[0][j] = weight;
                ll_matrix[0][j] = self.max_merge_levels(j + 1) * (union_estimates[j] as usize);
                trace[0][j] = Some(Trace::Merge { prev_i: None, merge_start: 0 });
            }
        } else {
            let mut running_sum = self.cardinality(0);
            for j in 1..j_dim {
                running_sum += self.cardinality(j);
                let weight = (running_sum as f64 * self.data.relaxed_fpr_correction) as usize;
                matrix[0][j] = weight;
                ll_matrix[0][j] = self.max_merge_levels(j + 1) * running_sum;
                trace[0][j] = Some(Trace::Merge { prev_i: None, merge_start: 0 });
            }
        }
    }

    fn recursion(
        &self,
        matrix: &mut [Vec<usize>],
        ll_matrix: &mut [Vec<usize>],
        trace: &mut [Vec<Option<Trace>>],
    ) {
        let i_dim = self.num_technical_bins;
        let j_dim = self.num_user_bins;
        let alpha = self.params.alpha;

        for j in 1..j_dim {
            let mut union_estimates = vec![0u64; j + 1];
            if !self.params.disable_estimate_union {
                toolbox::precompute_union_estimates_for(
                    &mut union_estimates,
                    &self.data.sketches,
                    &self.data.kmer_counts,
                    &self.data.positions,
                    j,
                );
            }

            for i in 1..i_dim {
                let mut best_score_total = f64::INFINITY;
                let mut best_m = 0usize;
                let mut best_ll = 0usize;
                let mut best_trace = None;

                // --- Split transitions: prev_i in 0..i. The "nothing
                // before" base case only applies at j == 0, handled in
                // initialization and not reachable here (j >= 1).
                for i_prime in 0..i {
                    let split_count = i - i_prime;
                    let corrected =
                        (self.cardinality(j) as f64 * self.data.fpr_correction.get(split_count)) as usize;
                    let score = div_ceil(corrected, split_count).max(matrix[i_prime][j - 1]);
                    let total = score as f64 * (i + 1) as f64 + alpha * ll_matrix[i_prime][j - 1] as f64;
                    if total < best_score_total {
                        best_score_total = total;
                        best_m = score;
                        best_ll = ll_matrix[i_prime][j - 1];
                        best_trace = Some(Trace::Split { prev_i: Some(i_prime) });
                    }
                }

                // --- Merge transitions: user bins merge_start..=j collapse
                // into the single technical bin i, backed by the i
                // technical bins 0..i covering user bins 0..merge_start.
                for merge_start in 0..=j {
                    let (raw_weight, count) = if !self.params.disable_estimate_union {
                        (union_estimates[merge_start] as usize, j - merge_start + 1)
                    } else {
                        let sum: usize = (merge_start..=j).map(|g| self.cardinality(g)).sum();
                        (sum, j - merge_start + 1)
                    };
                    let weight = (raw_weight as f64 * self.data.relaxed_fpr_correction) as usize;

                    let (prev_m, prev_ll) = if merge_start == 0 {
                        (0, 0)
                    } else {
                        (matrix[i - 1][merge_start - 1], ll_matrix[i - 1][merge_start - 1])
                    };

                    let score = prev_m.max(weight);
                    let ll = prev_ll + self.max_merge_levels(count) * raw_weight;
                    let total = score as f64 * (i + 1) as f64 + alpha * ll as f64;

                    if total < best_score_total {
                        best_score_total = total;
                        best_m = score;
                        best_ll = ll;
                        let prev_i = if merge_start == 0 { None } else { Some(i - 1) };
                        best_trace = Some(Trace::Merge { prev_i, merge_start });
                    }
                }

                matrix[i][j] = best_m;
                ll_matrix[i][j] = best_ll;
                trace[i][j] = best_trace;
            }
        }
    }

    fn backtracking(&mut self, trace: &[Vec<Option<Trace>>]) -> FullestBin {
        let mut tracker = MaximumBinTracker::default();

        let mut i = self.num_technical_bins - 1;
        let mut j = self.num_user_bins - 1;

        loop {
            match trace[i][j].expect("every reachable dp cell has a recorded trace") {
                Trace::Split { prev_i } => {
                    let number_of_bins = i + 1 - prev_i.map_or(0, |p| p + 1);
                    self.backtrack_split_bin(j, number_of_bins, i, &mut tracker);
                    match prev_i {
                        None => break,
                        Some(p) => {
                            i = p;
                            j -= 1;
                        }
                    }
                }
                Trace::Merge { prev_i, merge_start } => {
                    self.backtrack_merged_bin(merge_start, j, i, &mut tracker);
                    if merge_start == 0 {
                        break;
                    }
                    match prev_i {
                        None => break,
                        Some(p) => {
                            i = p;
                            j = merge_start - 1;
                        }
                    }
                }
            }
        }

        tracker.choose_max_bin(self.params.maximum_fpr, self.params.relaxed_fpr, self.params.hash_count)
    }

    fn backtrack_split_bin(&mut self, j: usize, number_of_bins: usize, bin_id: usize, tracker: &mut MaximumBinTracker) {
        let cardinality = self.cardinality(j);
        let corrected_cardinality = (cardinality as f64 * self.data.fpr_correction.get(number_of_bins)) as usize;
        let cardinality_per_bin = div_ceil(corrected_cardinality, number_of_bins);

        let start_bin = bin_id + 1 - number_of_bins;
        self.data.hibf_layout.borrow_mut().user_bins.push(UserBinEntry {
            previous_trace: self.data.previous.bin_indices.clone(),
            technical_bin_idx: start_bin,
            number_of_technical_bins: number_of_bins,
            user_bin_idx: self.data.positions[j],
        });

        tracker.update_split_max(bin_id, cardinality_per_bin);
    }

    fn backtrack_merged_bin(&mut self, merge_start: usize, j: usize, bin_id: usize, tracker: &mut MaximumBinTracker) {
        let range: Vec<usize> = (merge_start..=j).map(|g| self.data.positions[g]).collect();
        let cardinality = if !self.params.disable_estimate_union {
            toolbox::estimate_interval(&self.data.sketches, &range) as usize
        } else {
            range.iter().map(|&p| self.data.kmer_counts[p]).sum()
        };

        let mut sub_store = self.data.sub_store_for_merge(&range, bin_id);
        let child_path = sub_store.previous.bin_indices.clone();
        let lower_max_bin = process_merged_bin(&mut sub_store, self.params);

        // `child_path` already includes `bin_id`, matching the
        // `#LOWER_LEVEL_IBF_<path>` path convention: the path of a node is
        // the chain of parent technical-bin indices down to and including
        // its own position.
        self.data.hibf_layout.borrow_mut().max_bins.push(MaxBinEntry {
            previous_trace: child_path,
            fullest_technical_bin_idx: lower_max_bin,
        });

        let relaxed = (cardinality as f64 * self.data.relaxed_fpr_correction) as usize;
        tracker.update_max(bin_id, relaxed);
    }
}

/// Recurses (hierarchical binning again) or falls back to the simpler
/// single-level binner, depending on whether the merged sub-problem's
/// user-bin count fits within `tmax`.
fn process_merged_bin(sub_store: &mut DataStore, params: &BinningParams) -> usize {
    if sub_store.positions.len() > params.tmax {
        HierarchicalBinning::new(sub_store, params).execute().technical_bin_idx
    } else {
        SimpleBinning::new(sub_store, 0)
            .expect("simple binning is only used when positions.len() <= tmax")
            .execute()
            .technical_bin_idx
    }
}

fn needed_technical_bins(requested_num_ub: usize, tmax: usize) -> usize {
    crate::config::next_multiple_of_64(requested_num_ub).min(tmax)
}

/// How many levels of hierarchy a merge of `num_ubs_in_merge` user bins is
/// expected to need, given that each level can hold at most
/// `needed_tb_base` (capped) technical bins: `log_base(num_ubs_in_merge)`.
fn max_merge_levels(num_ubs_in_merge: usize, needed_tb_base: usize) -> usize {
    if num_ubs_in_merge <= 1 {
        return 1;
    }
    let base = (needed_technical_bins(num_ubs_in_merge, needed_tb_base).max(2)) as f64;
    ((num_ubs_in_merge as f64).ln() / base.ln()).ceil().max(1.0) as usize
}

#[inline]
fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}
