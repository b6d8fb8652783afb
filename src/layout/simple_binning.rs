//! Non-recursive, single-level binning (C5 supplement): distributes `x`
//! technical bins across `y` user bins, used whenever a merged sub-problem's
//! user-bin count already fits within `tmax` (no further merging needed).

use super::data_store::DataStore;
use super::layout::UserBinEntry;
use super::FullestBin;
use crate::error::{HibfError, Result};

const SENTINEL: usize = usize::MAX;

/// Distributes technical bins across user bins while minimising the
/// maximal technical-bin cardinality, via the DP:
///
/// ```text
/// M[i][0] = c_0 / (i+1)                                   (i in 0..=r)
/// M[i][j] = min_{i' in [i-r-1, i-1]} max(M[i'][j-1], c_j/(i-i'))
/// ```
/// where `r = x - y` is the surplus of technical bins over user bins.
pub struct SimpleBinning<'a> {
    data: &'a mut DataStore,
    num_user_bins: usize,
    num_technical_bins: usize,
}

impl<'a> SimpleBinning<'a> {
    /// Builds a single-level binner. `num_bins == 0` defaults to the next
    /// multiple of 64 above `num_user_bins`.
    pub fn new(data: &'a mut DataStore, num_bins: usize) -> Result<Self> {
        let num_user_bins = data.positions.len();
        let num_technical_bins = if num_bins == 0 {
            crate::config::next_multiple_of_64(num_user_bins)
        } else {
            num_bins
        };

        if num_user_bins > num_technical_bins {
            return Err(HibfError::InvalidConfig(
                "cannot have fewer technical bins than user bins in simple binning; use hierarchical binning instead"
                    .into(),
            ));
        }

        data.technical_bin_counts
            .borrow_mut()
            .insert(data.previous.bin_indices.clone(), num_technical_bins);

        Ok(Self {
            data,
            num_user_bins,
            num_technical_bins,
        })
    }

    /// Number of technical bins this instance was configured with.
    pub fn num_technical_bins(&self) -> usize {
        self.num_technical_bins
    }

    /// Runs the DP and writes one [`UserBinEntry`] per user bin into the
    /// shared layout, returning the fullest technical bin.
    pub fn execute(self) -> FullestBin {
        let x = self.num_technical_bins;
        let y = self.num_user_bins;
        if y == 0 {
            return FullestBin {
                technical_bin_idx: 0,
                corrected_size: 0,
                is_merged: false,
            };
        }
        let r = x - y;

        let mut m = vec![vec![0usize; y]; x];
        let mut trace = vec![vec![SENTINEL; y]; x];

        let cardinalities: Vec<usize> = self
            .data
            .positions
            .iter()
            .map(|&p| self.data.kmer_counts[p])
            .collect();
        let cardinality = |j: usize| -> usize { cardinalities[j] };

        for i in 0..=r {
            m[i][0] = div_ceil(cardinality(0), i + 1);
            trace[i][0] = SENTINEL;
        }

        for j in 1..y {
            for i in 0..x {
                if i < j {
                    // Not enough technical bins yet to cover j+1 user bins.
                    continue;
                }
                let lower = i.saturating_sub(r + 1);
                let upper = i; // exclusive, loop i' in [lower, i)
                let mut best_score = usize::MAX;
                let mut best_i_prime = SENTINEL;
                for i_prime in lower..upper {
                    if i_prime < j - 1 {
                        continue;
                    }
                    let split_cost = div_ceil(cardinality(j), i - i_prime);
                    let score = split_cost.max(m[i_prime][j - 1]);
                    if score < best_score {
                        best_score = score;
                        best_i_prime = i_prime;
                    }
                }
                m[i][j] = best_score;
                trace[i][j] = best_i_prime;
            }
        }

        // Backtracking.
        let mut j = y - 1;
        let mut i = x - 1;
        let mut splits = vec![0usize; y];
        while j > 0 {
            let next_i = trace[i][j];
            splits[j] = i - next_i;
            i = next_i;
            j -= 1;
        }
        splits[0] = i + 1;

        let mut max_cardinality = 0usize;
        let mut max_bin_start = 0usize;
        let mut start = 0usize;
        let mut layout = self.data.hibf_layout.borrow_mut();
        for (j, &split_count) in splits.iter().enumerate() {
            let ub_cardinality = cardinality(j);
            let corrected = (ub_cardinality as f64 * self.data.fpr_correction.get(split_count)) as usize;
            let per_bin = div_ceil(corrected, split_count);
            if per_bin > max_cardinality {
                max_cardinality = per_bin;
                max_bin_start = start;
            }

            layout.user_bins.push(UserBinEntry {
                previous_trace: self.data.previous.bin_indices.clone(),
                technical_bin_idx: start,
                number_of_technical_bins: split_count,
                user_bin_idx: self.data.positions[j],
            });

            start += split_count;
        }

        FullestBin {
            technical_bin_idx: max_bin_start,
            corrected_size: max_cardinality,
            is_merged: false,
        }
    }
}

#[inline]
fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}
