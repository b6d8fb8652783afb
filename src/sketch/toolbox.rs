//! Sketch toolbox (C6): union-cardinality estimation and greedy
//! agglomerative clustering used to reorder user bins by content similarity.

use super::Hyperloglog;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Sorts `positions` by `counts[positions[i]]` descending (the arrays of
/// counts/sketches themselves are never reordered — only the permutation
/// is).
pub fn sort_by_cardinalities(counts: &[usize], positions: &mut [usize]) {
    positions.sort_by(|&a, &b| counts[b].cmp(&counts[a]));
}

/// Estimates `|sketch(positions[j']) ∪ ... ∪ sketch(positions[j])|` for
/// every `j' <= j`, writing `estimates[j']`. Cost is `O(j)` sketch merges.
pub fn precompute_union_estimates_for(
    estimates: &mut [u64],
    sketches: &[Hyperloglog],
    counts: &[usize],
    positions: &[usize],
    j: usize,
) {
    let mut accumulator = sketches[positions[j]].clone();
    estimates[j] = counts[positions[j]] as u64;
    let mut j_prime = j;
    while j_prime > 0 {
        j_prime -= 1;
        accumulator.merge(&sketches[positions[j_prime]]);
        estimates[j_prime] = accumulator.estimate().round() as u64;
    }
}

/// Estimates `|sketch(positions[0]) ∪ ... ∪ sketch(positions[j])|` for every
/// `j`, writing `estimates[j]`.
pub fn precompute_initial_union_estimates(
    estimates: &mut [u64],
    sketches: &[Hyperloglog],
    counts: &[usize],
    positions: &[usize],
) {
    if positions.is_empty() {
        return;
    }
    let mut accumulator = sketches[positions[0]].clone();
    estimates[0] = counts[positions[0]] as u64;
    for j in 1..positions.len() {
        accumulator.merge(&sketches[positions[j]]);
        estimates[j] = accumulator.estimate().round() as u64;
    }
}

/// Estimates the union cardinality of the sketches at `positions`.
pub fn estimate_interval(sketches: &[Hyperloglog], positions: &[usize]) -> u64 {
    if positions.is_empty() {
        return 0;
    }
    let mut accumulator = sketches[positions[0]].clone();
    for &p in &positions[1..] {
        accumulator.merge(&sketches[p]);
    }
    accumulator.estimate().round() as u64
}

/// A node in the agglomerative clustering tree: either a leaf (both
/// `left == right == id`) or an internal node whose `hll` is the union of
/// its subtree while it is still an active root.
#[derive(Clone, Debug)]
struct ClusteringNode {
    left: usize,
    right: usize,
    hll: Hyperloglog,
}

#[derive(Clone, Debug)]
struct Neighbor {
    id: usize,
    dist: f64,
}

impl PartialEq for Neighbor {
    fn eq(&self, other: &Self) -> bool {
        self.dist == other.dist
    }
}
impl Eq for Neighbor {}
impl PartialOrd for Neighbor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Neighbor {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap (a max-heap) acts as a min-heap on `dist`.
        other
            .dist
            .partial_cmp(&self.dist)
            .unwrap_or(Ordering::Equal)
    }
}

struct DistanceEntry {
    id: usize,
    neighbors: BinaryHeap<Neighbor>,
}

/// Jaccard-like distance between two sketches via inclusion-exclusion on
/// their HLL union estimate: `1 - |a ∩ b| / |a ∪ b|` approximated through
/// `|a| + |b| - |a ∪ b|` for the intersection term.
fn hll_distance(a: &Hyperloglog, b: &Hyperloglog) -> f64 {
    let mut union_sketch = a.clone();
    union_sketch.merge(b);
    let union_est = union_sketch.estimate().max(1.0);
    let a_est = a.estimate();
    let b_est = b.estimate();
    let intersection_est = (a_est + b_est - union_est).max(0.0);
    1.0 - (intersection_est / union_est)
}

/// Performs an agglomerative clustering variant over the half-open interval
/// `[first, last)` of `positions`, appending the resulting order to
/// `permutation`.
pub fn cluster_bins(
    sketches: &[Hyperloglog],
    positions: &[usize],
    permutation: &mut Vec<usize>,
    first: usize,
    last: usize,
) {
    let n = last - first;
    if n == 0 {
        return;
    }
    if n == 1 {
        permutation.push(positions[first]);
        return;
    }

    // clustering[0..n) are the leaves; new internal nodes are appended as
    // clusters merge.
    let mut clustering: Vec<ClusteringNode> = (0..n)
        .map(|i| ClusteringNode {
            left: i,
            right: i,
            hll: sketches[positions[first + i]].clone(),
        })
        .collect();

    let mut dist: Vec<DistanceEntry> = Vec::with_capacity(n);
    for i in 0..n {
        let mut heap = BinaryHeap::new();
        for j in 0..n {
            if i != j {
                let d = hll_distance(&clustering[i].hll, &clustering[j].hll);
                heap.push(Neighbor { id: j, dist: d });
            }
        }
        dist.push(DistanceEntry { id: i, neighbors: heap });
    }

    // remaining[original_index] = current position in `dist`, or None if
    // that cluster has been merged away.
    let mut remaining: Vec<Option<usize>> = (0..n).map(Some).collect();
    let mut active = n;

    while active > 1 {
        // Find the globally closest valid pair by scanning each entry's
        // nearest still-active neighbor, pruning stale heap tops lazily.
        let mut best: Option<(usize, usize, f64)> = None; // (dist_idx_a, neighbor_id, dist)
        for (slot, entry) in dist.iter_mut().enumerate() {
            if remaining[entry.id].is_none() {
                continue;
            }
            while let Some(top) = entry.neighbors.peek() {
                if remaining[top.id].is_none() {
                    entry.neighbors.pop();
                } else {
                    break;
                }
            }
            if let Some(top) = entry.neighbors.peek() {
                let is_better = match &best {
                    None => true,
                    Some((_, _, best_dist)) => top.dist < *best_dist,
                };
                if is_better {
                    best = Some((slot, top.id, top.dist));
                }
            }
        }

        let Some((slot_a, id_b, _)) = best else { break };
        let id_a = dist[slot_a].id;

        let new_hll = {
            let mut merged = clustering[id_a].hll.clone();
            merged.merge(&clustering[id_b].hll);
            merged
        };
        let new_node_id = clustering.len();
        clustering.push(ClusteringNode {
            left: id_a,
            right: id_b,
            hll: new_hll,
        });

        // Retire both children, install the new cluster where `id_a` was.
        remaining[id_a] = None;
        remaining[id_b] = None;
        remaining.push(Some(slot_a));
        let new_remaining_id = remaining.len() - 1;

        let mut heap = BinaryHeap::new();
        for (other_slot, entry) in dist.iter().enumerate() {
            if other_slot == slot_a || remaining[entry.id].is_none() {
                continue;
            }
            let d = hll_distance(&clustering[new_node_id].hll, &clustering[entry.id].hll);
            heap.push(Neighbor {
                id: new_remaining_id,
                dist: d,
            });
        }
        dist[slot_a] = DistanceEntry {
            id: new_node_id,
            neighbors: heap,
        };
        // Re-point every other entry's self-id bookkeeping isn't needed: we
        // look up cluster membership through `remaining`, not entry order.
        remaining[new_remaining_id] = Some(slot_a);

        active -= 1;
    }

    // Whatever single id remains active is the clustering tree's root.
    let root = remaining
        .iter()
        .enumerate()
        .find_map(|(id, slot)| slot.map(|_| id))
        .unwrap_or(n - 1);

    trace(&clustering, permutation, root, positions, first);
}

/// Depth-first traversal of the clustering tree, appending the left-to-right
/// leaf order (original `positions` values) to `permutation`.
///
/// A node is a leaf iff it is its own `left`/`right` child (how the initial
/// per-bin clusters are constructed); internal nodes always point at two
/// distinct, previously-built children.
fn trace(clustering: &[ClusteringNode], permutation: &mut Vec<usize>, id: usize, positions: &[usize], first: usize) {
    let node = &clustering[id];
    if node.left == id && node.right == id {
        permutation.push(positions[first + id]);
        return;
    }
    trace(clustering, permutation, node.left, positions, first);
    trace(clustering, permutation, node.right, positions, first);
}

/// Rearranges `positions` so that, within intervals of geometrically
/// similar cardinality (ratio bounded by `max_ratio`), similar-content bins
/// end up close together.
pub fn rearrange_bins(sketches: &[Hyperloglog], counts: &[usize], positions: &mut Vec<usize>, max_ratio: f64) {
    if positions.len() < 2 || max_ratio <= 0.0 {
        return;
    }

    let mut permutation = Vec::with_capacity(positions.len());
    let mut interval_start = 0usize;
    while interval_start < positions.len() {
        let start_cardinality = counts[positions[interval_start]].max(1) as f64;
        let mut interval_end = interval_start + 1;
        while interval_end < positions.len() {
            let cardinality = counts[positions[interval_end]].max(1) as f64;
            if cardinality / start_cardinality < max_ratio {
                break;
            }
            interval_end += 1;
        }
        cluster_bins(sketches, positions, &mut permutation, interval_start, interval_end);
        interval_start = interval_end;
    }

    *positions = permutation;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sketch_of(values: impl IntoIterator<Item = u64>) -> Hyperloglog {
        let mut s = Hyperloglog::new(12).unwrap();
        for v in values {
            s.add(v);
        }
        s
    }

    #[test]
    fn sort_by_cardinalities_descending() {
        let counts = vec![10, 50, 5, 30];
        let mut positions = vec![0, 1, 2, 3];
        sort_by_cardinalities(&counts, &mut positions);
        assert_eq!(positions, vec![1, 3, 0, 2]);
    }

    #[test]
    fn union_estimates_are_non_decreasing_going_left() {
        let sketches = vec![
            sketch_of(0..100),
            sketch_of(50..150),
            sketch_of(120..170),
        ];
        let counts = vec![100, 100, 50];
        let positions = vec![0, 1, 2];
        let mut estimates = vec![0u64; 3];
        precompute_union_estimates_for(&mut estimates, &sketches, &counts, &positions, 2);
        assert!(estimates[0] >= estimates[1]);
        assert!(estimates[1] >= estimates[2]);
    }

    #[test]
    fn rearrange_preserves_the_set_of_positions() {
        let sketches = vec![
            sketch_of(0..20),
            sketch_of(100..120),
            sketch_of(5..25),
            sketch_of(200..220),
        ];
        let counts = vec![20, 20, 20, 20];
        let mut positions = vec![0, 1, 2, 3];
        rearrange_bins(&sketches, &counts, &mut positions, 0.5);
        let mut sorted = positions.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
    }
}
