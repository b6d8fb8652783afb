//! Hierarchical Interleaved Bloom Filter (C7 builder, C8 query agents).
//!
//! Builds a tree of [`InterleavedBloomFilter`]s from a [`crate::Config`],
//! driven by the layout the hierarchical binning DP (C5) computes, and
//! answers membership/counting queries over that tree.

use std::collections::HashMap;
use std::io::{Read, Write};

use crate::config::Config;
use crate::counting::Counter;
use crate::error::{HibfError, Result};
use crate::fpr::{bin_size_in_bits, relaxed_fpr_correction, FprCorrection};
use crate::ibf::InterleavedBloomFilter;
use crate::insert_iterator::InsertIterator;
use crate::layout::{compute_layout, BinningParams, MaxBinEntry, UserBinEntry};
use crate::sketch::Hyperloglog;
use crate::timer::ConcurrentTimer;

/// Sentinel marking a technical bin as holding no direct user bin, either
/// because it descends into a lower-level IBF (check `child_of` for that) or
/// because it is genuinely unused spare capacity.
pub const MERGED: i64 = -1;

const HIBF_FORMAT_VERSION: u32 = 1;

/// A tree of [`InterleavedBloomFilter`]s. Technical bin `b` of `ibfs[i]`
/// either names a user bin directly (`bin_to_user[i][b] >= 0`) or descends
/// into a lower-level IBF (`child_of[i][b] != i`); a bin that is neither is
/// unused spare capacity (`bin_to_user[i][b] == MERGED` and
/// `child_of[i][b] == i`).
pub struct HierarchicalInterleavedBloomFilter {
    ibfs: Vec<InterleavedBloomFilter>,
    /// `bin_to_user[ibf][bin]`: the user bin id that technical bin holds
    /// directly, or [`MERGED`] if it holds none (either genuinely empty or
    /// it descends into a child IBF).
    bin_to_user: Vec<Vec<i64>>,
    /// `child_of[ibf][bin]`: the index of the lower-level IBF that bin
    /// descends into, or `ibf` itself (self-referencing) if the bin is a
    /// leaf (no descent).
    child_of: Vec<Vec<usize>>,
    /// `parent_of[ibf]`: `(parent_ibf, parent_bin)` this IBF hangs off of,
    /// or `None` for the root (`ibfs[0]`).
    parent_of: Vec<Option<(usize, usize)>>,
    /// Total number of user bins across the whole hierarchy.
    number_of_user_bins: usize,

    /// Time spent computing every user bin's HyperLogLog sketch.
    pub layout_compute_sketches_timer: ConcurrentTimer,
    /// Time spent precomputing HyperLogLog union estimates for the DP.
    pub layout_union_estimation_timer: ConcurrentTimer,
    /// Time spent on content-similarity rearrangement.
    pub layout_rearrangement_timer: ConcurrentTimer,
    /// Time spent running the hierarchical binning DP itself.
    pub layout_dp_algorithm_timer: ConcurrentTimer,
    /// Time spent allocating the IBF tree's storage.
    pub index_allocation_timer: ConcurrentTimer,
    /// Time spent calling `input_fn` to fetch a user bin's hash values.
    pub user_bin_io_timer: ConcurrentTimer,
    /// Time spent unioning descendant hashes into a merged bin.
    pub merge_kmers_timer: ConcurrentTimer,
    /// Time spent inserting hash values into IBF storage.
    pub fill_ibf_timer: ConcurrentTimer,
}

impl HierarchicalInterleavedBloomFilter {
    /// Builds a full hierarchy from `config`: validates it, computes a
    /// sketch and cardinality per user bin (`input_fn`'s first pass), runs
    /// the layout DP, then recursively materialises one [`InterleavedBloomFilter`]
    /// per layout node (`input_fn`'s second pass, once per node a user bin's
    /// hashes are inserted into).
    pub fn new(config: &mut Config) -> Result<Self> {
        config.validate_and_set_defaults()?;

        let input_fn: &(dyn Fn(usize, &mut InsertIterator<'_>) + Send + Sync) = config
            .input_fn
            .as_deref()
            .ok_or_else(|| HibfError::InvalidConfig("input_fn is required".into()))?;

        let n = config.number_of_user_bins;

        let layout_compute_sketches_timer = ConcurrentTimer::new();
        let (kmer_counts, sketches) = layout_compute_sketches_timer
            .measure(|| compute_sketches(input_fn, n, config.sketch_bits, config.threads))?;

        let fpr_correction = FprCorrection::build(config.maximum_fpr, config.number_of_hash_functions, config.tmax);
        let relaxed = relaxed_fpr_correction(config.maximum_fpr, config.relaxed_fpr, config.number_of_hash_functions);

        let params = BinningParams {
            tmax: config.tmax,
            alpha: config.alpha,
            maximum_fpr: config.maximum_fpr,
            relaxed_fpr: config.relaxed_fpr,
            hash_count: config.number_of_hash_functions,
            disable_estimate_union: config.disable_estimate_union,
            disable_rearrangement: config.disable_rearrangement,
            max_rearrangement_ratio: config.max_rearrangement_ratio,
        };

        let layout_dp_algorithm_timer = ConcurrentTimer::new();
        let layout_result =
            layout_dp_algorithm_timer.measure(|| compute_layout(kmer_counts.clone(), sketches.clone(), &params));

        let mut user_bins_by_path: HashMap<Vec<usize>, Vec<&UserBinEntry>> = HashMap::new();
        for ub in &layout_result.layout.user_bins {
            user_bins_by_path.entry(ub.previous_trace.clone()).or_default().push(ub);
        }

        let mut children_by_parent: HashMap<Vec<usize>, Vec<&MaxBinEntry>> = HashMap::new();
        for mb in &layout_result.layout.max_bins {
            if mb.previous_trace.is_empty() {
                continue; // the root's own entry, not a parent/child relationship
            }
            let mut parent_path = mb.previous_trace.clone();
            parent_path.pop();
            children_by_parent.entry(parent_path).or_default().push(mb);
        }

        let ctx = BuildContext {
            config,
            kmer_counts: &kmer_counts,
            sketches: &sketches,
            fpr_correction: &fpr_correction,
            relaxed_fpr_correction: relaxed,
            user_bins_by_path,
            children_by_parent,
            technical_bin_counts: &layout_result.technical_bin_counts,
            input_fn,
            index_allocation_timer: ConcurrentTimer::new(),
            user_bin_io_timer: ConcurrentTimer::new(),
            merge_kmers_timer: ConcurrentTimer::new(),
            fill_ibf_timer: ConcurrentTimer::new(),
        };

        let fragment = build_tree(&ctx, ctx.config.threads)?;
        let parent_of = derive_parent_of(fragment.ibfs.len(), &fragment.child_of);

        Ok(Self {
            ibfs: fragment.ibfs,
            bin_to_user: fragment.bin_to_user,
            child_of: fragment.child_of,
            parent_of,
            number_of_user_bins: n,
            layout_compute_sketches_timer,
            layout_union_estimation_timer: ConcurrentTimer::new(),
            layout_rearrangement_timer: ConcurrentTimer::new(),
            layout_dp_algorithm_timer,
            index_allocation_timer: ctx.index_allocation_timer,
            user_bin_io_timer: ctx.user_bin_io_timer,
            merge_kmers_timer: ctx.merge_kmers_timer,
            fill_ibf_timer: ctx.fill_ibf_timer,
        })
    }

    /// Total number of user bins across the whole hierarchy.
    pub fn number_of_user_bins(&self) -> usize {
        self.number_of_user_bins
    }

    /// Number of IBFs in the hierarchy (the root plus every lower-level
    /// IBF a merge created).
    pub fn number_of_ibfs(&self) -> usize {
        self.ibfs.len()
    }

    fn root(&self) -> usize {
        0
    }

    /// Returns a membership agent pinned to this hierarchy.
    pub fn membership_agent(&self) -> HibfMembershipAgent<'_> {
        HibfMembershipAgent {
            hibf: self,
            result_buffer: Vec::new(),
        }
    }

    /// Returns a counting agent pinned to this hierarchy, with counter width
    /// `V`.
    pub fn counting_agent<V: Counter>(&self) -> HibfCountingAgent<'_, V> {
        HibfCountingAgent {
            hibf: self,
            result_buffer: vec![V::default(); self.number_of_user_bins],
        }
    }

    fn search_node(&self, ibf_idx: usize, values: &[u64], threshold: u64, out: &mut Vec<u64>) {
        let ibf = &self.ibfs[ibf_idx];
        let mut agent = ibf.counting_agent::<u32>();
        let counts = agent.bulk_count(values.iter().copied()).as_slice().to_vec();

        let mut bin = 0usize;
        while bin < counts.len() {
            if self.child_of[ibf_idx][bin] != ibf_idx {
                if counts[bin] > 0 {
                    self.search_node(self.child_of[ibf_idx][bin], values, threshold, out);
                }
                bin += 1;
                continue;
            }

            let user_bin = self.bin_to_user[ibf_idx][bin];
            if user_bin < 0 {
                bin += 1;
                continue;
            }

            let span = split_span(&self.bin_to_user[ibf_idx], &self.child_of[ibf_idx], ibf_idx, bin, user_bin);
            let total: u64 = counts[bin..bin + span].iter().map(|&c| c as u64).sum();
            if total >= threshold {
                out.push(user_bin as u64);
            }
            bin += span;
        }
    }

    fn count_node<V: Counter>(&self, ibf_idx: usize, values: &[u64], out: &mut [V]) {
        let ibf = &self.ibfs[ibf_idx];
        let mut agent = ibf.counting_agent::<u32>();
        let counts = agent.bulk_count(values.iter().copied()).as_slice().to_vec();

        let mut bin = 0usize;
        while bin < counts.len() {
            if self.child_of[ibf_idx][bin] != ibf_idx {
                if counts[bin] > 0 {
                    self.count_node(self.child_of[ibf_idx][bin], values, out);
                }
                bin += 1;
                continue;
            }

            let user_bin = self.bin_to_user[ibf_idx][bin];
            if user_bin < 0 {
                bin += 1;
                continue;
            }

            let span = split_span(&self.bin_to_user[ibf_idx], &self.child_of[ibf_idx], ibf_idx, bin, user_bin);
            let total: u64 = counts[bin..bin + span].iter().map(|&c| c as u64).sum();
            out[user_bin as usize] = V::from_u64(total);
            bin += span;
        }
    }

    /// Writes the hierarchy in the versioned binary layout of §6.3:
    /// `number_of_user_bins, ibfs[], child_of[], bin_to_user[]`.
    pub fn write_binary<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&HIBF_FORMAT_VERSION.to_le_bytes())?;
        w.write_all(&(self.number_of_user_bins as u64).to_le_bytes())?;
        w.write_all(&(self.ibfs.len() as u64).to_le_bytes())?;
        for ibf in &self.ibfs {
            ibf.write_binary(w)?;
        }
        for row in &self.child_of {
            w.write_all(&(row.len() as u64).to_le_bytes())?;
            for &c in row {
                w.write_all(&(c as u64).to_le_bytes())?;
            }
        }
        for row in &self.bin_to_user {
            w.write_all(&(row.len() as u64).to_le_bytes())?;
            for &b in row {
                w.write_all(&b.to_le_bytes())?;
            }
        }
        Ok(())
    }

    /// Reads a hierarchy previously written by [`Self::write_binary`].
    /// `parent_of` and every timer are reconstructed fresh; timers are
    /// observability-only and not persisted.
    pub fn read_binary<R: Read>(r: &mut R) -> Result<Self> {
        let mut version_buf = [0u8; 4];
        r.read_exact(&mut version_buf)?;
        let version = u32::from_le_bytes(version_buf);
        if version != HIBF_FORMAT_VERSION {
            return Err(HibfError::VersionMismatch {
                expected: HIBF_FORMAT_VERSION,
                found: version,
            });
        }

        let number_of_user_bins = read_u64(r)? as usize;
        let ibf_count = read_u64(r)? as usize;

        let mut ibfs = Vec::with_capacity(ibf_count);
        for _ in 0..ibf_count {
            ibfs.push(InterleavedBloomFilter::read_binary(r)?);
        }

        let mut child_of = Vec::with_capacity(ibf_count);
        for _ in 0..ibf_count {
            let len = read_u64(r)? as usize;
            let mut row = Vec::with_capacity(len);
            for _ in 0..len {
                row.push(read_u64(r)? as usize);
            }
            child_of.push(row);
        }

        let mut bin_to_user = Vec::with_capacity(ibf_count);
        for _ in 0..ibf_count {
            let len = read_u64(r)? as usize;
            let mut row = Vec::with_capacity(len);
            for _ in 0..len {
                row.push(read_i64(r)?);
            }
            bin_to_user.push(row);
        }

        let parent_of = derive_parent_of(ibf_count, &child_of);

        Ok(Self {
            ibfs,
            bin_to_user,
            child_of,
            parent_of,
            number_of_user_bins,
            layout_compute_sketches_timer: ConcurrentTimer::new(),
            layout_union_estimation_timer: ConcurrentTimer::new(),
            layout_rearrangement_timer: ConcurrentTimer::new(),
            layout_dp_algorithm_timer: ConcurrentTimer::new(),
            index_allocation_timer: ConcurrentTimer::new(),
            user_bin_io_timer: ConcurrentTimer::new(),
            merge_kmers_timer: ConcurrentTimer::new(),
            fill_ibf_timer: ConcurrentTimer::new(),
        })
    }
}

/// The length of the run of consecutive technical bins starting at `bin`
/// that all belong to the same split of `user_bin` (a user bin split across
/// several technical bins is one logical unit for threshold/count purposes).
fn split_span(bin_to_user: &[i64], child_of: &[usize], ibf_idx: usize, bin: usize, user_bin: i64) -> usize {
    let mut span = 1;
    while bin + span < bin_to_user.len()
        && child_of[bin + span] == ibf_idx
        && bin_to_user[bin + span] == user_bin
    {
        span += 1;
    }
    span
}

fn derive_parent_of(ibf_count: usize, child_of: &[Vec<usize>]) -> Vec<Option<(usize, usize)>> {
    let mut parent_of = vec![None; ibf_count];
    for (ibf_idx, row) in child_of.iter().enumerate() {
        for (bin, &child) in row.iter().enumerate() {
            if child != ibf_idx {
                parent_of[child] = Some((ibf_idx, bin));
            }
        }
    }
    parent_of
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64<R: Read>(r: &mut R) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(i64::from_le_bytes(buf))
}

#[inline]
fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Computes one [`Hyperloglog`] sketch and cardinality per user bin, the
/// build's first pass over `input_fn`. Parallelised across `threads` worker
/// threads when the `rayon` feature is enabled (each user bin is an
/// independent unit of work); falls back to a sequential loop otherwise.
fn compute_sketches(
    input_fn: &(dyn Fn(usize, &mut InsertIterator<'_>) + Send + Sync),
    n: usize,
    sketch_bits: u8,
    threads: usize,
) -> Result<(Vec<usize>, Vec<Hyperloglog>)> {
    #[cfg(feature = "rayon")]
    {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| HibfError::InvalidConfig(e.to_string()))?;

        let results: Vec<(usize, Hyperloglog)> = pool.install(|| {
            (0..n)
                .into_par_iter()
                .map(|ub| sketch_one(input_fn, ub, sketch_bits))
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(results.into_iter().unzip())
    }

    #[cfg(not(feature = "rayon"))]
    {
        let _ = threads;
        let mut kmer_counts = Vec::with_capacity(n);
        let mut sketches = Vec::with_capacity(n);
        for ub in 0..n {
            let (count, sketch) = sketch_one(input_fn, ub, sketch_bits)?;
            kmer_counts.push(count);
            sketches.push(sketch);
        }
        Ok((kmer_counts, sketches))
    }
}

fn sketch_one(
    input_fn: &(dyn Fn(usize, &mut InsertIterator<'_>) + Send + Sync),
    user_bin: usize,
    sketch_bits: u8,
) -> Result<(usize, Hyperloglog)> {
    let mut sketch = Hyperloglog::new(sketch_bits)?;
    let mut count = 0usize;
    {
        let mut it = InsertIterator::for_sketch(&mut sketch, &mut count);
        input_fn(user_bin, &mut it);
    }
    if count == 0 {
        return Err(HibfError::EmptyUserBin(user_bin));
    }
    Ok((count, sketch))
}

fn collect_values(input_fn: &(dyn Fn(usize, &mut InsertIterator<'_>) + Send + Sync), user_bin: usize) -> Vec<u64> {
    let mut values = Vec::new();
    let mut it = InsertIterator::for_collection(&mut values);
    input_fn(user_bin, &mut it);
    values
}

/// All user bin ids recursively nested under the lower-level IBF rooted at
/// `path` (its own direct user bins plus everything under its merged
/// children).
fn collect_user_bins_under(
    path: &[usize],
    user_bins_by_path: &HashMap<Vec<usize>, Vec<&UserBinEntry>>,
    children_by_parent: &HashMap<Vec<usize>, Vec<&MaxBinEntry>>,
) -> Vec<usize> {
    let mut out = Vec::new();
    if let Some(ubs) = user_bins_by_path.get(path) {
        out.extend(ubs.iter().map(|ub| ub.user_bin_idx));
    }
    if let Some(children) = children_by_parent.get(path) {
        for mb in children {
            let mut child_path = path.to_vec();
            child_path.push(*mb.previous_trace.last().expect("child path always includes own bin index"));
            out.extend(collect_user_bins_under(&child_path, user_bins_by_path, children_by_parent));
        }
    }
    out
}

fn union_estimate(members: &[usize], sketches: &[Hyperloglog]) -> usize {
    let Some((&first, rest)) = members.split_first() else {
        return 0;
    };
    let mut acc = sketches[first].clone();
    for &m in rest {
        acc.merge(&sketches[m]);
    }
    acc.estimate() as usize
}

struct BuildContext<'a> {
    config: &'a Config,
    kmer_counts: &'a [usize],
    sketches: &'a [Hyperloglog],
    fpr_correction: &'a FprCorrection,
    relaxed_fpr_correction: f64,
    user_bins_by_path: HashMap<Vec<usize>, Vec<&'a UserBinEntry>>,
    children_by_parent: HashMap<Vec<usize>, Vec<&'a MaxBinEntry>>,
    technical_bin_counts: &'a HashMap<Vec<usize>, usize>,
    input_fn: &'a (dyn Fn(usize, &mut InsertIterator<'_>) + Send + Sync),
    index_allocation_timer: ConcurrentTimer,
    user_bin_io_timer: ConcurrentTimer,
    merge_kmers_timer: ConcurrentTimer,
    fill_ibf_timer: ConcurrentTimer,
}

/// One node's self-contained slice of the hierarchy under construction: its
/// own IBF is always at local index 0, and every `child_of` entry is a local
/// index into this same fragment (a self-reference for a leaf bin, or a
/// descendant's local index for a merged one). [`Fragment::absorb`] folds a
/// child fragment in by shifting all of its local indices by the position it
/// lands at, which is how sibling subtrees built on different threads are
/// stitched back into one tree without any node ever touching another
/// thread's storage.
struct Fragment {
    ibfs: Vec<InterleavedBloomFilter>,
    bin_to_user: Vec<Vec<i64>>,
    child_of: Vec<Vec<usize>>,
}

impl Fragment {
    fn leaf(ibf: InterleavedBloomFilter, num_technical_bins: usize) -> Self {
        Self {
            ibfs: vec![ibf],
            bin_to_user: vec![vec![MERGED; num_technical_bins]],
            child_of: vec![(0..num_technical_bins).map(|_| 0usize).collect()],
        }
    }

    /// Appends `child`'s nodes, rebasing all of its internal `child_of`
    /// indices by the position they land at, and returns that position (the
    /// child's own root's new index in `self`).
    fn absorb(&mut self, mut child: Fragment) -> usize {
        let base = self.ibfs.len();
        for row in child.child_of.iter_mut() {
            for v in row.iter_mut() {
                *v += base;
            }
        }
        self.ibfs.append(&mut child.ibfs);
        self.bin_to_user.append(&mut child.bin_to_user);
        self.child_of.append(&mut child.child_of);
        base
    }
}

/// Runs [`build_node`] for the whole hierarchy under a `threads`-sized rayon
/// pool when the `rayon` feature is enabled, so sibling subtrees with
/// disjoint ancestors are materialised concurrently (§4.7's "top-level
/// parallelism"); sequential otherwise.
fn build_tree(ctx: &BuildContext, threads: usize) -> Result<Fragment> {
    #[cfg(feature = "rayon")]
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .map_err(|e| HibfError::InvalidConfig(e.to_string()))?;
        pool.install(|| build_node(ctx, Vec::new()))
    }

    #[cfg(not(feature = "rayon"))]
    {
        let _ = threads;
        build_node(ctx, Vec::new())
    }
}

/// Recursively materialises the [`InterleavedBloomFilter`] for the layout
/// node at `path`: sizes it from the FPR-corrected cardinality of its own
/// fullest technical bin, inserts every direct user bin's hashes (chunked
/// across that user bin's split), then recurses into every merged child,
/// unioning the child subtree's hashes into the parent's merged bin.
///
/// Children are built as independent [`Fragment`]s (each only ever writes
/// into its own IBFs) and, when more than one is present, are fanned out
/// over rayon's work-stealing pool — this is the concurrent half of §4.7's
/// "sibling subtrees with disjoint ancestors are built concurrently". Once a
/// child fragment returns, folding it into the parent and unioning its
/// member hashes into the parent's merged bin happens on the calling thread
/// only, which is this crate's translation of §5's "mutex array" discipline:
/// no two threads ever hold a reference into the same node's storage at the
/// same time, so the short, serialised splice the spec describes as a lock
/// section falls out of ordinary ownership instead of an explicit `Mutex`.
fn build_node(ctx: &BuildContext, path: Vec<usize>) -> Result<Fragment> {
    let empty_ubs: Vec<&UserBinEntry> = Vec::new();
    let own_user_bins = ctx.user_bins_by_path.get(&path).unwrap_or(&empty_ubs);
    let empty_children: Vec<&MaxBinEntry> = Vec::new();
    let own_children = ctx.children_by_parent.get(&path).unwrap_or(&empty_children);

    let num_technical_bins = *ctx.technical_bin_counts.get(&path).unwrap_or(&ctx.config.tmax);

    let mut bin_size_bits = 1usize;
    for ub in own_user_bins.iter() {
        let corrected = (ctx.kmer_counts[ub.user_bin_idx] as f64 * ctx.fpr_correction.get(ub.number_of_technical_bins)) as usize;
        let per_bin = div_ceil(corrected, ub.number_of_technical_bins);
        bin_size_bits = bin_size_bits.max(bin_size_in_bits(ctx.config.maximum_fpr, ctx.config.number_of_hash_functions, per_bin));
    }
    let mut child_cardinalities = Vec::with_capacity(own_children.len());
    for mb in own_children.iter() {
        let own_bin = *mb.previous_trace.last().expect("child path always includes own bin index");
        let mut child_path = path.clone();
        child_path.push(own_bin);
        let members = collect_user_bins_under(&child_path, &ctx.user_bins_by_path, &ctx.children_by_parent);
        let raw = union_estimate(&members, ctx.sketches);
        let relaxed = (raw as f64 * ctx.relaxed_fpr_correction) as usize;
        bin_size_bits = bin_size_bits.max(bin_size_in_bits(ctx.config.relaxed_fpr, ctx.config.number_of_hash_functions, relaxed));
        child_cardinalities.push((own_bin, child_path, members));
    }

    let ibf = ctx.index_allocation_timer.measure(|| {
        InterleavedBloomFilter::with_empty_bin_fraction(
            num_technical_bins,
            bin_size_bits,
            ctx.config.number_of_hash_functions,
            ctx.config.empty_bin_fraction,
        )
    })?;
    let mut frag = Fragment::leaf(ibf, num_technical_bins);

    for ub in own_user_bins.iter() {
        let values = ctx.user_bin_io_timer.measure(|| collect_values(ctx.input_fn, ub.user_bin_idx));
        let n = ub.number_of_technical_bins.max(1);
        let chunk_size = div_ceil(values.len().max(1), n);
        ctx.fill_ibf_timer.measure(|| {
            for (chunk_idx, chunk) in values.chunks(chunk_size).enumerate() {
                let bin = ub.technical_bin_idx + chunk_idx;
                for &v in chunk {
                    frag.ibfs[0].emplace(v, bin);
                }
            }
        });
        for bin in ub.technical_bin_idx..ub.technical_bin_idx + n {
            frag.bin_to_user[0][bin] = ub.user_bin_idx as i64;
        }
    }

    let child_paths: Vec<Vec<usize>> = child_cardinalities.iter().map(|(_, p, _)| p.clone()).collect();

    #[cfg(feature = "rayon")]
    let built_children: Vec<Result<Fragment>> = if child_paths.len() > 1 {
        use rayon::prelude::*;
        child_paths.into_par_iter().map(|child_path| build_node(ctx, child_path)).collect()
    } else {
        child_paths.into_iter().map(|child_path| build_node(ctx, child_path)).collect()
    };

    #[cfg(not(feature = "rayon"))]
    let built_children: Vec<Result<Fragment>> =
        child_paths.into_iter().map(|child_path| build_node(ctx, child_path)).collect();

    for ((own_bin, _child_path, members), child_frag) in child_cardinalities.into_iter().zip(built_children) {
        let child_frag = child_frag?;
        let child_root = frag.absorb(child_frag);
        frag.child_of[0][own_bin] = child_root;

        ctx.merge_kmers_timer.measure(|| -> Result<()> {
            for &user_bin_idx in &members {
                let values = collect_values(ctx.input_fn, user_bin_idx);
                ctx.fill_ibf_timer.measure(|| {
                    for v in values {
                        frag.ibfs[0].emplace(v, own_bin);
                    }
                });
            }
            Ok(())
        })?;
    }

    Ok(frag)
}

/// A stateful, non-owning view answering `membership_for` against the whole
/// hierarchy: one agent per thread, result buffer reused across calls.
pub struct HibfMembershipAgent<'h> {
    hibf: &'h HierarchicalInterleavedBloomFilter,
    result_buffer: Vec<u64>,
}

impl HibfMembershipAgent<'_> {
    /// Returns all user bin ids whose total hit count across `values`
    /// reaches `threshold`, recursively pruning any merged subtree whose
    /// parent-level bin shows zero hits.
    pub fn membership_for(&mut self, values: &[u64], threshold: u64) -> &[u64] {
        self.result_buffer.clear();
        self.hibf.search_node(self.hibf.root(), values, threshold, &mut self.result_buffer);
        self.result_buffer.sort_unstable();
        &self.result_buffer
    }

    /// No-op, exposed for API parity with the per-IBF membership agent:
    /// results are already produced in sorted order.
    pub fn sort_results(&mut self) {}
}

/// A stateful view computing per-user-bin hit counts against the whole
/// hierarchy.
pub struct HibfCountingAgent<'h, V: Counter> {
    hibf: &'h HierarchicalInterleavedBloomFilter,
    result_buffer: Vec<V>,
}

impl<V: Counter> HibfCountingAgent<'_, V> {
    /// Counts, per user bin (indexed by user bin id across the whole
    /// hierarchy), how many of `values` hit that bin.
    pub fn bulk_count(&mut self, values: &[u64]) -> &[V] {
        for v in self.result_buffer.iter_mut() {
            *v = V::default();
        }
        self.hibf.count_node(self.hibf.root(), values, &mut self.result_buffer);
        &self.result_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config(data: Vec<Vec<u64>>) -> Config {
        let data = std::sync::Arc::new(data);
        Config {
            number_of_user_bins: data.len(),
            input_fn: Some(Box::new(move |ub: usize, it: &mut InsertIterator<'_>| {
                for &v in &data[ub] {
                    it.push(v);
                }
            })),
            number_of_hash_functions: 2,
            maximum_fpr: 0.05,
            relaxed_fpr: 0.3,
            threads: 1,
            sketch_bits: 8,
            tmax: 4,
            alpha: 1.0,
            empty_bin_fraction: 0.0,
            max_rearrangement_ratio: 0.5,
            disable_estimate_union: true,
            disable_rearrangement: true,
        }
    }

    #[test]
    fn rejects_empty_user_bin() {
        let mut config = make_config(vec![vec![1, 2, 3], vec![]]);
        config.validate_and_set_defaults().unwrap();
        let err = HierarchicalInterleavedBloomFilter::new(&mut config).unwrap_err();
        assert!(matches!(err, HibfError::EmptyUserBin(1)));
    }

    #[test]
    fn membership_finds_exact_matches_across_all_user_bins() {
        let mut config = make_config(vec![
            (0..200u64).collect(),
            (1000..1200u64).collect(),
            (2000..2200u64).collect(),
        ]);
        config.validate_and_set_defaults().unwrap();
        let hibf = HierarchicalInterleavedBloomFilter::new(&mut config).unwrap();

        let mut agent = hibf.membership_agent();
        let hits = agent.membership_for(&[5, 1005], 1).to_vec();
        assert_eq!(hits, vec![0, 1]);

        let hits = agent.membership_for(&[99999], 1).to_vec();
        assert!(hits.is_empty());
    }

    #[test]
    fn counting_matches_membership_threshold() {
        let mut config = make_config(vec![(0..500u64).collect(), (10_000..10_300u64).collect()]);
        config.validate_and_set_defaults().unwrap();
        let hibf = HierarchicalInterleavedBloomFilter::new(&mut config).unwrap();

        let query: Vec<u64> = vec![1, 2, 3, 10_001, 10_002];
        let mut counting = hibf.counting_agent::<u32>();
        let counts = counting.bulk_count(&query).to_vec();
        assert_eq!(counts[0], 3);
        assert_eq!(counts[1], 2);

        let mut membership = hibf.membership_agent();
        let hits = membership.membership_for(&query, 2).to_vec();
        assert_eq!(hits, vec![0, 1]);
    }

    #[test]
    fn tight_tmax_forces_a_multi_level_hierarchy() {
        let bins: Vec<Vec<u64>> = (0..40).map(|i| (i * 100..i * 100 + 80).collect()).collect();
        let mut config = make_config(bins);
        config.tmax = 4;
        config.validate_and_set_defaults().unwrap();
        let hibf = HierarchicalInterleavedBloomFilter::new(&mut config).unwrap();

        assert!(hibf.number_of_ibfs() > 1, "a tight tmax should force at least one merge");

        let mut agent = hibf.membership_agent();
        for ub in 0..40usize {
            let probe = (ub as u64) * 100 + 5;
            let hits = agent.membership_for(&[probe], 1).to_vec();
            assert!(hits.contains(&(ub as u64)), "user bin {ub} not found for probe {probe}");
        }
    }

    #[test]
    fn binary_roundtrip_preserves_queries() {
        let mut config = make_config(vec![(0..100u64).collect(), (5000..5100u64).collect()]);
        config.validate_and_set_defaults().unwrap();
        let hibf = HierarchicalInterleavedBloomFilter::new(&mut config).unwrap();

        let mut buf = Vec::new();
        hibf.write_binary(&mut buf).unwrap();
        let loaded = HierarchicalInterleavedBloomFilter::read_binary(&mut std::io::Cursor::new(buf)).unwrap();

        let mut agent = loaded.membership_agent();
        assert_eq!(agent.membership_for(&[5], 1).to_vec(), vec![0]);
        assert_eq!(agent.membership_for(&[5005], 1).to_vec(), vec![1]);
    }

    #[test]
    fn threads_can_exceed_one_under_rayon() {
        // tmax = 4 against 16 user bins forces several merged subtrees, so a
        // multi-threaded build exercises build_node's sibling fan-out, not
        // just compute_sketches's.
        let bins: Vec<Vec<u64>> = (0..16).map(|i| (i * 50..i * 50 + 40).collect()).collect();
        let mut config = make_config(bins);
        config.threads = 4;
        config.tmax = 4;
        config.validate_and_set_defaults().unwrap();
        let hibf = HierarchicalInterleavedBloomFilter::new(&mut config).unwrap();
        assert_eq!(hibf.number_of_user_bins(), 16);
        assert!(hibf.number_of_ibfs() > 1, "tmax=4 over 16 bins should force a merge");

        let mut agent = hibf.membership_agent();
        for ub in 0..16usize {
            let probe = (ub as u64) * 50 + 5;
            let hits = agent.membership_for(&[probe], 1).to_vec();
            assert!(hits.contains(&(ub as u64)), "user bin {ub} not found for probe {probe}");
        }
    }
}
