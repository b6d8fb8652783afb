//! hibf: a Hierarchical Interleaved Bloom Filter for approximate multi-bin
//! set-membership queries over large collections of user bins.
#![deny(missing_docs)]

/// Dense bit-vector storage (C1).
pub mod bitvector;
/// Build configuration (§6.1).
pub mod config;
/// Integer counting vectors combined in bulk against a bit-vector (C2).
pub mod counting;
/// Error kinds surfaced by the public API (§7).
pub mod error;
/// False-positive-rate correction tables (C4).
pub mod fpr;
/// Hierarchical Interleaved Bloom Filter: builder and query agents (C7, C8).
pub mod hibf;
/// Interleaved Bloom Filter and its query agents (C3).
pub mod ibf;
/// A thin capability wrapper `input_fn` uses to forward hashes into a sketch
/// or a collection buffer.
pub mod insert_iterator;
/// Layout computation: the hierarchical binning DP (C5).
pub mod layout;
/// Cardinality sketching and the clustering/union toolbox built on it (C6).
pub mod sketch;
/// Concurrent build-phase timers (observability only).
pub mod timer;

pub use config::Config;
pub use error::{HibfError, Result};
pub use hibf::{HibfCountingAgent, HibfMembershipAgent, HierarchicalInterleavedBloomFilter};
pub use ibf::{ContainmentAgent, CountingAgent, InterleavedBloomFilter, MembershipAgent};
