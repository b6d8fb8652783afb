//! Cardinality sketching: HyperLogLog (C6 input) and the clustering/union
//! estimation toolbox built on top of it (C6).

mod hyperloglog;
/// Union-cardinality estimation and agglomerative similarity clustering.
pub mod toolbox;

pub use hyperloglog::Hyperloglog;
