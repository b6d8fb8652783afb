//! Error kinds surfaced by the public API.
//!
//! The core never retries internally (see the crate-level docs): a failure
//! during build or (de)serialisation propagates, and any partially built
//! structure is discarded by the caller owning it.

use std::io;

/// Errors that can occur while configuring, building, querying or
/// (de)serialising a [`crate::HierarchicalInterleavedBloomFilter`] or a
/// standalone [`crate::InterleavedBloomFilter`].
#[derive(thiserror::Error, Debug)]
pub enum HibfError {
    /// A [`crate::Config`] failed `validate_and_set_defaults`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// `input_fn` produced zero hashes for a user bin; every user bin must be
    /// non-empty.
    #[error("user bin {0} received no hashes from input_fn")]
    EmptyUserBin(usize),

    /// Underlying I/O failure while reading or writing a serialised form.
    #[error("serialisation I/O error: {0}")]
    Io(#[from] io::Error),

    /// The binary format's version tag did not match what this build of the
    /// crate understands.
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Version this build supports.
        expected: u32,
        /// Version found in the serialised data.
        found: u32,
    },

    /// The text layout or config format could not be parsed.
    #[error("malformed layout/config text: {0}")]
    LayoutParseError(String),
}

/// Convenience alias used throughout the crate's fallible public API.
pub type Result<T> = std::result::Result<T, HibfError>;
