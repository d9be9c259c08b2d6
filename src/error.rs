//! Error type shared by every fallible operation in the crate.

use crate::filter::FilterState;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while building, mutating or persisting a filter.
#[derive(Debug, Error)]
pub enum Error {
    /// An underlying filesystem or mapping operation failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// The temporary file holding a freshly written filter could not be renamed into place.
    #[error("persist: {0}")]
    Persist(#[from] tempfile::PersistError),

    /// No filter file exists at the given path.
    #[error("filter not found: {}", .0.display())]
    FilterNotFound(PathBuf),

    /// The two filters have different bit array lengths and cannot be merged.
    #[error("filters are not conformable: {left} bytes vs {right} bytes")]
    NonConformableMerge {
        /// Byte length of the receiving filter.
        left: usize,
        /// Byte length of the filter being merged in.
        right: usize,
    },

    /// A save, load or merge is already in flight on this filter.
    #[error("filter is busy ({0:?})")]
    Busy(FilterState),

    /// The filter configuration violates one of its preconditions.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A value supplied in hex mode is not valid hexadecimal.
    #[error("value is not valid hexadecimal")]
    InvalidHex,

    /// A raw value does not carry enough bits to feed every slice.
    #[error("raw value is {available} bits wide, {needed} are required")]
    DigestTooNarrow {
        /// Bits consumed by the configured slices.
        needed: usize,
        /// Bits the value actually provides.
        available: usize,
    },

    /// A codec stage recorded in a file could not be reversed.
    #[error("codec stage {stage} failed: {reason}")]
    CodecStage {
        /// Name of the failing stage.
        stage: &'static str,
        /// Message from the compression library.
        reason: String,
    },

    /// The codec envelope of a file is malformed.
    #[error("corrupt codec envelope: {0}")]
    CorruptEnvelope(String),

    /// The fingerprint stored in the header does not match the decoded bit array.
    #[error("fingerprint mismatch: header has {expected}, payload hashes to {actual}")]
    FingerprintMismatch {
        /// Hex fingerprint prefix read from the header.
        expected: String,
        /// Hex fingerprint prefix computed over the payload.
        actual: String,
    },

    /// The bit store has already been released.
    #[error("bit store is closed")]
    Closed,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
