//! Error types for tractogram I/O.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while reading, writing or manipulating tractograms.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Header could not be parsed (bad magic, byte order or geometry).
    #[error("malformed TRK header at byte {offset}: {reason}")]
    MalformedHeader {
        /// Byte offset of the offending field.
        offset: u64,
        /// Human-readable cause.
        reason: String,
    },

    /// Header declares a version this crate cannot read.
    #[error("unsupported TRK version {version} (supported: 1, 2, 3)")]
    UnsupportedVersion {
        /// Version found in the header.
        version: i32,
    },

    /// Per-point or per-streamline field descriptors are inconsistent.
    #[error("invalid field descriptor at byte {offset}: {reason}")]
    InvalidFieldDescriptor {
        /// Byte offset of the offending descriptor.
        offset: u64,
        /// Human-readable cause.
        reason: String,
    },

    /// The record region ended before a record was complete.
    #[error(
        "truncated record for streamline {streamline} at byte {offset}: \
         expected {expected} bytes, only {available} available"
    )]
    TruncatedRecord {
        /// Byte offset where the incomplete read started.
        offset: u64,
        /// Zero-based index of the streamline being decoded.
        streamline: usize,
        /// Bytes the record requires from `offset`.
        expected: u64,
        /// Bytes that could actually be read.
        available: u64,
    },

    /// A record carries a value that cannot be valid (e.g. negative point count).
    #[error("invalid record at byte {offset}: {reason}")]
    InvalidRecord {
        /// Byte offset of the record.
        offset: u64,
        /// Human-readable cause.
        reason: String,
    },

    /// A data table is not length-synchronized with the streamlines.
    #[error("attribute '{name}' has {actual} {kind} arrays but tractogram has {expected} streamlines")]
    AttributeLengthMismatch {
        /// Attribute name.
        name: String,
        /// `"per-point"` or `"per-streamline"`.
        kind: &'static str,
        /// Number of streamlines.
        expected: usize,
        /// Number of entries in the attribute.
        actual: usize,
    },

    /// A per-point array does not have one row per point of its streamline.
    #[error("attribute '{name}' has {actual} rows for streamline {streamline}, which has {expected} points")]
    PointCountMismatch {
        /// Attribute name.
        name: String,
        /// Zero-based streamline index.
        streamline: usize,
        /// Number of points in the streamline.
        expected: usize,
        /// Number of rows in the attribute.
        actual: usize,
    },

    /// Array shape or column width disagrees with what is declared.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The affine has no inverse.
    #[error("affine is not invertible")]
    NonInvertibleAffine,

    /// A streamline with no points was found while they are disallowed.
    #[error("streamline {index} has no points and empty streamlines are disallowed")]
    EmptyStreamline {
        /// Zero-based streamline index.
        index: usize,
    },

    /// The encoder failed before the header was finalized.
    #[error("incomplete write after {written} streamlines: {source}")]
    IncompleteWrite {
        /// Streamlines fully written before the failure.
        written: usize,
        /// Root cause.
        #[source]
        source: Box<Error>,
    },

    /// Invalid option or argument.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Gzip decompression failed.
    #[error("decompression error: {0}")]
    Decompression(String),
}

impl Error {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Self::MalformedHeader {
            offset: offset as u64,
            reason: reason.into(),
        }
    }

    pub(crate) fn descriptor(offset: usize, reason: impl Into<String>) -> Self {
        Self::InvalidFieldDescriptor {
            offset: offset as u64,
            reason: reason.into(),
        }
    }

    pub(crate) fn incomplete(written: usize, source: Error) -> Self {
        match source {
            already @ Self::IncompleteWrite { .. } => already,
            other => Self::IncompleteWrite {
                written,
                source: Box::new(other),
            },
        }
    }
}
