//! Error handling types and result definitions for container operations.

use thiserror::Error;

/// Result type for container operations.
pub type MsiResult<T> = Result<T, MsiError>;

/// Error types surfaced by parsing, hashing and rewriting.
#[derive(Error, Debug, miette::Diagnostic)]
pub enum MsiError {
    /// Structurally invalid container: bad magic, short image, or an
    /// out-of-range sector, offset or directory id reached during a walk.
    #[error("malformed compound file: {0}")]
    Malformed(String),

    /// Well-formed input that needs a feature outside the supported envelope,
    /// such as an output large enough to require DIFAT sectors.
    #[error("unsupported compound file: {0}")]
    Unsupported(String),

    /// A caller-supplied argument was rejected before any walk started.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A stream read could not produce the requested number of bytes.
    #[error("stream read failed: {0}")]
    ReadFailed(String),

    /// The output sink failed.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for MsiError {
    fn from(error: std::io::Error) -> Self {
        MsiError::Io(error.to_string())
    }
}
