//! Error types for vmtsig.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading images or parsing signature input.
///
/// Expected misses (a pattern that does not match, an RTTI candidate that does
/// not validate, a step that leaves the image) are not errors; those surface as
/// `None` from the scanning APIs.
#[derive(Error, Debug)]
pub enum Error {
    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid DOS signature at offset 0x{0:X}")]
    InvalidDosSignature(usize),

    #[error("invalid PE signature at offset 0x{0:X}")]
    InvalidPeSignature(usize),

    #[error("unsupported machine type: 0x{0:X}")]
    UnsupportedMachine(u16),

    #[error("unsupported optional header magic: 0x{0:X}")]
    UnsupportedOptionalHeader(u16),

    #[error("PE headers too small: expected {expected}, got {actual}")]
    HeadersTooSmall { expected: usize, actual: usize },

    #[error("section '{name}' not found")]
    SectionNotFound { name: String },

    #[error("read of {size} bytes at offset 0x{offset:X} is out of bounds (buffer length 0x{len:X})")]
    OutOfBounds { offset: usize, size: usize, len: usize },

    #[error("invalid pattern token '{token}' at position {position}")]
    InvalidPatternToken { token: String, position: usize },

    #[error("pattern is empty")]
    EmptyPattern,

    #[error("unknown step kind: {0}")]
    InvalidStepKind(i64),

    #[error("invalid step '{0}', expected KIND,OPERAND")]
    InvalidStep(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify an I/O failure on `path`, keeping "not found" distinct.
    pub(crate) fn from_read(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound {
                path: path.to_path_buf(),
            }
        } else {
            Error::ReadFailure {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}
