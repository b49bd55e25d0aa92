use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by data file operations.
///
/// Key misses are never errors; lookups return `Option` instead.
#[derive(Debug, Error)]
pub enum DataFileError {
    /// The underlying filesystem read or write failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// An operation was invoked in the wrong lifecycle phase, e.g. a write
    /// after the file was sealed. Always a programming error.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// A file is missing its footer or its contents are inconsistent.
    #[error("corrupt data file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Caller input does not fit the file's record layout.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DataFileError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        DataFileError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns `true` for [`DataFileError::IllegalState`].
    #[must_use]
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, DataFileError::IllegalState(_))
    }

    /// Returns `true` for [`DataFileError::Corrupt`].
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        matches!(self, DataFileError::Corrupt { .. })
    }
}

pub type Result<T> = std::result::Result<T, DataFileError>;
