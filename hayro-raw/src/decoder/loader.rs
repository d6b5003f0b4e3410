//! Loading raw files into memory.
//!
//! The crate never touches the filesystem itself. Callers that want to decode files by path
//! implement [`FileLoader`] and pass the loaded bytes to [`decode`](super::decode).

use core::fmt;
use std::path::{Path, PathBuf};

use crate::buffer::OwnedBuffer;

/// Reads a whole file into an [`OwnedBuffer`].
pub trait FileLoader {
    /// Load the file at `path`.
    fn load(&self, path: &Path) -> Result<OwnedBuffer, FileError>;
}

/// Errors that occur while loading a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileError {
    /// The file does not exist.
    NotFound(PathBuf),
    /// The file exists but could not be read.
    Read {
        /// The path of the file.
        path: PathBuf,
        /// A description of the failure.
        reason: String,
    },
    /// The file is larger than the 32-bit addressing limit.
    TooLarge(PathBuf),
}

impl FileError {
    /// The path of the file that failed to load.
    pub fn path(&self) -> &Path {
        match self {
            Self::NotFound(path) | Self::TooLarge(path) | Self::Read { path, .. } => path,
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "file '{}' not found", path.display()),
            Self::Read { path, reason } => {
                write!(f, "could not read file '{}': {reason}", path.display())
            }
            Self::TooLarge(path) => write!(f, "file '{}' is too large", path.display()),
        }
    }
}

impl std::error::Error for FileError {}
