//! Error types that can be emitted from this library

use miette::Diagnostic;
use thiserror::Error;

use crate::item::NefsItemId;

/// Error type for library
#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    /// Transparent wrapper for [`std::io::Error`]
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    /// Transparent wrapper for [`binrw::Error`]
    #[error(transparent)]
    BinRWError(#[from] binrw::Error),

    /// file is an invalid nefs archive
    #[error("file is an invalid nefs archive")]
    InvalidArchive,

    /// unsupported nefs version {0:#010x}
    #[error("unsupported nefs version {0:#010x}")]
    UnsupportedVersion(u32),

    /// invalid argument: {0}
    #[error("invalid argument: {0}")]
    #[diagnostic(code(nefs::invalid_argument))]
    InvalidArgument(String),

    /// unsupported operation: {0}
    #[error("unsupported operation: {0}")]
    #[diagnostic(code(nefs::unsupported))]
    UnsupportedOperation(String),

    /// operation was cancelled
    #[error("operation was cancelled")]
    Cancelled,

    /// header hash mismatch
    #[error("header hash mismatch (expected {expected}, computed {actual})")]
    #[diagnostic(help("the header may be corrupted or was modified by another tool"))]
    HashMismatch {
        /// Hash stored in the header, hex encoded
        expected: String,
        /// Hash computed over the header bytes, hex encoded
        actual: String,
    },

    /// unable to find item {0}
    #[error("unable to find item {0}")]
    ItemNotFound(NefsItemId),
}

impl Error {
    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Error::UnsupportedOperation(message.into())
    }
}

/// Generic result type with crate's Error as its error variant
pub type Result<T> = core::result::Result<T, Error>;
