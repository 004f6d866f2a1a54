//! Error types for sonyfw.

use std::io;
use thiserror::Error;

/// Result type for sonyfw operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for sonyfw operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying byte source or sink.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A format signature was absent where one was required.
    #[error("wrong magic: {0}")]
    WrongMagic(String),

    /// A header field enumerates a version this codec does not understand.
    #[error("wrong version: {0}")]
    WrongVersion(String),

    /// A CRC, byte-sum, or digest comparison failed.
    #[error("wrong checksum: {0}")]
    WrongChecksum(String),

    /// A block-cipher frame's embedded length/end-flag was inconsistent.
    #[error("frame error: {0}")]
    FrameError(String),

    /// The feature is recognised but deliberately unimplemented.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The source ended before the structure it carried declared.
    #[error("truncated input: {0}")]
    Truncated(String),

    /// An internal table pointer (offset, index, length) was out of bounds.
    #[error("malformed input: {0}")]
    Malformed(String),
}

impl Error {
    /// True for the subset of errors the `decrypt_fdat` trial loop swallows:
    /// a wrong crypter produces frame noise, not a structural failure.
    #[must_use]
    pub fn is_frame_error(&self) -> bool {
        matches!(self, Error::FrameError(_))
    }
}
