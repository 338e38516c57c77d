// SPDX-License-Identifier: MIT

/// Result type for BlockIO operations.
pub type BlockIOResult<T = ()> = core::result::Result<T, BlockIOError>;

/// Error type for BlockIO operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockIOError {
    /// Underlying device I/O error.
    Io(&'static str),

    /// Attempted to read or write out of bounds.
    OutOfBounds,

    /// Another process holds the exclusive lock on the image.
    Busy,

    /// Unsupported operation for this backend.
    Unsupported,
}

impl BlockIOError {
    pub fn msg(&self) -> &'static str {
        match self {
            BlockIOError::Io(msg) => msg,
            BlockIOError::OutOfBounds => "Out of bounds",
            BlockIOError::Busy => "Image is locked by another process",
            BlockIOError::Unsupported => "Unsupported operation",
        }
    }
}

impl core::fmt::Display for BlockIOError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.msg())
    }
}

impl std::error::Error for BlockIOError {}
